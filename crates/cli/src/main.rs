//! Merlin CLI — the main entry point.
//!
//! Commands:
//! - `onboard` — Write a default config
//! - `ask`     — Run one query, or read queries line by line
//! - `tools`   — List the tools the planner can use
//! - `doctor`  — Check config and provider health

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "merlin",
    about = "Merlin — a multi-step reasoning assistant for files and the terminal",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration
    Onboard,

    /// Ask Merlin to do something
    Ask {
        /// Run a single query instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Also print the finished chain as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available tools and their parameters
    Tools,

    /// Diagnose configuration and provider health
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = default_filter(cli.verbose);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Ask { message, json } => commands::ask::run(message, json).await?,
        Commands::Tools => commands::tools::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}

/// Log filter used when `RUST_LOG` is unset.
fn default_filter(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}
