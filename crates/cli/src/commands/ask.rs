//! `merlin ask` — Run a query, or read queries line by line.

use merlin_agent::{ReasoningEngine, build_engine};
use merlin_config::AppConfig;
use merlin_core::chain::ReasoningChain;
use std::io::Write;
use tokio::io::{self, AsyncBufReadExt, BufReader};

pub async fn run(message: Option<String>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?;

    if !config.has_api_key() && !uses_local_provider(&config) {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    MERLIN_API_KEY=sk-...       (generic)");
        eprintln!("    OPENAI_API_KEY=sk-...       (for OpenAI direct)");
        eprintln!("    OPENROUTER_API_KEY=sk-or-... (for OpenRouter)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let engine = build_engine(&config)?;
    tracing::debug!(
        provider = %config.default_provider,
        model = %config.default_model,
        "Reasoning engine ready"
    );

    if let Some(query) = message {
        eprint!("  Thinking...");
        let chain = engine.run(query).await?;
        eprint!("\r              \r");
        print_chain(&chain, json)?;
        return Ok(());
    }

    println!();
    println!("  Merlin — Interactive Mode");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!("  Tools:     {}", engine.tools().names().join(", "));
    println!();
    println!("  Type a request and press Enter.");
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    interactive(&engine, json).await?;

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

async fn interactive(engine: &ReasoningEngine, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut lines = BufReader::new(io::stdin()).lines();

    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit" | "/exit" | "/quit" | ":q") {
            break;
        }

        eprint!("  ...");
        match engine.run(line).await {
            Ok(chain) => {
                eprint!("\r     \r");
                println!();
                print_chain(&chain, json)?;
                println!();
            }
            Err(e) => {
                eprint!("\r     \r");
                eprintln!("  [Error] {e}");
                println!();
            }
        }
    }
    Ok(())
}

fn print_chain(chain: &ReasoningChain, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    match chain.outcome() {
        Some(answer) if answer.partial => {
            let kind = answer
                .error
                .map(|k| k.to_string())
                .unwrap_or_else(|| "unknown".into());
            println!("  Merlin [partial, {kind}] >");
            for line in answer.text.lines() {
                println!("    {line}");
            }
        }
        Some(answer) => {
            for line in answer.text.lines() {
                println!("  Merlin > {line}");
            }
        }
        None => println!("  Merlin > (no answer, chain is {})", chain.state),
    }

    if json {
        println!("{}", serde_json::to_string_pretty(chain)?);
    }
    Ok(())
}

fn uses_local_provider(config: &AppConfig) -> bool {
    matches!(
        config.default_provider.as_str(),
        "ollama" | "vllm" | "llamacpp" | "llama.cpp"
    )
}
