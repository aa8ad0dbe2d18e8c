//! `merlin doctor` — Diagnose configuration and provider health.

use merlin_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("Merlin Doctor — System Diagnostics");
    println!("==================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("  ⚠️  No config file — run `merlin onboard` (using defaults)");
        issues += 1;
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  1 issue(s) found. Fix the config and run again.");
            return Ok(());
        }
    };

    if config.has_api_key() || config.providers.values().any(|p| p.api_key.is_some()) {
        println!("  ✅ API key configured");
    } else {
        println!("  ⚠️  No API key configured — set MERLIN_API_KEY or add api_key to config.toml");
        issues += 1;
    }

    for dir in &config.policy.approved_directories {
        issues += check_dir("Approved directory", dir);
    }
    for dir in &config.search.roots {
        issues += check_dir("Search root", dir);
    }

    let router = merlin_providers::build_from_config(&config);
    match router.planning_provider() {
        Ok(provider) => match provider.health_check().await {
            Ok(true) => println!("  ✅ Provider '{}' reachable", provider.name()),
            Ok(false) => {
                println!("  ⚠️  Provider '{}' answered but reported unhealthy", provider.name());
                issues += 1;
            }
            Err(e) => {
                println!("  ❌ Provider '{}' unreachable: {e}", provider.name());
                issues += 1;
            }
        },
        Err(e) => {
            println!("  ❌ {e}");
            issues += 1;
        }
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}

fn check_dir(label: &str, dir: &str) -> usize {
    let path = merlin_security::expand_tilde(dir);
    if path.is_dir() {
        println!("  ✅ {label} {dir}");
        0
    } else {
        println!("  ⚠️  {label} {dir} does not exist");
        1
    }
}
