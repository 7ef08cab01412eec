//! Configuration view and validation commands: `multitalk config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use multitalk::config::{CONFIG_FILE, MultitalkToml, config_dir};

    let dir = config_dir(project_dir);
    let config_path = dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Multi Talk Configuration");
            println!("========================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                MultitalkToml::load(&config_path)?
            } else {
                println!("No multitalk.toml found at {}", config_path.display());
                println!("Using default configuration:");
                MultitalkToml::default()
            };
            println!();
            print_sections(&toml);

            // Effective values after environment overrides
            dotenvy::dotenv().ok();
            let mut effective = toml.clone();
            effective.apply_env()?;
            println!("Effective values (with env overrides):");
            println!("  port = {}", effective.server.port);
            println!(
                "  database = \"{}\"",
                effective.database_path(project_dir).display()
            );
            println!();

            if !config_path.exists() {
                println!("Run 'multitalk config init' to create a multitalk.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No multitalk.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = MultitalkToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("multitalk.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
            }

            MultitalkToml::default().save(&config_path)?;

            println!("Created multitalk.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, dev_mode");
            println!("  - [pipeline] request_timeout_secs, reload_after_transition");
            println!("  - [currency] code, decimal_separator");
            println!();
        }
    }

    Ok(())
}

fn print_sections(toml: &multitalk::config::MultitalkToml) {
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  dev_mode = {}", toml.server.dev_mode);
    println!();

    println!("[database]");
    println!("  path = \"{}\"", toml.database.path.display());
    println!();

    println!("[pipeline]");
    println!(
        "  request_timeout_secs = {}",
        toml.pipeline.request_timeout_secs
    );
    println!(
        "  reload_after_transition = {}",
        toml.pipeline.reload_after_transition
    );
    println!();

    println!("[currency]");
    println!("  code = \"{}\"", toml.currency.code);
    println!(
        "  decimal_separator = \"{}\"",
        toml.currency.decimal_separator
    );
    println!();

    println!("[logging]");
    println!("  json = {}", toml.logging.json);
    if let Some(dir) = &toml.logging.dir {
        println!("  dir = \"{}\"", dir.display());
    }
    println!();
}
