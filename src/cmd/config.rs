//! Configuration view and validation commands: `bugsniper config`.

use std::path::Path;

use anyhow::Result;

use super::super::ConfigCommands;
use bugsniper::bugsniper_config::{BugsniperConfig, BugsniperToml, CONFIG_DIR, CONFIG_FILE};

pub fn cmd_config(
    project_dir: &Path,
    config_file: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let config_path = match config_file {
        Some(path) => path.to_path_buf(),
        None => project_dir.join(CONFIG_DIR).join(CONFIG_FILE),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("BugSniper Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No bugsniper.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let config = BugsniperConfig::new(
                project_dir.to_path_buf(),
                config_path.exists().then(|| config_path.clone()),
            )?;
            let mut effective = config.toml.clone();
            if effective.generator.api_key.is_some() {
                effective.generator.api_key = Some("********".to_string());
            }

            println!("Effective values (with env overrides):");
            println!();
            print!("{}", toml::to_string_pretty(&effective)?);
            println!();
            println!("  database = \"{}\"", config.db_path().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No bugsniper.toml found. Using defaults (valid).");
                return Ok(());
            }

            let config = BugsniperConfig::new(project_dir.to_path_buf(), Some(config_path))?;
            let warnings = config.validate();

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
                println!("bugsniper.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            BugsniperToml::default().save(&config_path)?;

            println!("Created bugsniper.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [generator] provider, command, model, timeout_secs");
            println!("  - [tests] runner, timeouts, validate_patches");
            println!("  - [server] host, port, db_path");
            println!();
        }
    }

    Ok(())
}
