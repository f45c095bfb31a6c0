//! Configuration view and validation commands: `checkgate config`.

use anyhow::Result;
use std::path::{Path, PathBuf};

use checkgate::config::{CheckgateConfig, DEFAULT_CONFIG_FILE};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = CheckgateConfig::resolve(cli.config.as_deref())?;
            match source_file(cli) {
                Some(path) => println!("# Config file: {}", path.display()),
                None => println!("# No config file found, using defaults"),
            }
            println!("# Effective values include CHECKGATE_* overrides");
            println!();
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = CheckgateConfig::resolve(cli.config.as_deref())?;
            let errors = config.validate();

            if errors.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration errors:");
                for error in &errors {
                    println!("  - {}", error);
                }
                anyhow::bail!("Configuration has {} error(s)", errors.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            let path = cli
                .config
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            if path.exists() && !force {
                println!("{} already exists", path.display());
                println!("Use --force to overwrite it.");
                return Ok(());
            }

            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            CheckgateConfig::default().save(&path)?;
            println!("Created {}", path.display());
        }
    }

    Ok(())
}

fn source_file(cli: &Cli) -> Option<PathBuf> {
    match &cli.config {
        Some(path) => Some(path.clone()),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            default_path.exists().then(|| default_path.to_path_buf())
        }
    }
}
