//! Configuration view and validation commands: `devflow config`.

use std::path::Path;

use anyhow::{Context, Result, bail};

use super::super::ConfigCommands;
use devflow::config::{DEFAULT_CONFIG_PATH, DevflowConfig};

pub fn cmd_config(config_path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = DevflowConfig::resolve(config_path)?;
            println!("# Effective configuration (defaults, file, environment)");
            print!("{}", config.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let config = DevflowConfig::resolve(config_path)?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration problems:");
                for problem in &problems {
                    println!("  - {}", problem);
                }
                bail!("{} configuration problem(s) found", problems.len());
            }
        }
        Some(ConfigCommands::Init) => {
            let path = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
            if path.exists() {
                println!("{} already exists.", path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            std::fs::write(path, DevflowConfig::default().to_toml()?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Created {}", path.display());
        }
    }
    Ok(())
}
