//! Configuration view and validation commands: `devroom config`.

use anyhow::{Context, Result};
use std::path::Path;

use devroom::config::EngineConfig;

use super::super::ConfigCommands;

const REDACTED: &str = "********";

/// File, then `DEVROOM_*` environment, validated.
pub fn load_effective(config_path: &Path) -> Result<EngineConfig> {
    let mut config = EngineConfig::load_or_default(config_path)?;
    config.apply_env()?;
    config.ensure_valid()?;
    Ok(config)
}

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            let config = load_effective(config_path)?;
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("{}", redacted(config).to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let mut config = EngineConfig::load_or_default(config_path)?;
            config.apply_env()?;
            let problems = config.validate();
            if problems.is_empty() {
                println!("Configuration is valid.");
            } else {
                for problem in &problems {
                    eprintln!("  - {}", problem);
                }
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            if let Some(parent) = config_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create config directory {}", parent.display())
                })?;
            }
            std::fs::write(config_path, EngineConfig::default().to_toml()?)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
            println!("Wrote default configuration to {}", config_path.display());
        }
    }
    Ok(())
}

/// Hide credentials before printing.
fn redacted(mut config: EngineConfig) -> EngineConfig {
    if config.store.service_token.is_some() {
        config.store.service_token = Some(REDACTED.to_string());
    }
    if config.identity.ai_token.is_some() {
        config.identity.ai_token = Some(REDACTED.to_string());
    }
    config.identity.tokens = config
        .identity
        .tokens
        .into_values()
        .enumerate()
        .map(|(i, entry)| (format!("{}-{}", REDACTED, i), entry))
        .collect();
    config
}
