//! Initialize the configuration directory: create ~/.rcebot and a template config.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{self, CommandConfig, Config, UserConfig};

/// Ensure a config file exists at `config_path` before running.
pub fn require_initialized(config_path: &Path) -> Result<()> {
    if !config_path.exists() {
        bail!(
            "configuration not initialized; run `rcebot init` first (config file not found: {})",
            config_path.display()
        );
    }
    Ok(())
}

/// Template written by `rcebot init`: one placeholder user allowed to run `uptime`.
pub fn template_config() -> Config {
    Config {
        users: vec![UserConfig {
            id: 0,
            commands: vec![CommandConfig {
                name: "uptime".to_string(),
                ..CommandConfig::default()
            }],
        }],
        ..Config::default()
    }
}

/// Create the config directory and a template config if it does not exist.
/// Returns the config directory. An existing config file is left untouched.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
    } else {
        config::save_config(config_path, &template_config())?;
        log::info!("created template config at {}", config_path.display());
    }
    Ok(config_dir.to_path_buf())
}
