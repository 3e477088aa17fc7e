//! Initialize the configuration directory: create ~/.ember, a default config, and the history directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the history directory resolved from the config.
///
/// Returns the config directory.
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let history_dir = config::resolve_history_dir(&config, config_path);
    if !history_dir.exists() {
        std::fs::create_dir_all(&history_dir)
            .with_context(|| format!("creating history directory {}", history_dir.display()))?;
        log::info!("created history directory at {}", history_dir.display());
    } else {
        log::debug!("history directory already exists at {}, skipping", history_dir.display());
    }

    Ok(config_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_config_and_history_once() {
        let dir = std::env::temp_dir().join(format!("ember-init-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let out = init_config_dir(&path).unwrap();
        assert_eq!(out, dir);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(dir.join("history").is_dir());

        std::fs::write(&path, r#"{"relay":{"port":4000}}"#).unwrap();
        init_config_dir(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("4000"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
