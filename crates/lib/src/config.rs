//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.ember/config.json`) and environment.
//! Every field has a default, so `{}` and a missing file are both valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Local inference engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where chat history is persisted.
    #[serde(default)]
    pub history: HistoryConfig,

    /// WebSocket relay settings.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Engine endpoint, model, and sampling defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Ollama base URL (default http://localhost:11434). Overridden by EMBER_ENGINE_URL env.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model used when nothing was saved and the engine lists no models. Use the exact name from `ollama list`.
    #[serde(default)]
    pub default_model: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Upper bound on generated tokens per reply.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// When true (default), loading a model the engine does not have yet downloads it first.
    #[serde(default = "default_pull_on_load")]
    pub pull_on_load: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_pull_on_load() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            pull_on_load: default_pull_on_load(),
        }
    }
}

/// History storage location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryConfig {
    /// Override the history directory. Relative paths are resolved against the config file's parent. Omit to use `history` next to the config file.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

/// Relay bind, port, and reply length.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Port for HTTP and WebSocket (default 3000). Overridden by PORT env.
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// Token cap for relay replies (default 50).
    #[serde(default = "default_relay_max_new_tokens")]
    pub max_new_tokens: u32,
}

fn default_relay_port() -> u16 {
    3000
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_max_new_tokens() -> u32 {
    50
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: default_relay_port(),
            bind: default_relay_bind(),
            max_new_tokens: default_relay_max_new_tokens(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the engine base URL: env EMBER_ENGINE_URL overrides config.
pub fn resolve_engine_base_url(engine: &EngineConfig) -> Option<String> {
    non_empty_env("EMBER_ENGINE_URL").or_else(|| {
        engine
            .base_url
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Resolve the relay port: env PORT overrides config. An unparsable PORT is ignored with a warning.
pub fn resolve_relay_port(config: &Config) -> u16 {
    match non_empty_env("PORT") {
        Some(s) => match s.parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                log::warn!("ignoring invalid PORT value {:?}", s);
                config.relay.port
            }
        },
        None => config.relay.port,
    }
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("EMBER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".ember").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, the default path, or EMBER_CONFIG_PATH. Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the history directory: `config.history.directory` if set, otherwise `history` next to the config file.
pub fn resolve_history_dir(config: &Config, config_path: &Path) -> PathBuf {
    let parent = config_parent(config_path);
    match &config.history.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                parent.join(d)
            }
        }
        _ => parent.join("history"),
    }
}
