//! Runtime settings for the autobot binary.
//!
//! The bot configuration is layered: an optional JSON file, then the
//! `AUTOBOT_*` environment variables below, then command-line flags. Secrets
//! and paths live in the environment so the file can be shared.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bot::BotConfig;

/// Default base URL of the game server.
const DEFAULT_SERVER_URL: &str = lichess::LICHESS_URL;

/// Get the API token.
///
/// Priority:
/// 1. `AUTOBOT_TOKEN` env variable if set
/// 2. `LICHESS_API_TOKEN` env variable if set
pub fn get_token() -> Option<String> {
    ["AUTOBOT_TOKEN", "LICHESS_API_TOKEN"]
        .iter()
        .find_map(|name| std::env::var(name).ok())
        .filter(|token| !token.trim().is_empty())
}

/// Get the server base URL.
///
/// Priority:
/// 1. `AUTOBOT_SERVER_URL` env variable if set
/// 2. `https://lichess.org` as fallback
pub fn get_server_url() -> String {
    std::env::var("AUTOBOT_SERVER_URL").unwrap_or_else(|_| DEFAULT_SERVER_URL.to_string())
}

/// Get the config file path, if any.
///
/// `AUTOBOT_CONFIG` env variable; `--config` takes precedence.
pub fn get_config_path() -> Option<PathBuf> {
    std::env::var("AUTOBOT_CONFIG").ok().map(PathBuf::from)
}

/// Get the playing engine executable, if overridden.
///
/// `AUTOBOT_ENGINE_PATH` env variable; `--engine` takes precedence.
pub fn get_engine_path() -> Option<PathBuf> {
    std::env::var("AUTOBOT_ENGINE_PATH").ok().map(PathBuf::from)
}

/// Get the directory for daily log files.
///
/// `AUTOBOT_LOG_DIR` env variable. Unset means log to stderr only.
pub fn get_log_dir() -> Option<PathBuf> {
    std::env::var("AUTOBOT_LOG_DIR").ok().map(PathBuf::from)
}

/// Whether background evaluation is wanted.
///
/// `AUTOBOT_EVALUATION` env variable (`0`/`false` disables); unset keeps
/// the config file's choice.
pub fn get_evaluation_enabled() -> Option<bool> {
    std::env::var("AUTOBOT_EVALUATION")
        .ok()
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off"))
}

/// Read the config file at `path`, or start from defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<BotConfig> {
    let Some(path) = path else {
        return Ok(BotConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    BotConfig::from_json(&text).with_context(|| format!("invalid config file {}", path.display()))
}

/// Apply the environment layer on top of `config`.
pub fn apply_env(config: &mut BotConfig) {
    if let Some(path) = get_engine_path() {
        config.engine.spec.path = path;
    }
    if let Some(enabled) = get_evaluation_enabled() {
        config.evaluation.enabled = enabled;
    }
}
