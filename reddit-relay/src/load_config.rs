//! `load_config`: reads the static YAML settings file into a [`RelayConfig`] and collects
//! the secrets the networked adapters need from the environment.
//!
//! The YAML file never holds credentials. Tokens and client secrets are read from the
//! process environment (after `dotenvy` has loaded any `.env` file), and only the `run`
//! command asks for them, so offline commands such as `status` work without them.
//!
//! All errors are `anyhow::Error` with the offending path or variable in the message.

use std::env;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reddit_relay_core::config::RelayConfig;
use tracing::{error, info};

pub const TELEGRAM_BOT_TOKEN: &str = "TELEGRAM_BOT_TOKEN";
pub const REDDIT_CLIENT_ID: &str = "REDDIT_CLIENT_ID";
pub const REDDIT_CLIENT_SECRET: &str = "REDDIT_CLIENT_SECRET";
pub const REDDIT_USER_AGENT: &str = "REDDIT_USER_AGENT";
pub const CONSTRAINED_HOST: &str = "RELAY_CONSTRAINED_HOST";

pub const DEFAULT_USER_AGENT: &str = "reddit-telegram-forwarder/1.0";

/// Credentials for the chat and source adapters.
#[derive(Clone)]
pub struct Secrets {
    pub telegram_bot_token: String,
    pub reddit_client_id: String,
    pub reddit_client_secret: String,
    pub reddit_user_agent: String,
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("telegram_bot_token", &"<redacted>")
            .field("reddit_client_id", &self.reddit_client_id)
            .field("reddit_client_secret", &"<redacted>")
            .field("reddit_user_agent", &self.reddit_user_agent)
            .finish()
    }
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let secrets = Secrets {
            telegram_bot_token: required(TELEGRAM_BOT_TOKEN)?,
            reddit_client_id: required(REDDIT_CLIENT_ID)?,
            reddit_client_secret: required(REDDIT_CLIENT_SECRET)?,
            reddit_user_agent: env::var(REDDIT_USER_AGENT)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        };
        info!(user_agent = %secrets.reddit_user_agent, "Loaded adapter secrets from environment");
        Ok(secrets)
    }
}

fn required(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => {
            error!(variable = name, "Required environment variable missing");
            Err(anyhow!("environment variable {name} must be set"))
        }
    }
}

/// Load the YAML settings at `path`. Missing keys take their defaults, and an empty file
/// yields the default configuration. `RELAY_CONSTRAINED_HOST=1|true` forces the low-power
/// preset on top of whatever the file says. Zero timeouts, intervals and attempt counts
/// are rejected.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RelayConfig> {
    let path = path.as_ref();
    info!(config_path = ?path, "Loading configuration from file");

    let content = fs::read_to_string(path).map_err(|e| {
        error!(error = ?e, config_path = ?path, "Failed to read config file");
        anyhow!("Failed to read config file {}: {e}", path.display())
    })?;

    let mut config: RelayConfig = if content.trim().is_empty() {
        RelayConfig::default()
    } else {
        serde_yaml::from_str(&content)
            .map_err(|e| {
                error!(error = ?e, config_path = ?path, "Failed to parse config YAML");
                e
            })
            .with_context(|| format!("Failed to parse config YAML {}", path.display()))?
    };

    if env_flag(CONSTRAINED_HOST) {
        config.constrained_host = true;
    }
    let config = config.apply_constrained_host();
    config.validate().map_err(|e| {
        error!(error = %e, config_path = ?path, "Config failed validation");
        anyhow!("Invalid config file {}: {e}", path.display())
    })?;
    Ok(config)
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
