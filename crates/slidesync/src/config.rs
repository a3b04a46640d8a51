use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;

use slidesync_core::config::{ConfigError, EngineConfig};

const DEFAULT_ADMIN_BIND_ADDR: &str = "127.0.0.1:8090";

#[derive(Clone)]
pub struct AppConfig {
    pub admin_bind_addr: String,
    pub admin_token: Option<String>,
    pub engine: EngineConfig,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("admin_bind_addr", &self.admin_bind_addr)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("engine", &self.engine)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let admin_bind_addr =
            value_or_default(&lookup, "SLIDESYNC_ADMIN_BIND_ADDR", DEFAULT_ADMIN_BIND_ADDR);
        if admin_bind_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(
                "SLIDESYNC_ADMIN_BIND_ADDR must be a socket address like 127.0.0.1:8090"
                    .to_string(),
            ));
        }

        let admin_token = optional_trimmed(&lookup, "SLIDESYNC_ADMIN_TOKEN");
        if admin_token.as_ref().is_some_and(|token| token.len() < 16) {
            return Err(ConfigError::Invalid(
                "SLIDESYNC_ADMIN_TOKEN must be at least 16 characters".to_string(),
            ));
        }

        Ok(Self {
            admin_bind_addr,
            admin_token,
            engine: EngineConfig::from_lookup(&lookup)?,
        })
    }

    /// Local database path: CLI flag, then environment, then the user data dir.
    pub fn local_db_path(&self, cli_db_path: Option<PathBuf>) -> PathBuf {
        cli_db_path
            .or_else(|| self.engine.local_db_path.clone())
            .unwrap_or_else(default_db_path)
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("slidesync")
        .join("local.db")
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
