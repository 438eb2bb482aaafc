//! Client-adapter configuration: `{url, token, reconnectInterval=1000ms, maxReconnectAttempts=10}`,
//! layered the same way `fabric-server`'s configuration is: defaults -> an optional
//! JSON config file -> environment variables -> `clap`-parsed CLI flags.

use std::fs;

use clap::Parser;
use serde::Deserialize;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub url: String,
    pub token: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self { url: url.into(), token: token.into(), reconnect_interval_ms: 1000, max_reconnect_attempts: 10 }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("ws://localhost:3000/ws", "")
    }
}

/// The subset of [`ClientConfig`] that may be loaded from a JSON file on disk.
#[derive(Deserialize, Default)]
struct FileConfig {
    url: Option<String>,
    token: Option<String>,
    reconnect_interval_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
}

/// CLI surface for programs embedding this adapter. Each field overrides the
/// corresponding [`ClientConfig`] value when supplied; `--config` names a JSON
/// file applied before environment variables and these flags.
#[derive(Parser, Debug)]
#[command(name = "fabric-client", about = "Storage-fabric client adapter")]
pub struct ClientArgs {
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub url: Option<String>,

    #[arg(long)]
    pub token: Option<String>,

    #[arg(long)]
    pub reconnect_interval_ms: Option<u64>,

    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,
}

impl ClientArgs {
    /// Resolves the final config by applying, in order: built-in defaults, the
    /// `--config` file (if any and if readable), `FABRIC_CLIENT_*` environment
    /// variables, then these CLI flags. A missing or malformed config file is
    /// ignored rather than fatal.
    pub fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::default();

        if let Some(path) = &self.config {
            if let Ok(contents) = fs::read_to_string(path) {
                if let Ok(file_config) = serde_json::from_str::<FileConfig>(&contents) {
                    if let Some(url) = file_config.url {
                        config.url = url;
                    }
                    if let Some(token) = file_config.token {
                        config.token = token;
                    }
                    if let Some(interval) = file_config.reconnect_interval_ms {
                        config.reconnect_interval_ms = interval;
                    }
                    if let Some(attempts) = file_config.max_reconnect_attempts {
                        config.max_reconnect_attempts = attempts;
                    }
                }
            }
        }

        if let Ok(url) = std::env::var("FABRIC_CLIENT_URL") {
            config.url = url;
        }
        if let Ok(token) = std::env::var("FABRIC_CLIENT_TOKEN") {
            config.token = token;
        }
        if let Ok(interval) = std::env::var("FABRIC_CLIENT_RECONNECT_INTERVAL_MS") {
            if let Ok(interval) = interval.parse() {
                config.reconnect_interval_ms = interval;
            }
        }
        if let Ok(attempts) = std::env::var("FABRIC_CLIENT_MAX_RECONNECT_ATTEMPTS") {
            if let Ok(attempts) = attempts.parse() {
                config.max_reconnect_attempts = attempts;
            }
        }

        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(interval) = self.reconnect_interval_ms {
            config.reconnect_interval_ms = interval;
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config.max_reconnect_attempts = attempts;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> ClientArgs {
        ClientArgs { config: None, url: None, token: None, reconnect_interval_ms: None, max_reconnect_attempts: None }
    }

    #[test]
    fn defaults_apply_when_nothing_is_overridden() {
        let config = empty_args().into_config();
        assert_eq!(config.reconnect_interval_ms, 1000);
        assert_eq!(config.max_reconnect_attempts, 10);
    }

    #[test]
    fn cli_flags_override_defaults() {
        let args = ClientArgs {
            token: Some("secret".into()),
            max_reconnect_attempts: Some(3),
            ..empty_args()
        };
        let config = args.into_config();
        assert_eq!(config.token, "secret");
        assert_eq!(config.max_reconnect_attempts, 3);
    }

    #[test]
    fn a_missing_config_file_is_ignored_rather_than_fatal() {
        let args = ClientArgs { config: Some("/nonexistent/path/to/config.json".into()), ..empty_args() };
        let config = args.into_config();
        assert_eq!(config.reconnect_interval_ms, 1000);
    }
}
