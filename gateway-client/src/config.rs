//! Gateway connection configuration: the initial URL, the identify token, the
//! implementer-supplied identify payload (intents, properties, activity/presence),
//! and the heartbeat-ack fallback used when the server never sends a `timeout_ms`.
//! Layered the same way the storage fabric's server configuration is: defaults ->
//! an optional JSON config file -> environment variables -> `clap`-parsed CLI flags.

use std::fs;

use clap::Parser;
use serde::Deserialize;
use serde_json::Value;

use crate::activity::IdentifyPayload;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub url: String,
    pub token: String,
    pub identify_payload: Value,
    pub heartbeat_ack_fallback_ms: u64,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            identify_payload: IdentifyPayload::new().to_value(),
            heartbeat_ack_fallback_ms: 500,
        }
    }

    /// Replaces the identify payload with a validated, schema-checked one built
    /// through [`IdentifyPayload`] rather than a raw [`Value`].
    pub fn with_identify_payload(mut self, payload: IdentifyPayload) -> Self {
        self.identify_payload = payload.to_value();
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new("ws://localhost:3000/gateway", "")
    }
}

/// The subset of [`GatewayConfig`] that may be loaded from a JSON file on disk --
/// `identify_payload` is built through [`IdentifyPayload`], not loaded raw.
#[derive(Deserialize, Default)]
struct FileConfig {
    url: Option<String>,
    token: Option<String>,
    heartbeat_ack_fallback_ms: Option<u64>,
}

/// CLI surface for programs embedding this gateway client. Each field overrides
/// the corresponding [`GatewayConfig`] value when supplied; `--config` names a
/// JSON file applied before environment variables and these flags.
#[derive(Parser, Debug)]
#[command(name = "gateway-client", about = "Discord-style gateway connection core")]
pub struct GatewayArgs {
    #[arg(long)]
    pub config: Option<String>,

    #[arg(long)]
    pub url: Option<String>,

    #[arg(long)]
    pub token: Option<String>,

    #[arg(long)]
    pub heartbeat_ack_fallback_ms: Option<u64>,
}

impl GatewayArgs {
    /// Resolves the final config by applying, in order: built-in defaults, the
    /// `--config` file (if any and if readable), `GATEWAY_CLIENT_*` environment
    /// variables, then these CLI flags. A missing or malformed config file is
    /// ignored rather than fatal. `identify_payload` is left at its default and
    /// set separately through [`GatewayConfig::with_identify_payload`].
    pub fn into_config(self) -> GatewayConfig {
        let mut config = GatewayConfig::default();

        if let Some(path) = &self.config {
            if let Ok(contents) = fs::read_to_string(path) {
                if let Ok(file_config) = serde_json::from_str::<FileConfig>(&contents) {
                    if let Some(url) = file_config.url {
                        config.url = url;
                    }
                    if let Some(token) = file_config.token {
                        config.token = token;
                    }
                    if let Some(fallback) = file_config.heartbeat_ack_fallback_ms {
                        config.heartbeat_ack_fallback_ms = fallback;
                    }
                }
            }
        }

        if let Ok(url) = std::env::var("GATEWAY_CLIENT_URL") {
            config.url = url;
        }
        if let Ok(token) = std::env::var("GATEWAY_CLIENT_TOKEN") {
            config.token = token;
        }
        if let Ok(fallback) = std::env::var("GATEWAY_CLIENT_HEARTBEAT_ACK_FALLBACK_MS") {
            if let Ok(fallback) = fallback.parse() {
                config.heartbeat_ack_fallback_ms = fallback;
            }
        }

        if let Some(url) = self.url {
            config.url = url;
        }
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(fallback) = self.heartbeat_ack_fallback_ms {
            config.heartbeat_ack_fallback_ms = fallback;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> GatewayArgs {
        GatewayArgs { config: None, url: None, token: None, heartbeat_ack_fallback_ms: None }
    }

    #[test]
    fn defaults_apply_when_nothing_is_overridden() {
        let config = empty_args().into_config();
        assert_eq!(config.heartbeat_ack_fallback_ms, 500);
    }

    #[test]
    fn cli_flags_override_defaults() {
        let args =
            GatewayArgs { token: Some("secret".into()), heartbeat_ack_fallback_ms: Some(250), ..empty_args() };
        let config = args.into_config();
        assert_eq!(config.token, "secret");
        assert_eq!(config.heartbeat_ack_fallback_ms, 250);
    }

    #[test]
    fn a_missing_config_file_is_ignored_rather_than_fatal() {
        let args = GatewayArgs { config: Some("/nonexistent/path/to/config.json".into()), ..empty_args() };
        let config = args.into_config();
        assert_eq!(config.heartbeat_ack_fallback_ms, 500);
    }
}
