//! Client configuration.

use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use secrecy::Secret;
use serde::Deserialize;

/// Configuration for a Minibox client.
///
/// Loaded from layered config files and `MINIBOX`-prefixed environment
/// variables (e.g. `MINIBOX__SERVER_URL`), with sensible defaults for
/// everything, so `ClientConfig::default()` talks to a local service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint of the sandbox service.
    pub server_url: String,

    /// Namespace sandboxes are created in.
    pub namespace: String,

    /// API key attached to the connection handshake, if the server
    /// runs in secure mode.
    pub api_key: Option<Secret<String>>,

    /// Base image used when a service does not name one.
    pub default_image: String,

    /// Working directory inside the sandbox; the filesystem namespace root.
    pub workdir: String,

    /// Deadline for establishing the connection.
    pub connect_timeout_ms: u64,

    /// Default deadline for single request/response calls.
    pub request_timeout_ms: u64,

    /// Deadline for sandbox creation acknowledgment.
    pub create_timeout_ms: u64,

    /// Deadline for teardown acknowledgment before the release is
    /// reported as uncertain.
    pub teardown_timeout_ms: u64,
}

impl ClientConfig {
    /// Load configuration from `minibox.*` config files (optional) and the
    /// environment. Maps `MINIBOX__REQUEST_TIMEOUT_MS=5000` onto
    /// `request_timeout_ms`.
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("minibox").required(false))
            .add_source(File::with_name("minibox.local").required(false))
            .add_source(Environment::with_prefix("MINIBOX").separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5555/channel".into(),
            namespace: "default".into(),
            api_key: None,
            default_image: "minibox/base:latest".into(),
            workdir: "/workspace".into(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            create_timeout_ms: 60_000,
            teardown_timeout_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.namespace, "default");
        assert_eq!(config.workdir, "/workspace");
        assert!(config.api_key.is_none());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_partial() {
        // Missing fields fall back to defaults.
        let config: ClientConfig =
            serde_json::from_str(r#"{"namespace": "ci", "create_timeout_ms": 5000}"#).unwrap();
        assert_eq!(config.namespace, "ci");
        assert_eq!(config.create_timeout(), Duration::from_secs(5));
        assert_eq!(config.workdir, "/workspace");
    }
}
