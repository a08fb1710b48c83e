//! `krpc.toml` loading.
//!
//! ```toml
//! [application]
//! name = "user-service"
//! host = "127.0.0.1"
//! port = 9000
//! serializer = "postcard"
//!
//! [client]
//! call_timeout_ms = 2000
//! breaker_scope = "endpoint"
//!
//! [client.retry]
//! max_retries = 2
//!
//! [server]
//! idle_timeout_ms = 12000
//!
//! [server.rate_limit_overrides.UserService]
//! capacity = 50
//! ```
//!
//! Every table and key is optional.

use krpc_client::DispatchConfig;
use krpc_common::protocol::{Endpoint, KrpcError, Result};
use krpc_common::transport::SerializerKind;
use krpc_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub serializer: SerializerKind,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "krpc".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            version: env!("CARGO_PKG_VERSION").to_string(),
            serializer: SerializerKind::default(),
        }
    }
}

impl ApplicationConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.as_str(), self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KrpcConfig {
    pub application: ApplicationConfig,
    pub client: DispatchConfig,
    pub server: ServerConfig,
}

impl KrpcConfig {
    /// Loads `path`, falling back to defaults when the file does not exist.
    ///
    /// The application serializer, when set, applies to the client.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|e| {
            KrpcError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&text)
            .map_err(|e| KrpcError::Config(format!("{}: {}", path.display(), e)))?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(text).map_err(|e| KrpcError::Config(e.to_string()))?;
        config.client.serializer = config.application.serializer;
        config.server.rate_limiters()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use krpc_client::BreakerScope;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = KrpcConfig::load(&dir.path().join("krpc.toml")).unwrap();
        assert_eq!(config, KrpcConfig::default());
        assert_eq!(config.server.idle_timeout_ms, 12_000);
        assert_eq!(config.client.breaker.failure_threshold, 2);
    }

    #[test]
    fn test_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
port = 9100
serializer = "postcard"

[client]
breaker_scope = "endpoint"

[client.retry]
max_retries = 1

[server.rate_limit_overrides.UserService]
capacity = 50
"#
        )
        .unwrap();

        let config = KrpcConfig::load(file.path()).unwrap();
        assert_eq!(config.application.endpoint(), Endpoint::new("127.0.0.1", 9100));
        assert_eq!(config.client.serializer, SerializerKind::Postcard);
        assert_eq!(config.client.breaker_scope, BreakerScope::Endpoint);
        assert_eq!(config.client.retry.max_retries, 1);
        assert_eq!(config.client.retry.initial_backoff_ms, 50);

        let overrides = &config.server.rate_limit_overrides["UserService"];
        assert_eq!(overrides.capacity, 50);
        assert_eq!(overrides.refill_interval_ms, 100);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[application\nport = ").unwrap();
        assert!(matches!(
            KrpcConfig::load(file.path()),
            Err(KrpcError::Config(_))
        ));
    }

    #[test]
    fn test_zero_rate_limit_is_config_error() {
        let text = "[server.rate_limit]\ncapacity = 0\n";
        assert!(matches!(KrpcConfig::parse(text), Err(KrpcError::Config(_))));
    }
}
