use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::KrpcError;

/// A `(host, port)` pair identifying one service replica.
///
/// Endpoints are labelled `host:port` on the hash ring and in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The `host:port` label used by the load balancer.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = KrpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| KrpcError::InvalidArgument(format!("endpoint '{}' has no port", s)))?;
        if host.is_empty() {
            return Err(KrpcError::InvalidArgument(format!(
                "endpoint '{}' has no host",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| KrpcError::InvalidArgument(format!("endpoint '{}': {}", s, e)))?;
        Ok(Endpoint::new(host, port))
    }
}

impl From<std::net::SocketAddr> for Endpoint {
    fn from(addr: std::net::SocketAddr) -> Self {
        Endpoint::new(addr.ip().to_string(), addr.port())
    }
}
