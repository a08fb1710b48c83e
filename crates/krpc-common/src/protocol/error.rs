use thiserror::Error;

#[derive(Error, Debug)]
pub enum KrpcError {
    /// Malformed frame or header. Fatal for the connection that produced it.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload could not be encoded or decoded. Fatal for the call only.
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote side answered with a failure response.
    #[error("Remote error ({code}): {message}")]
    Remote { code: u32, message: String },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for KrpcError {
    fn from(err: serde_json::Error) -> Self {
        KrpcError::Serialization(err.to_string())
    }
}

impl From<postcard::Error> for KrpcError {
    fn from(err: postcard::Error) -> Self {
        KrpcError::Serialization(err.to_string())
    }
}

impl KrpcError {
    /// Whether the connection this error was observed on must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            KrpcError::Protocol(_)
                | KrpcError::Transport(_)
                | KrpcError::Io(_)
                | KrpcError::Timeout(_)
        )
    }

    /// Whether the error is charged to the circuit breaker of the target.
    ///
    /// Serialization failures are the caller's problem and a breaker rejection
    /// never reached the network, so neither counts.
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            KrpcError::Protocol(_)
                | KrpcError::Timeout(_)
                | KrpcError::Transport(_)
                | KrpcError::Io(_)
                | KrpcError::Remote { .. }
                | KrpcError::RateLimited(_)
                | KrpcError::ServiceNotFound(_)
        )
    }

    /// Whether a retryable method may be re-dispatched after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            KrpcError::Serialization(_) | KrpcError::InvalidArgument(_) | KrpcError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KrpcError>;
