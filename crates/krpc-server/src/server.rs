//! TCP server for krpc providers
//!
//! # Architecture
//!
//! The server:
//! - Listens on a TCP socket for incoming connections
//! - Spawns a tokio task for each connection
//! - Decodes request frames and hands them to the [`ServiceProvider`]
//! - Answers with the serializer the request arrived in
//! - Closes connections that stay silent longer than the idle timeout
//!
//! Heartbeats count as traffic but are never answered. A malformed frame
//! header closes the connection; a payload that cannot be decoded is
//! answered with a 400 response and a result that cannot be encoded with a
//! 500 response. In both cases the connection stays open.

use krpc_common::protocol::{
    Endpoint, KrpcError, Message, ResponseEnvelope, Result, StatusCode,
};
use krpc_common::rate_limit::{RateLimitConfig, RateLimiterRegistry};
use krpc_common::transport::tcp::{self, FramedStream};
use futures::SinkExt;
use krpc_common::transport::{Frame, FrameCodec, SerializerKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::provider::ServiceProvider;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Connections with no traffic in either direction for this long are closed
    pub idle_timeout_ms: u64,
    /// Token bucket applied to every interface without an override
    pub rate_limit: RateLimitConfig,
    /// Per-interface token buckets
    pub rate_limit_overrides: HashMap<String, RateLimitConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 12_000,
            rate_limit: RateLimitConfig::default(),
            rate_limit_overrides: HashMap::new(),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Builds the limiter registry described by this config.
    pub fn rate_limiters(&self) -> Result<RateLimiterRegistry> {
        self.rate_limit.validate()?;
        let mut registry = RateLimiterRegistry::new(self.rate_limit.clone());
        for (interface_name, config) in &self.rate_limit_overrides {
            config.validate()?;
            registry = registry.with_override(interface_name.clone(), config.clone());
        }
        Ok(registry)
    }
}

/// Accepts connections and serves requests from a [`ServiceProvider`].
///
/// # Example
///
/// ```no_run
/// use krpc_server::{RpcServer, ServerConfig, ServiceProvider};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let provider = Arc::new(ServiceProvider::default());
///     let server = RpcServer::bind("127.0.0.1:9000", provider, ServerConfig::default())
///         .await
///         .unwrap();
///     server.run().await.unwrap();
/// }
/// ```
pub struct RpcServer {
    listener: TcpListener,
    provider: Arc<ServiceProvider>,
    config: ServerConfig,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Binds the listening socket.
    pub async fn bind(
        addr: &str,
        provider: Arc<ServiceProvider>,
        config: ServerConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| KrpcError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;

        Ok(Self {
            listener,
            provider,
            config,
            shutdown: CancellationToken::new(),
        })
    }

    /// Gets the actual bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| KrpcError::Transport(format!("Failed to get local addr: {}", e)))
    }

    /// The address callers should use to reach this server.
    pub fn endpoint(&self) -> Result<Endpoint> {
        self.local_addr().map(Endpoint::from)
    }

    pub fn provider(&self) -> &Arc<ServiceProvider> {
        &self.provider
    }

    /// Cancelling the token stops the accept loop and closes every connection.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs the accept loop until the shutdown token is cancelled.
    pub async fn run(self) -> Result<()> {
        info!("krpc server listening on {}", self.local_addr()?);
        let idle_timeout = self.config.idle_timeout();

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Per-connection failures such as EMFILE must not stop the server
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            debug!("Connection established from {}", peer);
            let provider = Arc::clone(&self.provider);
            let shutdown = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, peer, provider, idle_timeout, shutdown).await {
                    warn!("Closing connection from {}: {}", peer, e);
                }
            });
        }

        info!("krpc server stopped");
        Ok(())
    }

    /// Runs the server on a background task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

/// Serves one connection until the peer leaves, it goes idle, or the server
/// shuts down.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    provider: Arc<ServiceProvider>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut framed: FramedStream = Framed::new(stream, FrameCodec::new());

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            received = tokio::time::timeout(idle_timeout, tcp::receive_frame(&mut framed)) => received,
        };

        let frame = match received {
            Err(_) => {
                info!(
                    "No traffic from {} for {}ms, closing connection",
                    peer,
                    idle_timeout.as_millis()
                );
                return Ok(());
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => {
                debug!("Connection closed by {}", peer);
                return Ok(());
            }
            Ok(Err(e)) => return Err(e),
        };

        let response = match frame.to_message() {
            Ok(Message::Request(request)) => match provider.handle_request(request).await {
                Some(response) => response,
                None => continue,
            },
            Ok(Message::Response(_)) => {
                return Err(KrpcError::Protocol(
                    "received a response frame where a request was expected".to_string(),
                ));
            }
            Err(e) if !e.is_connection_fatal() => {
                debug!("Undecodable request from {}: {}", peer, e);
                ResponseEnvelope::failure(StatusCode::BAD_REQUEST, e.to_string())
            }
            Err(e) => return Err(e),
        };

        let reply = reply_frame(response, frame.serializer, peer)?;
        if let Err(e) = framed.send(reply).await.map_err(tcp::map_io_error) {
            error!("Failed to send response to {}: {}", peer, e);
            return Err(e);
        }
    }
}

/// Frames a response. A result that cannot be encoded ends only its call:
/// the caller gets a 500 in its place and the connection stays open.
fn reply_frame(
    response: ResponseEnvelope,
    serializer: SerializerKind,
    peer: SocketAddr,
) -> Result<Frame> {
    match Frame::from_message(&Message::Response(response), serializer) {
        Ok(frame) => Ok(frame),
        Err(e) if !e.is_connection_fatal() => {
            warn!("Cannot encode response for {}: {}", peer, e);
            let failure = ResponseEnvelope::failure(
                StatusCode::INTERNAL_ERROR,
                format!("result could not be encoded: {}", e),
            );
            Frame::from_message(&Message::Response(failure), serializer)
        }
        Err(e) => Err(e),
    }
}
