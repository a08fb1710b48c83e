use async_trait::async_trait;
use krpc_common::protocol::{Endpoint, RequestEnvelope, ResponseEnvelope, Result};

use crate::pool::ConnectionPool;

/// Delivers one request to one endpoint and returns its response.
///
/// The dispatcher only depends on this seam, so tests can substitute a
/// scripted transport for the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, request: &RequestEnvelope) -> Result<ResponseEnvelope>;
}

/// Transport over pooled persistent TCP connections.
#[derive(Clone)]
pub struct PooledTransport {
    pool: ConnectionPool,
}

impl PooledTransport {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[async_trait]
impl Transport for PooledTransport {
    async fn send(&self, endpoint: &Endpoint, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        let connection = self.pool.acquire(endpoint).await?;
        connection.call(request).await
    }
}
