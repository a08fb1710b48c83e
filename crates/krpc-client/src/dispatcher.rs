use dashmap::DashMap;
use krpc_common::protocol::error::{KrpcError, Result};
use krpc_common::protocol::{Endpoint, RequestEnvelope, Value};
use krpc_common::registry::{ServiceDiscovery, TopologyChange};
use krpc_common::transport::SerializerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::heartbeat::HeartbeatConfig;
use crate::load_balancer::ConsistentHashBalancer;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::transport::{PooledTransport, Transport};

/// Configuration for retry logic with exponential backoff.
///
/// Only methods marked retryable are ever retried, and only when the
/// registry confirms the endpoint accepts retries for that method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    ///
    /// Total attempts = max_retries + 1
    /// Default: 3
    pub max_retries: usize,
    /// Initial backoff in milliseconds
    ///
    /// Default: 50ms
    pub initial_backoff_ms: u64,
    /// Maximum backoff in milliseconds
    ///
    /// Default: 5000ms (5 seconds)
    pub max_backoff_ms: u64,
    /// Exponential backoff multiplier
    ///
    /// Default: 2.0 (doubles each time)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// What a circuit breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerScope {
    /// One breaker per interface name
    #[default]
    Service,
    /// One breaker per endpoint (`host:port`)
    Endpoint,
}

/// Client-side dispatch configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Per-attempt deadline for the network round trip in milliseconds
    pub call_timeout_ms: u64,
    pub breaker_scope: BreakerScope,
    pub serializer: SerializerKind,
    pub retry: RetryConfig,
    pub breaker: CircuitBreakerConfig,
    pub pool: PoolConfig,
    pub heartbeat: HeartbeatConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            breaker_scope: BreakerScope::default(),
            serializer: SerializerKind::default(),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            pool: PoolConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Per-interface endpoint sets and hash rings.
///
/// Entries are dropped when the registry reports a change for their
/// interface. The generation counter keeps a lookup that raced with a
/// change from caching what it saw before the change.
#[derive(Default)]
struct DiscoveryCache {
    endpoints: DashMap<String, Arc<Vec<Endpoint>>>,
    balancers: DashMap<String, Arc<ConsistentHashBalancer>>,
    generation: AtomicU64,
}

impl DiscoveryCache {
    fn balancer(&self, interface_name: &str) -> Arc<ConsistentHashBalancer> {
        if let Some(balancer) = self.balancers.get(interface_name) {
            return Arc::clone(balancer.value());
        }
        self.balancers
            .entry(interface_name.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn apply(&self, change: &TopologyChange) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.endpoints.remove(change.interface_name());

        if let Some(balancer) = self.balancers.get(change.interface_name()) {
            let label = change.endpoint().label();
            match change {
                TopologyChange::Added { .. } => balancer.add_node(&label),
                TopologyChange::Removed { .. } => balancer.remove_node(&label),
            }
        }
    }

    fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.endpoints.clear();
    }
}

/// Drives outbound calls end to end.
///
/// For each attempt: resolve endpoints (cached), pick one on the hash ring,
/// ask its circuit breaker, send with a deadline, and feed the outcome back
/// to the breaker. Failed calls to retryable methods are re-dispatched with
/// the failed endpoint excluded for the rest of the call.
///
/// No breaker lock is held while waiting on the network.
pub struct Dispatcher {
    discovery: Arc<dyn ServiceDiscovery>,
    transport: Arc<dyn Transport>,
    breakers: CircuitBreakerRegistry,
    cache: Arc<DiscoveryCache>,
    config: DispatchConfig,
    shutdown: CancellationToken,
    _watcher: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Creates a dispatcher sending over pooled TCP connections.
    pub fn new(discovery: Arc<dyn ServiceDiscovery>, config: DispatchConfig) -> Self {
        let pool = ConnectionPool::with_options(
            config.pool.clone(),
            config.heartbeat.clone(),
            config.serializer,
        );
        Self::with_transport(discovery, Arc::new(PooledTransport::new(pool)), config)
    }

    /// Creates a dispatcher over an arbitrary transport.
    ///
    /// Must be called within a Tokio runtime when `discovery` publishes
    /// topology changes.
    pub fn with_transport(
        discovery: Arc<dyn ServiceDiscovery>,
        transport: Arc<dyn Transport>,
        config: DispatchConfig,
    ) -> Self {
        let cache = Arc::new(DiscoveryCache::default());
        let shutdown = CancellationToken::new();
        let watcher = discovery
            .subscribe()
            .map(|changes| spawn_watcher(changes, Arc::clone(&cache), shutdown.clone()));

        info!(
            "Dispatcher initialized (breaker scope {:?}, {} retries max)",
            config.breaker_scope, config.retry.max_retries
        );

        Self {
            discovery,
            transport,
            breakers: CircuitBreakerRegistry::new(config.breaker.clone()),
            cache,
            config,
            shutdown,
            _watcher: watcher,
        }
    }

    /// Dispatches `request` and returns the remote result.
    ///
    /// `retryable` comes from the interface definition: only idempotent
    /// methods may be re-sent after a failure.
    pub async fn dispatch(&self, request: &RequestEnvelope, retryable: bool) -> Result<Value> {
        request.validate()?;
        if request.is_heartbeat() {
            return Err(KrpcError::InvalidArgument(
                "heartbeats are sent by connections, not dispatched".to_string(),
            ));
        }

        let retry = &self.config.retry;
        let mut excluded: HashSet<String> = HashSet::new();
        let mut backoff_ms = retry.initial_backoff_ms;
        let mut attempt = 0;

        loop {
            let (endpoint, error) = match self.attempt(request, &excluded).await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };

            if !retryable || attempt >= retry.max_retries || !error.is_retryable() {
                return Err(error);
            }
            if let Some(endpoint) = &endpoint {
                if !self.retry_supported(endpoint, request).await {
                    debug!(
                        "{} does not accept retries of {}",
                        endpoint,
                        request.signature()
                    );
                    return Err(error);
                }
                excluded.insert(endpoint.label());
            }

            warn!(
                "Call {} failed (attempt {}): {}, retrying in {}ms",
                request.signature(),
                attempt + 1,
                error,
                backoff_ms
            );
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms = std::cmp::min(
                (backoff_ms as f64 * retry.backoff_multiplier) as u64,
                retry.max_backoff_ms,
            );
            attempt += 1;
        }
    }

    /// One pass through the pipeline. Failures carry the endpoint they were
    /// observed on, if one had been selected.
    async fn attempt(
        &self,
        request: &RequestEnvelope,
        excluded: &HashSet<String>,
    ) -> std::result::Result<Value, (Option<Endpoint>, KrpcError)> {
        let interface_name = &request.interface_name;

        let endpoints = self.resolve(interface_name).await.map_err(|e| (None, e))?;
        let labels: Vec<String> = endpoints.iter().map(Endpoint::label).collect();
        let label = self
            .cache
            .balancer(interface_name)
            .select_with_key(&Uuid::new_v4().to_string(), &labels, excluded)
            .map_err(|e| (None, e))?;
        let endpoint = endpoints
            .iter()
            .find(|endpoint| endpoint.label() == label)
            .cloned()
            .ok_or_else(|| {
                (
                    None,
                    KrpcError::ServiceUnavailable(format!("{} left the endpoint set", label)),
                )
            })?;

        let breaker = match self.config.breaker_scope {
            BreakerScope::Service => self.breakers.get(interface_name),
            BreakerScope::Endpoint => self.breakers.get(&label),
        };
        if !breaker.allow_request() {
            return Err((
                Some(endpoint),
                KrpcError::ServiceUnavailable(format!(
                    "circuit breaker for {} is open",
                    breaker.name()
                )),
            ));
        }

        let timeout_ms = self.config.call_timeout_ms;
        let outcome = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.transport.send(&endpoint, request),
        )
        .await
        {
            Ok(sent) => sent.and_then(|response| response.into_result()),
            Err(_) => Err(KrpcError::Timeout(timeout_ms)),
        };

        match outcome {
            Ok(value) => {
                breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.counts_as_failure() {
                    breaker.record_failure();
                }
                debug!("Call {} to {} failed: {}", request.signature(), endpoint, e);
                Err((Some(endpoint), e))
            }
        }
    }

    /// Endpoints for `interface_name`, from the cache or the registry.
    async fn resolve(&self, interface_name: &str) -> Result<Arc<Vec<Endpoint>>> {
        if let Some(endpoints) = self.cache.endpoints.get(interface_name) {
            return Ok(Arc::clone(endpoints.value()));
        }

        let generation = self.cache.generation.load(Ordering::Acquire);
        let endpoints = self.discovery.discover(interface_name).await?;
        if endpoints.is_empty() {
            return Err(KrpcError::ServiceUnavailable(format!(
                "no endpoints registered for {}",
                interface_name
            )));
        }

        let endpoints = Arc::new(endpoints);
        if self.cache.generation.load(Ordering::Acquire) == generation {
            self.cache
                .endpoints
                .insert(interface_name.to_string(), Arc::clone(&endpoints));
        }
        Ok(endpoints)
    }

    async fn retry_supported(&self, endpoint: &Endpoint, request: &RequestEnvelope) -> bool {
        match self
            .discovery
            .check_retry_supported(endpoint, &request.signature())
            .await
        {
            Ok(supported) => supported,
            Err(e) => {
                warn!("Retry check against registry failed: {}", e);
                false
            }
        }
    }

    /// Drops every cached endpoint set.
    pub fn invalidate(&self) {
        self.cache.clear();
    }

    /// Circuit breaker snapshots, sorted by breaker key.
    pub fn breaker_states(&self) -> Vec<(String, BreakerSnapshot)> {
        self.breakers.states()
    }

    /// Real nodes on the hash ring of `interface_name`.
    pub fn ring_nodes(&self, interface_name: &str) -> Vec<String> {
        self.cache
            .balancers
            .get(interface_name)
            .map(|balancer| balancer.nodes())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Stops the topology watcher and closes the registry.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.discovery.close().await
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_watcher(
    mut changes: broadcast::Receiver<TopologyChange>,
    cache: Arc<DiscoveryCache>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = changes.recv() => received,
            };
            match received {
                Ok(change) => {
                    debug!("Topology change: {:?}", change);
                    cache.apply(&change);
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!("Missed {} topology changes, dropping endpoint cache", missed);
                    cache.clear();
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
