//! Service registry collaborators.
//!
//! The client consumes [`ServiceDiscovery`] and the server publishes through
//! [`ServiceRegistrar`]. Liveness tracking of registered endpoints belongs to
//! the registry implementation; callers trust what `discover` returns.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryRegistry`]: registrar and discovery in one process, emitting
//!   [`TopologyChange`] events when endpoints come and go
//! - [`StaticDiscovery`]: a fixed endpoint list, for command line use

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

use crate::protocol::error::{KrpcError, Result};
use crate::protocol::Endpoint;

/// Capacity of the topology change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// A membership change reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    Added {
        interface_name: String,
        endpoint: Endpoint,
    },
    Removed {
        interface_name: String,
        endpoint: Endpoint,
    },
}

impl TopologyChange {
    pub fn interface_name(&self) -> &str {
        match self {
            TopologyChange::Added { interface_name, .. }
            | TopologyChange::Removed { interface_name, .. } => interface_name,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        match self {
            TopologyChange::Added { endpoint, .. } | TopologyChange::Removed { endpoint, .. } => {
                endpoint
            }
        }
    }
}

/// Lookup side of the registry.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Endpoints currently serving `interface_name`. Empty if none.
    async fn discover(&self, interface_name: &str) -> Result<Vec<Endpoint>>;

    /// Whether `endpoint` declared the method with `signature` safe to retry.
    async fn check_retry_supported(&self, endpoint: &Endpoint, signature: &str) -> Result<bool>;

    async fn close(&self) -> Result<()>;

    /// Topology change notifications, if the implementation produces them.
    fn subscribe(&self) -> Option<broadcast::Receiver<TopologyChange>> {
        None
    }
}

/// Publishing side of the registry.
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    /// Announces `endpoint` as a provider of `interface_name`.
    ///
    /// `retryable_signatures` lists the methods (`Interface#method(T1,T2)`)
    /// the provider considers idempotent.
    async fn register(
        &self,
        interface_name: &str,
        endpoint: Endpoint,
        retryable_signatures: Vec<String>,
    ) -> Result<()>;

    async fn deregister(&self, interface_name: &str, endpoint: &Endpoint) -> Result<()>;
}

/// A process-local registry.
///
/// Providers and consumers sharing one `Arc<InMemoryRegistry>` see each
/// other immediately; subscribers receive an event per membership change.
pub struct InMemoryRegistry {
    services: DashMap<String, BTreeSet<Endpoint>>,
    retryable: DashMap<Endpoint, HashSet<String>>,
    changes: broadcast::Sender<TopologyChange>,
    closed: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            services: DashMap::new(),
            retryable: DashMap::new(),
            changes,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KrpcError::ServiceUnavailable(
                "registry is closed".to_string(),
            ));
        }
        Ok(())
    }

    fn publish(&self, change: TopologyChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRegistrar for InMemoryRegistry {
    async fn register(
        &self,
        interface_name: &str,
        endpoint: Endpoint,
        retryable_signatures: Vec<String>,
    ) -> Result<()> {
        self.ensure_open()?;
        if interface_name.is_empty() {
            return Err(KrpcError::InvalidArgument(
                "cannot register an empty interface name".to_string(),
            ));
        }

        self.retryable
            .entry(endpoint.clone())
            .or_default()
            .extend(retryable_signatures);

        let added = self
            .services
            .entry(interface_name.to_string())
            .or_default()
            .insert(endpoint.clone());

        if added {
            tracing::info!("Registered {} at {}", interface_name, endpoint);
            self.publish(TopologyChange::Added {
                interface_name: interface_name.to_string(),
                endpoint,
            });
        }
        Ok(())
    }

    async fn deregister(&self, interface_name: &str, endpoint: &Endpoint) -> Result<()> {
        self.ensure_open()?;

        let removed = self
            .services
            .get_mut(interface_name)
            .map(|mut endpoints| endpoints.remove(endpoint))
            .unwrap_or(false);

        if removed {
            tracing::info!("Deregistered {} at {}", interface_name, endpoint);
            self.publish(TopologyChange::Removed {
                interface_name: interface_name.to_string(),
                endpoint: endpoint.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceDiscovery for InMemoryRegistry {
    async fn discover(&self, interface_name: &str) -> Result<Vec<Endpoint>> {
        self.ensure_open()?;
        Ok(self
            .services
            .get(interface_name)
            .map(|endpoints| endpoints.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn check_retry_supported(&self, endpoint: &Endpoint, signature: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self
            .retryable
            .get(endpoint)
            .map(|signatures| signatures.contains(signature))
            .unwrap_or(false))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<TopologyChange>> {
        Some(self.changes.subscribe())
    }
}

/// Discovery over a fixed endpoint list.
///
/// Interfaces without an explicit entry resolve to the fallback list. There
/// is no registry to consult for retry whitelists, so `check_retry_supported`
/// answers with the configured policy and the interface definition decides.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    by_interface: HashMap<String, Vec<Endpoint>>,
    fallback: Vec<Endpoint>,
    allow_retries: bool,
}

impl StaticDiscovery {
    /// Serves `endpoints` for every interface and allows retries.
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            by_interface: HashMap::new(),
            fallback: endpoints,
            allow_retries: true,
        }
    }

    pub fn with_interface(mut self, interface_name: impl Into<String>, endpoints: Vec<Endpoint>) -> Self {
        self.by_interface.insert(interface_name.into(), endpoints);
        self
    }

    pub fn with_retries(mut self, allow: bool) -> Self {
        self.allow_retries = allow;
        self
    }
}

#[async_trait]
impl ServiceDiscovery for StaticDiscovery {
    async fn discover(&self, interface_name: &str) -> Result<Vec<Endpoint>> {
        Ok(self
            .by_interface
            .get(interface_name)
            .unwrap_or(&self.fallback)
            .clone())
    }

    async fn check_retry_supported(&self, _endpoint: &Endpoint, _signature: &str) -> Result<bool> {
        Ok(self.allow_retries)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
