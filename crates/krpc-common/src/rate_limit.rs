//! Rate Limiting for krpc
//!
//! Server-side admission control: one token bucket per interface name.
//!
//! # Architecture
//!
//! - **[`TokenBucket`]**: fixed capacity, refilled one token per elapsed
//!   refill interval. Partial intervals do not count yet.
//! - **[`RateLimiterRegistry`]**: lazily creates one bucket per interface and
//!   hands out shared handles. Buckets of different interfaces never contend.
//!
//! A denied acquisition is answered with a rate-limited failure response by
//! the request handling path; the connection stays open.
//!
//! # Example
//!
//! ```
//! use krpc_common::rate_limit::{RateLimitConfig, RateLimiterRegistry};
//!
//! let registry = RateLimiterRegistry::new(RateLimitConfig::default());
//! let bucket = registry.get("UserService");
//!
//! // A fresh bucket starts full
//! for _ in 0..10 {
//!     assert!(bucket.try_acquire());
//! }
//! assert!(!bucket.try_acquire());
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::protocol::error::{KrpcError, Result};

/// Configuration for one token bucket.
///
/// # Example
///
/// ```
/// use krpc_common::rate_limit::RateLimitConfig;
///
/// let config = RateLimitConfig::default();
/// assert_eq!(config.capacity, 10);
/// assert_eq!(config.refill_interval_ms, 100);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of tokens, also the initial fill
    pub capacity: u64,
    /// One token is added per elapsed interval
    pub refill_interval_ms: u64,
}

impl RateLimitConfig {
    pub fn new(capacity: u64, refill_interval_ms: u64) -> Self {
        Self {
            capacity,
            refill_interval_ms,
        }
    }

    /// Rejects a zero capacity or a zero refill interval.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(KrpcError::Config(
                "rate limit capacity must be positive".to_string(),
            ));
        }
        if self.refill_interval_ms == 0 {
            return Err(KrpcError::Config(
                "rate limit refill interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_interval_ms: 100,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// A token bucket guarding one interface.
///
/// The refill and take sequence runs under a single lock so concurrent
/// callers never observe a half-updated bucket. `0 <= tokens <= capacity`
/// holds at all times.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Creates a full bucket whose refill clock starts at `now`.
    pub fn new_at(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            capacity: config.capacity,
            refill_interval: Duration::from_millis(config.refill_interval_ms.max(1)),
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: now,
            }),
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Takes one token if available, refilling as of `now`.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        let elapsed = now.saturating_duration_since(state.last_refill);
        let new_tokens = (elapsed.as_millis() / self.refill_interval.as_millis()) as u64;
        state.tokens = state.tokens.saturating_add(new_tokens).min(self.capacity);
        state.last_refill = now;

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Tokens left as of the last acquisition attempt.
    pub fn available_tokens(&self) -> u64 {
        self.state.lock().tokens
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Owns the token buckets of one server process, keyed by interface name.
///
/// Buckets are created on first lookup and live as long as the registry.
/// Racing first lookups of the same interface still produce one bucket.
#[derive(Debug)]
pub struct RateLimiterRegistry {
    default_config: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl RateLimiterRegistry {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            overrides: HashMap::new(),
            buckets: DashMap::new(),
        }
    }

    /// Uses `config` instead of the default for `interface_name`.
    ///
    /// Only affects buckets not created yet.
    pub fn with_override(mut self, interface_name: impl Into<String>, config: RateLimitConfig) -> Self {
        self.overrides.insert(interface_name.into(), config);
        self
    }

    /// Returns the bucket for `interface_name`, creating it if needed.
    ///
    /// # Panics
    ///
    /// Panics if `interface_name` is empty. Callers resolve the interface
    /// before admission, so an empty name is a bug in the caller.
    pub fn get(&self, interface_name: &str) -> Arc<TokenBucket> {
        assert!(
            !interface_name.is_empty(),
            "rate limiter requested for an empty interface name"
        );

        if let Some(bucket) = self.buckets.get(interface_name) {
            return Arc::clone(bucket.value());
        }

        let entry = self
            .buckets
            .entry(interface_name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(interface_name)
                    .unwrap_or(&self.default_config);
                tracing::debug!(
                    "Created token bucket for {} (capacity {}, refill every {}ms)",
                    interface_name,
                    config.capacity,
                    config.refill_interval_ms
                );
                Arc::new(TokenBucket::new(config))
            });
        Arc::clone(entry.value())
    }

    /// Number of interfaces with a bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
