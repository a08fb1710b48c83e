//! krpc client
//!
//! Everything between a typed call site and the wire:
//!
//! - [`ServiceProxy`]: typed call helper over an interface definition
//! - [`Dispatcher`]: discovery cache, balancing, circuit breaking, retries
//! - [`ConsistentHashBalancer`]: endpoint selection on a hash ring
//! - [`CircuitBreaker`]: per-service health gate
//! - [`ConnectionPool`]: persistent connections, each with a heartbeat task

pub mod circuit_breaker;
pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod load_balancer;
pub mod pool;
pub mod stub;
pub mod transport;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use connection::Connection;
pub use dispatcher::{BreakerScope, DispatchConfig, Dispatcher, RetryConfig};
pub use heartbeat::{spawn_heartbeat, HeartbeatConfig};
pub use load_balancer::{fnv1_32_hash, ConsistentHashBalancer, VIRTUAL_NUM};
pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use stub::ServiceProxy;
pub use transport::{PooledTransport, Transport};
