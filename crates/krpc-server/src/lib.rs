//! krpc Server
//!
//! Hosts [`RpcService`] implementations behind a TCP listener. Each request
//! passes the per-interface token bucket before the implementation runs, and
//! connections that fall silent past the idle timeout are closed.

pub mod provider;
pub mod server;
pub mod service;

pub use provider::ServiceProvider;
pub use server::{RpcServer, ServerConfig};
pub use service::RpcService;
