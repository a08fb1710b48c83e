//! # krpc CLI
//!
//! Library half of the `krpc` binary:
//!
//! - [`config`]: `krpc.toml` loading
//! - [`demo`]: the `UserService` hosted by `krpc provide`
//!
//! ## Key Commands
//!
//! - `krpc provide`: host the demo service on a TCP endpoint
//! - `krpc call`: invoke a method through the full client pipeline (raw JSON output)

pub mod config;
pub mod demo;
