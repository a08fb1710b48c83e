//! krpc Common Types and Transport
//!
//! This crate provides the protocol definitions, wire codec and server-side
//! admission control shared by the krpc client and server.
//!
//! # Overview
//!
//! krpc lets a caller invoke a method of a remote interface as if it were
//! local. The pieces every process needs live here:
//!
//! - **Protocol Layer**: request/response envelopes, dynamically typed values, errors
//! - **Transport Layer**: frame codec, pluggable serializers, framed TCP streams
//! - **Rate Limiting**: per-interface token buckets
//! - **Registry**: discovery and registration collaborator traits
//!
//! # Architecture
//!
//! - **Transport**: persistent TCP connections
//! - **Serialization**: JSON (id 3) or postcard (id 4), chosen per frame
//! - **Message Format**: 8-byte header (kind, serializer, length) + payload
//! - **Max Payload Size**: 16 MB
//!
//! # Example
//!
//! ```
//! use krpc_common::{RequestEnvelope, ResponseEnvelope, Value};
//!
//! let request = RequestEnvelope::new("UserService", "getUserByUserId", vec![Value::Int(1)]);
//! assert_eq!(request.signature(), "UserService#getUserByUserId(int)");
//!
//! let response = ResponseEnvelope::success(Value::from("ada"));
//! assert_eq!(response.into_result().unwrap(), Value::from("ada"));
//! ```

pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod transport;

pub use protocol::*;
