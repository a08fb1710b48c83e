//! krpc Transport Layer
//!
//! This module turns envelopes into bytes on a TCP stream and back.
//!
//! # Architecture
//!
//! - **Serializers**: pluggable payload encoders selected by a numeric id
//! - **Frame codec**: fixed 8-byte header followed by the payload
//! - **TCP helpers**: connect, send and receive over a [`FramedStream`]
//!
//! # Wire Format
//!
//! ```text
//! [message kind: u16][serializer id: u16][payload length: u32][payload]
//! ```
//!
//! All integers are big-endian. Payloads are capped at
//! [`MAX_PAYLOAD_SIZE`](frame::MAX_PAYLOAD_SIZE).
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use krpc_common::protocol::{Message, RequestEnvelope};
//! use krpc_common::transport::{frame, SerializerKind};
//!
//! let message = Message::Request(RequestEnvelope::heartbeat());
//! let mut buf = BytesMut::new();
//! frame::encode(&message, SerializerKind::Postcard, &mut buf).unwrap();
//!
//! assert_eq!(frame::decode(&mut buf).unwrap(), Some(message));
//! ```

pub mod codec;
pub mod frame;
pub mod tcp;

pub use codec::{JsonSerializer, PostcardSerializer, Serializer, SerializerKind};
pub use frame::{Frame, FrameCodec, MessageKind};
pub use tcp::FramedStream;

#[cfg(test)]
mod tests;
