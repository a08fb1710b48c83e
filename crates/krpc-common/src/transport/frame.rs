//! Wire framing.
//!
//! Frame format (network byte order):
//!
//! ```text
//! [message kind: u16][serializer id: u16][payload length: u32][payload: N]
//! ```
//!
//! - **message kind**: 1 = request, 2 = response
//! - **serializer id**: 3 = JSON, 4 = postcard
//! - **payload length**: number of payload bytes, never zero
//!
//! [`FrameCodec`] decodes incrementally: it leaves the read buffer untouched
//! until a complete frame is available, so payloads split across reads are
//! reassembled transparently. Unknown kinds, unknown serializers and empty
//! payloads are protocol errors and the connection must be closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::error::{KrpcError, Result};
use crate::protocol::Message;
use crate::transport::codec::SerializerKind;

/// Header size: 2 (kind) + 2 (serializer) + 4 (length) = 8 bytes.
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size (16 MB).
///
/// Larger frames are rejected before any payload is buffered.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Kind of envelope a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
}

impl MessageKind {
    pub fn code(&self) -> u16 {
        match self {
            MessageKind::Request => 1,
            MessageKind::Response => 2,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(MessageKind::Request),
            2 => Some(MessageKind::Response),
            _ => None,
        }
    }

    pub fn of(message: &Message) -> Self {
        match message {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
        }
    }
}

/// One on-wire unit: header fields plus the serializer-produced payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageKind,
    pub serializer: SerializerKind,
    pub payload: Bytes,
}

impl Frame {
    /// Serializes an envelope into a frame.
    pub fn from_message(message: &Message, serializer: SerializerKind) -> Result<Self> {
        let payload = serializer.serialize(message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(KrpcError::Serialization(format!(
                "payload too large: {} bytes (max {} bytes)",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }
        Ok(Self {
            kind: MessageKind::of(message),
            serializer,
            payload: Bytes::from(payload),
        })
    }

    /// Deserializes the payload with the serializer named in the header.
    pub fn to_message(&self) -> Result<Message> {
        self.serializer.deserialize(&self.payload, self.kind)
    }

    /// Writes header and payload into `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE + self.payload.len());
        dst.put_u16(self.kind.code());
        dst.put_u16(self.serializer.id());
        dst.put_u32(self.payload.len() as u32);
        dst.put_slice(&self.payload);
    }
}

/// Incremental frame decoder and encoder.
///
/// Stateless apart from the buffer the caller owns, so one codec per
/// connection read path is all that is needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = KrpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming it
        let kind_code = u16::from_be_bytes([src[0], src[1]]);
        let serializer_id = u16::from_be_bytes([src[2], src[3]]);
        let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        let kind = MessageKind::from_code(kind_code)
            .ok_or_else(|| KrpcError::Protocol(format!("unknown message kind {}", kind_code)))?;
        let serializer = SerializerKind::from_id(serializer_id).ok_or_else(|| {
            KrpcError::Protocol(format!("unknown serializer id {}", serializer_id))
        })?;
        if length == 0 {
            return Err(KrpcError::Protocol("zero-length payload".to_string()));
        }
        if length > MAX_PAYLOAD_SIZE {
            return Err(KrpcError::Protocol(format!(
                "frame too large: {} bytes (max {} bytes)",
                length, MAX_PAYLOAD_SIZE
            )));
        }

        let total = HEADER_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let payload = src.split_to(length).freeze();
        Ok(Some(Frame {
            kind,
            serializer,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = KrpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.write_to(dst);
        Ok(())
    }
}

/// Frames an envelope into `dst` using `serializer`.
pub fn encode(message: &Message, serializer: SerializerKind, dst: &mut BytesMut) -> Result<()> {
    Frame::from_message(message, serializer)?.write_to(dst);
    Ok(())
}

/// Decodes the next complete envelope from `src`.
///
/// Returns `Ok(None)` while more data is needed.
pub fn decode(src: &mut BytesMut) -> Result<Option<Message>> {
    match FrameCodec.decode(src)? {
        Some(frame) => frame.to_message().map(Some),
        None => Ok(None),
    }
}
