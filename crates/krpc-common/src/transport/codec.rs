use serde::{Deserialize, Serialize};

use crate::protocol::error::{KrpcError, Result};
use crate::protocol::{Message, RequestEnvelope, ResponseEnvelope, Value};
use crate::transport::frame::MessageKind;

/// The two-way contract every payload serializer fulfils.
///
/// The frame codec only needs bytes out of an envelope and an envelope back
/// out of bytes; the `kind` hint tells the deserializer which envelope the
/// frame header announced.
pub trait Serializer: Send + Sync {
    /// The serializer id written into every frame header.
    fn id(&self) -> u16;

    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8], kind: MessageKind) -> Result<Message>;
}

/// Serializers known to both peers, selected by the id in the frame header.
///
/// # Example
///
/// ```
/// use krpc_common::transport::{MessageKind, SerializerKind};
/// use krpc_common::protocol::{Message, RequestEnvelope, Value};
///
/// let serializer = SerializerKind::Json;
/// let message = Message::Request(RequestEnvelope::new("Calc", "add", vec![Value::Int(1)]));
///
/// let bytes = serializer.serialize(&message).unwrap();
/// let decoded = serializer.deserialize(&bytes, MessageKind::Request).unwrap();
/// assert_eq!(message, decoded);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// Self-describing JSON objects
    #[default]
    Json,
    /// Compact binary driven by the envelope schema
    Postcard,
}

impl SerializerKind {
    pub const JSON_ID: u16 = 3;
    pub const POSTCARD_ID: u16 = 4;

    /// Looks up a serializer by its wire id.
    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            Self::JSON_ID => Some(SerializerKind::Json),
            Self::POSTCARD_ID => Some(SerializerKind::Postcard),
            _ => None,
        }
    }

    fn serializer(&self) -> &'static dyn Serializer {
        match self {
            SerializerKind::Json => &JsonSerializer,
            SerializerKind::Postcard => &PostcardSerializer,
        }
    }

    pub fn id(&self) -> u16 {
        self.serializer().id()
    }

    pub fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        let bytes = self.serializer().serialize(message)?;
        if bytes.is_empty() {
            return Err(KrpcError::Serialization(
                "serializer produced an empty payload".to_string(),
            ));
        }
        Ok(bytes)
    }

    /// Deserializes a payload and checks the envelope invariants.
    pub fn deserialize(&self, bytes: &[u8], kind: MessageKind) -> Result<Message> {
        if bytes.is_empty() {
            return Err(KrpcError::Serialization(
                "cannot deserialize an empty payload".to_string(),
            ));
        }
        let message = self.serializer().deserialize(bytes, kind)?;
        message
            .validate()
            .map_err(|e| KrpcError::Serialization(format!("decoded envelope is invalid: {}", e)))?;
        Ok(message)
    }
}

/// JSON serializer (id 3).
///
/// JSON has no spelling for NaN or infinity, so envelopes carrying them are
/// rejected here instead of failing on the far side.
pub struct JsonSerializer;

fn ensure_finite<'a>(mut values: impl Iterator<Item = &'a Value>) -> Result<()> {
    if values.all(Value::is_finite) {
        Ok(())
    } else {
        Err(KrpcError::Serialization(
            "JSON cannot represent NaN or infinite floats".to_string(),
        ))
    }
}

impl Serializer for JsonSerializer {
    fn id(&self) -> u16 {
        SerializerKind::JSON_ID
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        match message {
            Message::Request(request) => {
                ensure_finite(request.params.iter())?;
                Ok(serde_json::to_vec(request)?)
            }
            Message::Response(response) => {
                ensure_finite(response.result.iter())?;
                Ok(serde_json::to_vec(response)?)
            }
        }
    }

    fn deserialize(&self, bytes: &[u8], kind: MessageKind) -> Result<Message> {
        match kind {
            MessageKind::Request => Ok(Message::Request(serde_json::from_slice::<RequestEnvelope>(
                bytes,
            )?)),
            MessageKind::Response => Ok(Message::Response(
                serde_json::from_slice::<ResponseEnvelope>(bytes)?,
            )),
        }
    }
}

/// Postcard serializer (id 4).
pub struct PostcardSerializer;

impl Serializer for PostcardSerializer {
    fn id(&self) -> u16 {
        SerializerKind::POSTCARD_ID
    }

    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        match message {
            Message::Request(request) => Ok(postcard::to_allocvec(request)?),
            Message::Response(response) => Ok(postcard::to_allocvec(response)?),
        }
    }

    fn deserialize(&self, bytes: &[u8], kind: MessageKind) -> Result<Message> {
        match kind {
            MessageKind::Request => Ok(Message::Request(postcard::from_bytes::<RequestEnvelope>(
                bytes,
            )?)),
            MessageKind::Response => Ok(Message::Response(
                postcard::from_bytes::<ResponseEnvelope>(bytes)?,
            )),
        }
    }
}
