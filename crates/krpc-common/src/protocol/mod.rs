pub mod endpoint;
pub mod error;
pub mod interface;
pub mod requests;
pub mod responses;
pub mod value;


pub use endpoint::Endpoint;
pub use error::{KrpcError, Result};
pub use interface::{InterfaceDescriptor, MethodDescriptor};
pub use requests::{method_signature, RequestEnvelope, RequestKind};
pub use responses::{ResponseEnvelope, StatusCode};
pub use value::{TypeDescriptor, Value};

/// Either envelope, as produced by a serializer.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

impl Message {
    /// Checks the invariants of the wrapped envelope.
    pub fn validate(&self) -> Result<()> {
        match self {
            Message::Request(request) => request.validate(),
            Message::Response(response) => response.validate(),
        }
    }
}

impl From<RequestEnvelope> for Message {
    fn from(request: RequestEnvelope) -> Self {
        Message::Request(request)
    }
}

impl From<ResponseEnvelope> for Message {
    fn from(response: ResponseEnvelope) -> Self {
        Message::Response(response)
    }
}
