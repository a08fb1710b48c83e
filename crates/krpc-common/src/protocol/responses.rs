//! Response envelopes.
//!
//! A response either carries a result together with its type descriptor
//! (status [`StatusCode::SUCCESS`]) or a failure message and no result.

use serde::{Deserialize, Serialize};

use super::error::{KrpcError, Result};
use super::value::{TypeDescriptor, Value};

/// Status codes carried by [`ResponseEnvelope`].
pub struct StatusCode;

impl StatusCode {
    pub const SUCCESS: u32 = 200;
    /// The request payload could not be decoded or violated an invariant.
    pub const BAD_REQUEST: u32 = 400;
    /// No local service implements the requested interface or method.
    pub const NOT_FOUND: u32 = 404;
    /// Admission control denied the call.
    pub const RATE_LIMITED: u32 = 429;
    /// The method implementation failed.
    pub const INTERNAL_ERROR: u32 = 500;
}

/// The outcome of a remote invocation before wire framing.
///
/// # Example
///
/// ```
/// use krpc_common::protocol::{ResponseEnvelope, StatusCode, Value};
///
/// let ok = ResponseEnvelope::success(Value::Int(42));
/// assert!(ok.is_success());
///
/// let failed = ResponseEnvelope::failure(StatusCode::INTERNAL_ERROR, "division by zero");
/// assert!(failed.result.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    pub status_code: u32,
    /// Present iff the status is not success
    pub message: Option<String>,
    pub result_type: Option<TypeDescriptor>,
    pub result: Option<Value>,
}

impl ResponseEnvelope {
    /// Creates a successful response, describing the result by its structure.
    pub fn success(result: Value) -> Self {
        let result_type = result.type_descriptor();
        Self::success_typed(result, result_type)
    }

    /// Creates a successful response with an explicit result descriptor.
    pub fn success_typed(result: Value, result_type: TypeDescriptor) -> Self {
        Self {
            status_code: StatusCode::SUCCESS,
            message: None,
            result_type: Some(result_type),
            result: Some(result),
        }
    }

    /// Creates a failure response.
    ///
    /// # Panics
    ///
    /// Panics if `status_code` is the success code.
    pub fn failure(status_code: u32, message: impl Into<String>) -> Self {
        assert_ne!(
            status_code,
            StatusCode::SUCCESS,
            "failure response cannot carry the success code"
        );
        Self {
            status_code,
            message: Some(message.into()),
            result_type: None,
            result: None,
        }
    }

    /// The response the admission path sends when a call is denied.
    pub fn rate_limited(interface_name: &str) -> Self {
        Self::failure(
            StatusCode::RATE_LIMITED,
            format!("interface {} is rate limited", interface_name),
        )
    }

    pub fn is_success(&self) -> bool {
        self.status_code == StatusCode::SUCCESS
    }

    /// Checks the envelope invariants.
    pub fn validate(&self) -> Result<()> {
        if self.is_success() {
            if self.result.is_none() || self.result_type.is_none() {
                return Err(KrpcError::InvalidArgument(
                    "success response must carry a result and its type".to_string(),
                ));
            }
            if self.message.is_some() {
                return Err(KrpcError::InvalidArgument(
                    "success response must not carry a message".to_string(),
                ));
            }
        } else {
            if self.result.is_some() {
                return Err(KrpcError::InvalidArgument(
                    "failure response must not carry a result".to_string(),
                ));
            }
            if self.message.is_none() {
                return Err(KrpcError::InvalidArgument(
                    "failure response must carry a message".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Converts the response into the caller-visible outcome.
    pub fn into_result(self) -> Result<Value> {
        if self.is_success() {
            return self.result.ok_or_else(|| {
                KrpcError::Serialization("success response missing result".to_string())
            });
        }

        let message = self.message.unwrap_or_else(|| "unknown error".to_string());
        match self.status_code {
            StatusCode::RATE_LIMITED => Err(KrpcError::RateLimited(message)),
            StatusCode::NOT_FOUND => Err(KrpcError::ServiceNotFound(message)),
            code => Err(KrpcError::Remote { code, message }),
        }
    }
}
