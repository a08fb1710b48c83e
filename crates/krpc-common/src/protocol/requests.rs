use serde::{Deserialize, Serialize};

use super::error::{KrpcError, Result};
use super::value::{TypeDescriptor, Value};

/// Distinguishes application calls from liveness probes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RequestKind {
    Normal,
    Heartbeat,
}

/// A remote method invocation before wire framing.
///
/// For `Normal` requests `params` and `param_types` have the same length.
/// A `Heartbeat` carries nothing beyond its kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub kind: RequestKind,
    pub interface_name: String,
    pub method_name: String,
    pub params: Vec<Value>,
    pub param_types: Vec<TypeDescriptor>,
}

impl RequestEnvelope {
    /// Creates a normal request, deriving each parameter's descriptor from its value.
    pub fn new(
        interface_name: impl Into<String>,
        method_name: impl Into<String>,
        params: Vec<Value>,
    ) -> Self {
        let param_types = params.iter().map(Value::type_descriptor).collect();
        Self {
            kind: RequestKind::Normal,
            interface_name: interface_name.into(),
            method_name: method_name.into(),
            params,
            param_types,
        }
    }

    /// Creates a normal request with explicit parameter descriptors.
    pub fn with_types(
        interface_name: impl Into<String>,
        method_name: impl Into<String>,
        params: Vec<Value>,
        param_types: Vec<TypeDescriptor>,
    ) -> Result<Self> {
        let request = Self {
            kind: RequestKind::Normal,
            interface_name: interface_name.into(),
            method_name: method_name.into(),
            params,
            param_types,
        };
        request.validate()?;
        Ok(request)
    }

    /// Creates an empty liveness probe.
    pub fn heartbeat() -> Self {
        Self {
            kind: RequestKind::Heartbeat,
            interface_name: String::new(),
            method_name: String::new(),
            params: Vec::new(),
            param_types: Vec::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == RequestKind::Heartbeat
    }

    /// The method signature used for retry whitelisting, e.g.
    /// `UserService#getUserByUserId(int)`.
    pub fn signature(&self) -> String {
        method_signature(&self.interface_name, &self.method_name, &self.param_types)
    }

    /// Checks the envelope invariants.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            RequestKind::Normal => {
                if self.interface_name.is_empty() || self.method_name.is_empty() {
                    return Err(KrpcError::InvalidArgument(
                        "request must name an interface and a method".to_string(),
                    ));
                }
                if self.params.len() != self.param_types.len() {
                    return Err(KrpcError::InvalidArgument(format!(
                        "{} params but {} param types",
                        self.params.len(),
                        self.param_types.len()
                    )));
                }
            }
            RequestKind::Heartbeat => {
                if !self.interface_name.is_empty()
                    || !self.method_name.is_empty()
                    || !self.params.is_empty()
                    || !self.param_types.is_empty()
                {
                    return Err(KrpcError::InvalidArgument(
                        "heartbeat must not carry a payload".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Formats `Interface#method(T1,T2)`.
pub fn method_signature(interface: &str, method: &str, param_types: &[TypeDescriptor]) -> String {
    let types: Vec<String> = param_types.iter().map(|t| t.to_string()).collect();
    format!("{}#{}({})", interface, method, types.join(","))
}
