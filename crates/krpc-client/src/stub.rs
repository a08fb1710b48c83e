use krpc_common::protocol::error::{KrpcError, Result};
use krpc_common::protocol::{InterfaceDescriptor, RequestEnvelope, Value};
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;

/// Typed call helper for one remote interface.
///
/// A hand-written client wraps a proxy and exposes one plain async method per
/// remote method:
///
/// ```rust,no_run
/// use krpc_client::ServiceProxy;
/// use krpc_common::protocol::{Result, Value};
///
/// struct UserClient {
///     proxy: ServiceProxy,
/// }
///
/// impl UserClient {
///     async fn get_user_by_user_id(&self, id: i64) -> Result<String> {
///         self.proxy.call("getUserByUserId", vec![Value::Int(id)]).await
///     }
/// }
/// ```
#[derive(Clone)]
pub struct ServiceProxy {
    dispatcher: Arc<Dispatcher>,
    interface: InterfaceDescriptor,
}

impl ServiceProxy {
    pub fn new(dispatcher: Arc<Dispatcher>, interface: InterfaceDescriptor) -> Self {
        Self {
            dispatcher,
            interface,
        }
    }

    pub fn interface(&self) -> &InterfaceDescriptor {
        &self.interface
    }

    /// Calls `method` and decodes its result into `R`.
    pub async fn call<R: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<R> {
        self.call_value(method, params).await?.decode()
    }

    /// Calls `method` and returns the raw result value.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the interface has no such method or the number of
    /// parameters does not match its definition; otherwise whatever the
    /// dispatcher reports.
    pub async fn call_value(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let descriptor = self.interface.find(method).ok_or_else(|| {
            KrpcError::InvalidArgument(format!(
                "{} has no method named {}",
                self.interface.name, method
            ))
        })?;

        let request = RequestEnvelope::with_types(
            self.interface.name.as_str(),
            method,
            params,
            descriptor.param_types.clone(),
        )?;
        self.dispatcher.dispatch(&request, descriptor.retryable).await
    }
}
