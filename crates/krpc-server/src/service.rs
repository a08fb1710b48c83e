use async_trait::async_trait;
use krpc_common::protocol::{InterfaceDescriptor, Result, Value};

/// A local implementation of one remote interface.
///
/// The descriptor names the interface and declares its methods; the provider
/// rejects calls to undeclared methods before `invoke` is reached.
///
/// Errors returned from `invoke` become failure responses: `InvalidArgument`
/// maps to 400, `ServiceNotFound` to 404, anything else to 500.
#[async_trait]
pub trait RpcService: Send + Sync {
    fn descriptor(&self) -> &InterfaceDescriptor;

    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    fn interface_name(&self) -> &str {
        &self.descriptor().name
    }
}
