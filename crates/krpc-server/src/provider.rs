use dashmap::DashMap;
use krpc_common::protocol::{
    Endpoint, KrpcError, RequestEnvelope, ResponseEnvelope, Result, StatusCode,
};
use krpc_common::rate_limit::{RateLimiterRegistry, TokenBucket};
use krpc_common::registry::ServiceRegistrar;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::service::RpcService;

/// Hosts local services and runs the admission path in front of them.
///
/// Every request goes through the same steps: envelope check, service
/// lookup, the interface's token bucket, method lookup, then the
/// implementation.
pub struct ServiceProvider {
    services: DashMap<String, Arc<dyn RpcService>>,
    rate_limiters: RateLimiterRegistry,
    registrar: Option<Arc<dyn ServiceRegistrar>>,
}

impl ServiceProvider {
    pub fn new(rate_limiters: RateLimiterRegistry) -> Self {
        Self {
            services: DashMap::new(),
            rate_limiters,
            registrar: None,
        }
    }

    /// Publishes provided services to `registrar`.
    pub fn with_registrar(mut self, registrar: Arc<dyn ServiceRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Starts serving `service` and announces it at `endpoint`.
    ///
    /// The retryable methods of the service's descriptor are registered
    /// with it, so callers may retry exactly those against this endpoint.
    pub async fn provide(&self, service: Arc<dyn RpcService>, endpoint: &Endpoint) -> Result<()> {
        let descriptor = service.descriptor().clone();
        if descriptor.name.is_empty() {
            return Err(KrpcError::InvalidArgument(
                "service descriptor has an empty interface name".to_string(),
            ));
        }

        self.services.insert(descriptor.name.clone(), service);
        if let Some(registrar) = &self.registrar {
            registrar
                .register(
                    &descriptor.name,
                    endpoint.clone(),
                    descriptor.retryable_signatures(),
                )
                .await?;
        }

        info!(
            "Providing {} ({} methods) at {}",
            descriptor.name,
            descriptor.methods.len(),
            endpoint
        );
        Ok(())
    }

    /// Stops serving `interface_name` and withdraws it from the registry.
    pub async fn withdraw(&self, interface_name: &str, endpoint: &Endpoint) -> Result<()> {
        if self.services.remove(interface_name).is_none() {
            return Err(KrpcError::ServiceNotFound(interface_name.to_string()));
        }
        if let Some(registrar) = &self.registrar {
            registrar.deregister(interface_name, endpoint).await?;
        }
        info!("Withdrew {} from {}", interface_name, endpoint);
        Ok(())
    }

    /// The token bucket guarding `interface_name`.
    pub fn rate_limiter(&self, interface_name: &str) -> Arc<TokenBucket> {
        self.rate_limiters.get(interface_name)
    }

    /// Names of the hosted interfaces, sorted.
    pub fn interface_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Handles one decoded request.
    ///
    /// Returns `None` for heartbeats, which are never answered.
    pub async fn handle_request(&self, request: RequestEnvelope) -> Option<ResponseEnvelope> {
        if request.is_heartbeat() {
            debug!("Heartbeat received");
            return None;
        }
        Some(self.dispatch(request).await)
    }

    async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        if let Err(e) = request.validate() {
            return ResponseEnvelope::failure(StatusCode::BAD_REQUEST, e.to_string());
        }

        let Some(service) = self
            .services
            .get(&request.interface_name)
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!("No service for {}", request.interface_name);
            return ResponseEnvelope::failure(
                StatusCode::NOT_FOUND,
                format!("no service provides {}", request.interface_name),
            );
        };

        if !self.rate_limiter(&request.interface_name).try_acquire() {
            warn!("Rate limit hit for {}", request.interface_name);
            return ResponseEnvelope::rate_limited(&request.interface_name);
        }

        let Some(method) = service.descriptor().find(&request.method_name) else {
            return ResponseEnvelope::failure(
                StatusCode::NOT_FOUND,
                format!(
                    "{} has no method named {}",
                    request.interface_name, request.method_name
                ),
            );
        };
        if method.param_types.len() != request.params.len() {
            return ResponseEnvelope::failure(
                StatusCode::BAD_REQUEST,
                format!(
                    "{} takes {} params, got {}",
                    request.signature(),
                    method.param_types.len(),
                    request.params.len()
                ),
            );
        }

        let signature = request.signature();
        match service.invoke(&request.method_name, request.params).await {
            Ok(value) => ResponseEnvelope::success(value),
            Err(KrpcError::InvalidArgument(message)) => {
                ResponseEnvelope::failure(StatusCode::BAD_REQUEST, message)
            }
            Err(KrpcError::ServiceNotFound(message)) => {
                ResponseEnvelope::failure(StatusCode::NOT_FOUND, message)
            }
            Err(e) => {
                error!("{} failed: {}", signature, e);
                ResponseEnvelope::failure(StatusCode::INTERNAL_ERROR, e.to_string())
            }
        }
    }
}

impl Default for ServiceProvider {
    fn default() -> Self {
        Self::new(RateLimiterRegistry::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use krpc_common::protocol::{InterfaceDescriptor, MethodDescriptor, TypeDescriptor, Value};
    use krpc_common::rate_limit::RateLimitConfig;
    use krpc_common::registry::{InMemoryRegistry, ServiceDiscovery};

    struct Calculator {
        descriptor: InterfaceDescriptor,
    }

    impl Calculator {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                descriptor: InterfaceDescriptor::new("Calculator")
                    .method(
                        MethodDescriptor::new("add", vec![TypeDescriptor::Int, TypeDescriptor::Int])
                            .retryable(),
                    )
                    .method(MethodDescriptor::new(
                        "div",
                        vec![TypeDescriptor::Int, TypeDescriptor::Int],
                    )),
            })
        }
    }

    #[async_trait]
    impl RpcService for Calculator {
        fn descriptor(&self) -> &InterfaceDescriptor {
            &self.descriptor
        }

        async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value> {
            let a: i64 = params[0].decode()?;
            let b: i64 = params[1].decode()?;
            match method {
                "add" => Ok(Value::Int(a + b)),
                "div" if b == 0 => Err(KrpcError::InvalidArgument("division by zero".into())),
                "div" => Ok(Value::Int(a / b)),
                _ => Err(KrpcError::ServiceNotFound(method.to_string())),
            }
        }
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("127.0.0.1", 9000)
    }

    fn call(method: &str, a: i64, b: i64) -> RequestEnvelope {
        RequestEnvelope::new("Calculator", method, vec![Value::Int(a), Value::Int(b)])
    }

    async fn provider() -> ServiceProvider {
        let provider = ServiceProvider::default();
        provider.provide(Calculator::new(), &endpoint()).await.unwrap();
        provider
    }

    #[tokio::test]
    async fn test_heartbeat_gets_no_response() {
        let provider = provider().await;
        assert!(provider.handle_request(RequestEnvelope::heartbeat()).await.is_none());
    }

    #[tokio::test]
    async fn test_successful_call() {
        let provider = provider().await;
        let response = provider.handle_request(call("add", 2, 3)).await.unwrap();
        assert_eq!(response.into_result().unwrap(), Value::Int(5));
    }

    #[tokio::test]
    async fn test_status_codes() {
        let provider = provider().await;

        let unknown_interface = RequestEnvelope::new("Nope", "add", vec![]);
        let response = provider.handle_request(unknown_interface).await.unwrap();
        assert_eq!(response.status_code, StatusCode::NOT_FOUND);

        let response = provider.handle_request(call("mul", 2, 3)).await.unwrap();
        assert_eq!(response.status_code, StatusCode::NOT_FOUND);

        let response = provider.handle_request(call("div", 1, 0)).await.unwrap();
        assert_eq!(response.status_code, StatusCode::BAD_REQUEST);

        let short = RequestEnvelope::new("Calculator", "add", vec![Value::Int(1)]);
        let response = provider.handle_request(short).await.unwrap();
        assert_eq!(response.status_code, StatusCode::BAD_REQUEST);

        let wrong_type = RequestEnvelope::new(
            "Calculator",
            "add",
            vec![Value::from("one"), Value::Int(1)],
        );
        let response = provider.handle_request(wrong_type).await.unwrap();
        assert_eq!(response.status_code, StatusCode::INTERNAL_ERROR);
    }

    #[tokio::test]
    async fn test_rate_limited_call_gets_failure_response() {
        let limits = RateLimiterRegistry::new(RateLimitConfig::default())
            .with_override("Calculator", RateLimitConfig::new(2, 60_000));
        let provider = ServiceProvider::new(limits);
        provider.provide(Calculator::new(), &endpoint()).await.unwrap();

        for _ in 0..2 {
            let response = provider.handle_request(call("add", 1, 1)).await.unwrap();
            assert!(response.is_success());
        }
        let response = provider.handle_request(call("add", 1, 1)).await.unwrap();
        assert_eq!(response.status_code, StatusCode::RATE_LIMITED);
        assert!(matches!(response.into_result(), Err(KrpcError::RateLimited(_))));
    }

    #[tokio::test]
    async fn test_unknown_interface_does_not_create_bucket() {
        let provider = provider().await;
        provider
            .handle_request(RequestEnvelope::new("Nope", "add", vec![]))
            .await;
        assert_eq!(provider.rate_limiters.len(), 0);
    }

    #[tokio::test]
    async fn test_provide_registers_retryable_signatures() {
        let registry = Arc::new(InMemoryRegistry::new());
        let provider = ServiceProvider::default().with_registrar(registry.clone());
        provider.provide(Calculator::new(), &endpoint()).await.unwrap();

        assert_eq!(registry.discover("Calculator").await.unwrap(), vec![endpoint()]);
        assert!(registry
            .check_retry_supported(&endpoint(), "Calculator#add(int,int)")
            .await
            .unwrap());
        assert!(!registry
            .check_retry_supported(&endpoint(), "Calculator#div(int,int)")
            .await
            .unwrap());

        provider.withdraw("Calculator", &endpoint()).await.unwrap();
        assert!(registry.discover("Calculator").await.unwrap().is_empty());
        assert_eq!(provider.interface_names(), Vec::<String>::new());
    }
}
