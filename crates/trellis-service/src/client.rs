//! Caller-side RPC client.

use std::sync::Arc;
use std::time::Duration;

use snafu::ResultExt;
use snafu::Snafu;
use uuid::Uuid;

use trellis_bus::BusConnection;
use trellis_bus::BusError;
use trellis_core::RpcRequest;
use trellis_core::RpcResponse;
use trellis_core::constants::DEFAULT_RPC_TIMEOUT;
use trellis_core::subject::rpc_subject;

use crate::dispatcher::ArgsMap;

/// Errors from caller-side RPC.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    /// The bus failed or the request timed out.
    #[snafu(display("RPC request failed: {source}"))]
    Transport {
        /// Source error.
        source: BusError,
    },

    /// The service replied with `success: false`.
    #[snafu(display("RPC error: {message}"))]
    Rpc {
        /// The service's error message.
        message: String,
        /// Structured detail, present for validation failures.
        detail: Option<ArgsMap>,
    },

    /// The reply payload was not a valid response envelope.
    #[snafu(display("invalid RPC response: {source}"))]
    Decode {
        /// Source error.
        source: serde_json::Error,
    },
}

/// Client for invoking methods on remote services.
#[derive(Clone)]
pub struct ServiceClient {
    bus: Arc<dyn BusConnection>,
}

impl ServiceClient {
    pub fn new(bus: Arc<dyn BusConnection>) -> Self {
        Self { bus }
    }

    /// Call a method with the default timeout.
    pub async fn call(&self, service: &str, method: &str, args: ArgsMap) -> Result<ArgsMap, ClientError> {
        self.call_with_timeout(service, method, args, DEFAULT_RPC_TIMEOUT).await
    }

    /// Call a method, failing with a transport error after `timeout`.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: ArgsMap,
        timeout: Duration,
    ) -> Result<ArgsMap, ClientError> {
        let request = RpcRequest {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            args,
        };
        let payload = serde_json::to_vec(&request).context(DecodeSnafu)?;

        let reply = self
            .bus
            .request(&rpc_subject(service, method), payload, timeout)
            .await
            .context(TransportSnafu)?;

        let response: RpcResponse = serde_json::from_slice(&reply).context(DecodeSnafu)?;
        if !response.success {
            return Err(ClientError::Rpc {
                message: response.error.unwrap_or_else(|| "unknown error".to_string()),
                detail: response.result,
            });
        }
        Ok(response.result.unwrap_or_default())
    }
}

impl std::fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceClient").finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use trellis_bus::MemoryBus;
    use trellis_core::InstanceInfo;
    use trellis_core::types::MethodMetadata;
    use trellis_core::types::ParamType;
    use trellis_core::types::ParameterMetadata;

    use super::*;
    use crate::runtime::ServiceRuntime;

    fn args(pairs: &[(&str, serde_json::Value)]) -> ArgsMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    async fn start_math_service(bus: &MemoryBus) -> ServiceRuntime {
        let runtime = ServiceRuntime::with_host(
            "math",
            Arc::new(bus.clone()),
            InstanceInfo {
                language: "rust".to_string(),
                host_ip: "10.0.0.2".to_string(),
                host_mac: "aa:bb:cc:00:11:22".to_string(),
                working_dir: "/srv/math".to_string(),
            },
        );
        let metadata = MethodMetadata {
            params: vec![
                ParameterMetadata {
                    name: "a".to_string(),
                    param_type: ParamType::Number,
                    required: true,
                    description: String::new(),
                    default: None,
                },
                ParameterMetadata {
                    name: "b".to_string(),
                    param_type: ParamType::Number,
                    required: true,
                    description: String::new(),
                    default: None,
                },
            ],
            ..MethodMetadata::named("add")
        };
        runtime.register_method(metadata, |args: ArgsMap| async move {
            let sum = args["a"].as_f64().unwrap() + args["b"].as_f64().unwrap();
            let mut result = ArgsMap::new();
            result.insert("sum".to_string(), json!(sum));
            Ok(result)
        });
        runtime.start().await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn call_roundtrip() {
        let bus = MemoryBus::new();
        let runtime = start_math_service(&bus).await;

        let client = ServiceClient::new(Arc::new(bus));
        let result = client
            .call("math", "add", args(&[("a", json!(10)), ("b", json!(20))]))
            .await
            .unwrap();
        assert_eq!(result["sum"], json!(30.0));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn validation_failure_surfaces_detail() {
        let bus = MemoryBus::new();
        let runtime = start_math_service(&bus).await;

        let client = ServiceClient::new(Arc::new(bus));
        let err = client
            .call("math", "add", args(&[("a", json!("10")), ("b", json!(20))]))
            .await
            .unwrap_err();

        match err {
            ClientError::Rpc { message, detail } => {
                assert_eq!(message, "parameter 'a': expected type number, got string");
                let detail = detail.unwrap();
                assert_eq!(detail["type"], "validation_error");
                assert_eq!(detail["parameter_name"], "a");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn timeout_surfaces_as_transport_error() {
        let bus = MemoryBus::new();
        let client = ServiceClient::new(Arc::new(bus));
        let err = client
            .call_with_timeout("ghost", "noop", ArgsMap::new(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport { .. }));
    }
}
