//! JSON envelopes for control-plane traffic.
//!
//! Every message on a `$LL.` or `$SRV.` subject is one of these
//! UTF-8 JSON envelopes. Binary payloads (diff ops, chunks) travel
//! base64-encoded inside RPC args rather than as raw frames.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::types::InstanceInfo;
use crate::types::ServiceMetadata;
use crate::validation::ValidationError;

/// Published on `$LL.register.<service>` at startup and on metadata change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub service: String,
    pub version: String,
    pub metadata: ServiceMetadata,
    pub instance: InstanceInfo,
    pub timestamp: DateTime<Utc>,
}

/// Published on `$LL.heartbeat.<service>` every heartbeat interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle command targeted at a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlCommand {
    Stop,
    Restart,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

/// Published on `$LL.control.<service>` by the manager; every instance of
/// the service receives it and filters on `instance_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub service: String,
    pub instance_key: String,
    pub command: ControlCommand,
    pub timestamp: DateTime<Utc>,
}

/// RPC request envelope sent to `$SRV.<service>.<method>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// RPC response envelope.
///
/// On success `result` carries the handler's output. On failure `error`
/// carries a readable message; for validation failures `result`
/// additionally carries the structured `validation_error` detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcResponse {
    /// Successful reply carrying the handler's result.
    pub fn ok(id: impl Into<String>, result: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed reply with a plain error message.
    pub fn fail(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Failed reply carrying a structured validation detail.
    pub fn validation_failure(id: impl Into<String>, err: &ValidationError) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: Some(err.detail()),
            error: Some(err.message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::MethodMetadata;
    use crate::types::ParamType;
    use crate::validation::ValueKind;

    fn sample_metadata() -> ServiceMetadata {
        ServiceMetadata {
            name: "math".to_string(),
            version: "1.2.0".to_string(),
            description: "arithmetic".to_string(),
            author: "ops".to_string(),
            tags: vec!["demo".to_string()],
            methods: vec![MethodMetadata::named("add")],
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn register_message_roundtrip() {
        let msg = RegisterMessage {
            service: "math".to_string(),
            version: "1.2.0".to_string(),
            metadata: sample_metadata(),
            instance: InstanceInfo {
                language: "rust".to_string(),
                host_ip: "10.0.0.5".to_string(),
                host_mac: "aa:bb:cc:dd:ee:ff".to_string(),
                working_dir: "/srv/math".to_string(),
            },
            timestamp: Utc::now(),
        };

        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: RegisterMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.service, "math");
        assert_eq!(back.metadata.methods.len(), 1);
        assert_eq!(back.instance.instance_key("math"), "10.0.0.5:aabbccddeeff:math");
    }

    #[test]
    fn control_command_wire_form() {
        let msg = ControlMessage {
            service: "math".to_string(),
            instance_key: "k".to_string(),
            command: ControlCommand::Restart,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["command"], "restart");
    }

    #[test]
    fn request_args_default_to_empty() {
        let req: RpcRequest = serde_json::from_str(r#"{"id":"1","method":"ping"}"#).unwrap();
        assert!(req.args.is_empty());
    }

    #[test]
    fn ok_response_shape() {
        let mut result = serde_json::Map::new();
        result.insert("sum".to_string(), serde_json::json!(30));
        let resp = RpcResponse::ok("req-1", result);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["result"]["sum"], 30);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn fail_response_omits_result() {
        let resp = RpcResponse::fail("req-1", "method not found: mul");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "method not found: mul");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn validation_failure_carries_detail() {
        let err = ValidationError::mismatch("a", ParamType::Number, ValueKind::String, &serde_json::json!("10"));
        let resp = RpcResponse::validation_failure("req-1", &err);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "parameter 'a': expected type number, got string");
        assert_eq!(json["result"]["type"], "validation_error");
        assert_eq!(json["result"]["parameter_name"], "a");
    }
}
