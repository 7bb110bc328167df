//! Service, method, and instance metadata.
//!
//! These types describe the callable surface of a service and the identity
//! of its running instances. They are serialized verbatim into register
//! messages and mirrored into the manager's catalog.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Declared type of an RPC parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    /// Wire string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata for a single RPC parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterMetadata {
    /// Parameter name as it appears in the request args map.
    pub name: String,
    /// Declared type; validated against the runtime value before dispatch.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Default value applied by the handler when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

/// Metadata for a single RPC return field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnMetadata {
    pub name: String,
    #[serde(rename = "type")]
    pub return_type: ParamType,
    #[serde(default)]
    pub description: String,
}

/// Worked example attached to a method for documentation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExampleMetadata {
    #[serde(default)]
    pub input: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub output: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// Metadata for a callable method.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodMetadata {
    /// Method name, unique within its service.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Declared parameters, in call order.
    #[serde(default)]
    pub params: Vec<ParameterMetadata>,
    /// Declared return fields.
    #[serde(default)]
    pub returns: Vec<ReturnMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<ExampleMetadata>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub deprecated: bool,
}

impl MethodMetadata {
    /// Minimal metadata with just a name, for methods registered without
    /// a declared signature.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            params: Vec::new(),
            returns: Vec::new(),
            example: None,
            tags: Vec::new(),
            deprecated: false,
        }
    }
}

/// Identity and callable surface of a service.
///
/// `name` is globally unique on the mesh; method names are unique within
/// the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodMetadata>,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceMetadata {
    /// Look up a method by name.
    pub fn method(&self, name: &str) -> Option<&MethodMetadata> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Identity of the host a service instance runs on, stamped into the
/// register message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Implementation language of the instance ("rust", "go", ...).
    pub language: String,
    pub host_ip: String,
    pub host_mac: String,
    pub working_dir: String,
}

impl InstanceInfo {
    /// The instance key this host identity produces for `service`.
    pub fn instance_key(&self, service: &str) -> String {
        instance_key(&self.host_ip, &self.host_mac, service)
    }
}

/// A running process of a service, keyed by [`instance_key`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub service_name: String,
    pub instance_key: String,
    pub language: String,
    pub host_ip: String,
    pub host_mac: String,
    pub working_dir: String,
    pub version: String,
    pub first_seen: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub online: bool,
}

/// Aggregate online/offline view of a service.
///
/// A service is online iff at least one of its instances is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service_name: String,
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub version: String,
    pub updated_at: DateTime<Utc>,
}

/// Kind of a service lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceEventKind {
    Registered,
    Updated,
    Online,
    Offline,
    Heartbeat,
}

impl ServiceEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Updated => "updated",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Immutable audit record of a service lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    #[serde(rename = "type")]
    pub kind: ServiceEventKind,
    pub service: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ServiceEvent {
    /// Event with just a kind, service, and timestamp.
    pub fn now(kind: ServiceEventKind, service: impl Into<String>) -> Self {
        Self {
            kind,
            service: service.into(),
            method: None,
            timestamp: Utc::now(),
            data: None,
        }
    }
}

/// Strip `:` and `-` separators from a MAC address.
///
/// The normalized form is embedded in instance keys so that the same host
/// produces the same key regardless of how the platform formats MACs.
pub fn normalize_mac(mac: &str) -> String {
    mac.chars().filter(|c| *c != ':' && *c != '-').collect()
}

/// Build the unique key for a service instance: `ip:normalized_mac:service`.
pub fn instance_key(ip: &str, mac: &str, service: &str) -> String {
    format!("{}:{}:{}", ip, normalize_mac(mac), service)
}
