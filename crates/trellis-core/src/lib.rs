//! Core types for the Trellis service mesh.
//!
//! This crate defines the wire contract shared by every Trellis process:
//! service and method metadata, instance identity, the control-plane JSON
//! envelopes, bus subject construction and matching, and the parameter
//! validation primitives used by the RPC dispatcher.
//!
//! It is deliberately a lightweight dependency: serde, serde_json, and
//! chrono only. Anything that talks to the bus or the filesystem lives in
//! the sibling crates.

pub mod constants;
pub mod subject;
pub mod types;
pub mod validation;
pub mod wire;

pub use constants::DEFAULT_CHUNK_SIZE;
pub use constants::DEFAULT_LIVENESS_TIMEOUT;
pub use constants::DEFAULT_RPC_TIMEOUT;
pub use constants::DIFF_BLOCK_SIZE;
pub use constants::EXIT_CODE_RESTART;
pub use constants::EXIT_CODE_STOP;
pub use constants::HEARTBEAT_INTERVAL;
pub use constants::LIVENESS_SWEEP_INTERVAL;
pub use subject::control_subject;
pub use subject::control_wildcard;
pub use subject::heartbeat_subject;
pub use subject::register_subject;
pub use subject::rpc_subject;
pub use subject::rpc_wildcard;
pub use subject::subject_matches;
pub use types::Instance;
pub use types::InstanceInfo;
pub use types::MethodMetadata;
pub use types::ParamType;
pub use types::ParameterMetadata;
pub use types::ReturnMetadata;
pub use types::ServiceEvent;
pub use types::ServiceEventKind;
pub use types::ServiceMetadata;
pub use types::ServiceStatus;
pub use types::instance_key;
pub use types::normalize_mac;
pub use validation::ValidationError;
pub use validation::ValueKind;
pub use validation::infer_kind;
pub use validation::is_type_compatible;
pub use wire::ControlCommand;
pub use wire::ControlMessage;
pub use wire::HeartbeatMessage;
pub use wire::RegisterMessage;
pub use wire::RpcRequest;
pub use wire::RpcResponse;
