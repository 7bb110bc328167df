//! Service-side runtime for the Trellis mesh.
//!
//! [`ServiceRuntime`] is the composition root run inside each service
//! process: it owns the bus connection, the RPC dispatcher, the heartbeat
//! loop, and the control-channel handler. [`ServiceClient`] is the
//! caller-side counterpart for invoking remote methods.
//!
//! Validation runs before dispatch: request args are checked against the
//! method's declared [`MethodMetadata`](trellis_core::MethodMetadata) and
//! failures come back as structured `validation_error` details.

pub mod client;
pub mod control;
pub mod dispatcher;
pub mod heartbeat;
pub mod host;
pub mod runtime;
pub mod validate;

pub use client::ClientError;
pub use client::ServiceClient;
pub use control::ControlOutcome;
pub use dispatcher::ArgsMap;
pub use dispatcher::RpcDispatcher;
pub use dispatcher::RpcHandler;
pub use runtime::ServiceRuntime;
pub use validate::validate_args;
