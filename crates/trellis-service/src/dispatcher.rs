//! RPC request dispatch.
//!
//! The dispatcher owns the method registry of a service process: it
//! parses inbound [`RpcRequest`] envelopes, validates args against the
//! method's declared metadata, invokes the handler with a panic guard,
//! and publishes the reply.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use trellis_bus::BusConnection;
use trellis_bus::BusMessage;
use trellis_bus::Subscription;
use trellis_core::MethodMetadata;
use trellis_core::RpcRequest;
use trellis_core::RpcResponse;
use trellis_core::ValidationError;

use crate::validate;

/// Argument and result maps carried by RPC envelopes.
pub type ArgsMap = serde_json::Map<String, serde_json::Value>;

/// A registered method handler.
///
/// Handlers return `anyhow::Result`; an error that downcasts to
/// [`ValidationError`] is surfaced to the caller as a structured
/// `validation_error`, anything else as a plain error string.
pub type RpcHandler = Arc<dyn Fn(ArgsMap) -> BoxFuture<'static, anyhow::Result<ArgsMap>> + Send + Sync>;

struct RegisteredMethod {
    metadata: MethodMetadata,
    handler: RpcHandler,
}

/// Method registry and request pipeline for one service.
#[derive(Default)]
pub struct RpcDispatcher {
    methods: RwLock<HashMap<String, RegisteredMethod>>,
}

impl RpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method with its metadata.
    ///
    /// Re-registering a name replaces the previous handler.
    pub fn register<F, Fut>(&self, metadata: MethodMetadata, handler: F)
    where
        F: Fn(ArgsMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ArgsMap>> + Send + 'static,
    {
        let name = metadata.name.clone();
        let handler: RpcHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.methods.write().insert(name, RegisteredMethod { metadata, handler });
    }

    /// Register a method by name only, with no declared parameters.
    pub fn register_fn<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(ArgsMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ArgsMap>> + Send + 'static,
    {
        self.register(MethodMetadata::named(name), handler);
    }

    /// Whether a method is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.methods.read().contains_key(name)
    }

    /// Metadata of every registered method, sorted by name.
    pub fn method_metadata(&self) -> Vec<MethodMetadata> {
        let mut methods: Vec<MethodMetadata> =
            self.methods.read().values().map(|m| m.metadata.clone()).collect();
        methods.sort_by(|a, b| a.name.cmp(&b.name));
        methods
    }

    /// Run one request through the full pipeline and produce the reply.
    ///
    /// The handler is not cancelled if the caller's timeout has already
    /// elapsed; it runs to completion and the reply is published into the
    /// void.
    pub async fn dispatch(&self, payload: &[u8]) -> RpcResponse {
        let request: RpcRequest = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => return RpcResponse::fail("", format!("invalid request: {err}")),
        };

        let (metadata, handler) = {
            let methods = self.methods.read();
            match methods.get(&request.method) {
                Some(method) => (method.metadata.clone(), Arc::clone(&method.handler)),
                None => return RpcResponse::fail(request.id, format!("method not found: {}", request.method)),
            }
        };

        if let Err(err) = validate::validate_args(&metadata.params, &request.args) {
            debug!(method = %request.method, parameter = %err.parameter_name, "argument validation failed");
            return RpcResponse::validation_failure(request.id, &err);
        }

        // The spawn isolates handler panics from the dispatch loop.
        let invocation = tokio::spawn(handler(request.args.clone()));
        match invocation.await {
            Ok(Ok(result)) => RpcResponse::ok(request.id, result),
            Ok(Err(err)) => match err.downcast_ref::<ValidationError>() {
                Some(validation) => RpcResponse::validation_failure(request.id, validation),
                None => RpcResponse::fail(request.id, err.to_string()),
            },
            Err(join_err) if join_err.is_panic() => {
                // Belt-and-suspenders: recover the mismatched parameter by
                // re-scanning args against the metadata.
                let err = validate::reconstruct_mismatch(&metadata.params, &request.args)
                    .unwrap_or_else(|| ValidationError::generic("parameter type mismatch in handler"));
                warn!(method = %request.method, "handler panicked; replying with reconstructed error");
                RpcResponse::validation_failure(request.id, &err)
            }
            Err(_) => RpcResponse::fail(request.id, "handler cancelled"),
        }
    }

    /// Serve requests from `subscription` until shutdown.
    ///
    /// Each request is handled on its own task so a slow handler never
    /// blocks the next request.
    pub async fn run(
        self: Arc<Self>,
        bus: Arc<dyn BusConnection>,
        mut subscription: Subscription,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                message = subscription.recv() => {
                    let Some(message) = message else { break };
                    let dispatcher = Arc::clone(&self);
                    let bus = Arc::clone(&bus);
                    tokio::spawn(async move {
                        dispatcher.handle_message(&bus, message).await;
                    });
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    async fn handle_message(&self, bus: &Arc<dyn BusConnection>, message: BusMessage) {
        let response = self.dispatch(&message.payload).await;
        let Some(reply) = message.reply else {
            debug!(subject = %message.subject, "request carried no reply subject, dropping response");
            return;
        };
        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to encode RPC response");
                return;
            }
        };
        if let Err(err) = bus.publish(&reply, payload).await {
            warn!(%err, subject = %message.subject, "failed to publish RPC reply");
        }
    }
}

impl std::fmt::Debug for RpcDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcDispatcher")
            .field("methods", &self.methods.read().len())
            .finish()
    }
}
