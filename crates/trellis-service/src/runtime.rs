//! Composition root for a service process.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use trellis_bus::BusConnection;
use trellis_core::InstanceInfo;
use trellis_core::MethodMetadata;
use trellis_core::RegisterMessage;
use trellis_core::ServiceMetadata;
use trellis_core::constants::HEARTBEAT_INTERVAL;
use trellis_core::subject::control_wildcard;
use trellis_core::subject::register_subject;
use trellis_core::subject::rpc_wildcard;

use crate::control;
use crate::control::ControlOutcome;
use crate::dispatcher::ArgsMap;
use crate::dispatcher::RpcDispatcher;
use crate::heartbeat;
use crate::host;

/// Owns everything a service process runs: the bus connection, the RPC
/// dispatcher, the heartbeat loop, and the control handler.
///
/// Startup sequence: RPC subscription, heartbeat loop (one beacon
/// immediately, then periodic), control subscription, then the register
/// message with the current metadata.
pub struct ServiceRuntime {
    name: String,
    bus: Arc<dyn BusConnection>,
    dispatcher: Arc<RpcDispatcher>,
    host: InstanceInfo,
    metadata: Arc<RwLock<Option<ServiceMetadata>>>,
    heartbeat_interval: Duration,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    control: Mutex<Option<JoinHandle<Option<ControlOutcome>>>>,
}

impl ServiceRuntime {
    /// Runtime with auto-detected host identity.
    pub fn new(name: impl Into<String>, bus: Arc<dyn BusConnection>) -> Self {
        Self::with_host(name, bus, host::detect())
    }

    /// Runtime with an explicit host identity (tests, containers with
    /// injected identity).
    pub fn with_host(name: impl Into<String>, bus: Arc<dyn BusConnection>, host: InstanceInfo) -> Self {
        Self {
            name: name.into(),
            bus,
            dispatcher: Arc::new(RpcDispatcher::new()),
            host,
            metadata: Arc::new(RwLock::new(None)),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            control: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// This instance's key on the control channel.
    pub fn instance_key(&self) -> String {
        self.host.instance_key(&self.name)
    }

    pub fn host(&self) -> &InstanceInfo {
        &self.host
    }

    pub fn dispatcher(&self) -> &Arc<RpcDispatcher> {
        &self.dispatcher
    }

    /// Override the heartbeat cadence. Must be called before `start`.
    pub fn set_heartbeat_interval(&mut self, interval: Duration) {
        self.heartbeat_interval = interval;
    }

    /// Register a method with its metadata.
    pub fn register_method<F, Fut>(&self, metadata: MethodMetadata, handler: F)
    where
        F: Fn(ArgsMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ArgsMap>> + Send + 'static,
    {
        self.dispatcher.register(metadata, handler);
    }

    /// Register a method by name only.
    pub fn register_fn<F, Fut>(&self, name: &str, handler: F)
    where
        F: Fn(ArgsMap) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<ArgsMap>> + Send + 'static,
    {
        self.dispatcher.register_fn(name, handler);
    }

    /// Build service metadata from the currently registered methods.
    pub fn build_metadata(
        &self,
        version: impl Into<String>,
        description: impl Into<String>,
        author: impl Into<String>,
        tags: Vec<String>,
    ) -> ServiceMetadata {
        let now = Utc::now();
        ServiceMetadata {
            name: self.name.clone(),
            version: version.into(),
            description: description.into(),
            author: author.into(),
            tags,
            methods: self.dispatcher.method_metadata(),
            registered_at: now,
            updated_at: now,
        }
    }

    /// Store (and, once started, announce) the service metadata.
    ///
    /// Empty `methods` are filled from the dispatcher's registry; the
    /// original registration time is preserved across updates.
    pub async fn register_metadata(&self, mut metadata: ServiceMetadata) -> anyhow::Result<()> {
        if metadata.methods.is_empty() {
            metadata.methods = self.dispatcher.method_metadata();
        }
        metadata.updated_at = Utc::now();
        if let Some(existing) = self.metadata.read().as_ref() {
            metadata.registered_at = existing.registered_at;
        }
        *self.metadata.write() = Some(metadata);

        if self.started.load(Ordering::Acquire) {
            self.publish_register().await?;
        }
        Ok(())
    }

    /// Current metadata, if any has been registered.
    pub fn metadata(&self) -> Option<ServiceMetadata> {
        self.metadata.read().clone()
    }

    /// Start the runtime loops and announce the service.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("service '{}' already running", self.name);
        }

        // Make sure a register message always carries metadata.
        if self.metadata.read().is_none() {
            *self.metadata.write() = Some(self.build_metadata("0.0.0", "", "", Vec::new()));
        }

        let rpc_sub = self
            .bus
            .subscribe(&rpc_wildcard(&self.name))
            .await
            .context("subscribe to RPC subject")?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let bus = Arc::clone(&self.bus);
        let shutdown = self.shutdown.clone();
        self.tasks
            .lock()
            .push(tokio::spawn(dispatcher.run(bus, rpc_sub, shutdown)));

        self.tasks.lock().push(tokio::spawn(heartbeat::heartbeat_loop(
            Arc::clone(&self.bus),
            self.name.clone(),
            Arc::clone(&self.metadata),
            self.heartbeat_interval,
            self.shutdown.clone(),
        )));

        let control_sub = self
            .bus
            .subscribe(&control_wildcard(&self.name))
            .await
            .context("subscribe to control subject")?;
        *self.control.lock() = Some(tokio::spawn(control::control_loop(
            control_sub,
            self.instance_key(),
            self.shutdown.clone(),
        )));

        self.publish_register().await?;
        info!(service = %self.name, instance_key = %self.instance_key(), "service runtime started");
        Ok(())
    }

    /// Publish the register envelope with the current metadata.
    pub async fn publish_register(&self) -> anyhow::Result<()> {
        let metadata = self
            .metadata
            .read()
            .clone()
            .unwrap_or_else(|| self.build_metadata("0.0.0", "", "", Vec::new()));
        let message = RegisterMessage {
            service: self.name.clone(),
            version: metadata.version.clone(),
            metadata,
            instance: self.host.clone(),
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&message).context("encode register message")?;
        self.bus
            .publish(&register_subject(&self.name), payload)
            .await
            .context("publish register message")?;
        Ok(())
    }

    /// Block until a control command targets this instance.
    ///
    /// Returns `None` when the runtime is shut down without a command.
    /// The process entry point maps the outcome to its exit code.
    pub async fn wait(&self) -> Option<ControlOutcome> {
        let handle = self.control.lock().take()?;
        match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, "control task failed");
                None
            }
        }
    }

    /// Stop all runtime loops and release subscriptions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            let _ = task.await;
        }
        let control = self.control.lock().take();
        if let Some(handle) = control {
            let _ = handle.await;
        }
        info!(service = %self.name, "service runtime stopped");
    }
}

impl std::fmt::Debug for ServiceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRuntime")
            .field("name", &self.name)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use trellis_bus::MemoryBus;
    use trellis_core::wire::RegisterMessage;

    use super::*;

    fn test_host() -> InstanceInfo {
        InstanceInfo {
            language: "rust".to_string(),
            host_ip: "10.1.1.1".to_string(),
            host_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            working_dir: "/srv/test".to_string(),
        }
    }

    #[tokio::test]
    async fn start_announces_service_with_methods() {
        let bus = MemoryBus::new();
        let mut register_sub = bus.subscribe("$LL.register.>").await.unwrap();

        let runtime = ServiceRuntime::with_host("calc", Arc::new(bus.clone()), test_host());
        runtime.register_fn("add", |args| async move { Ok(args) });
        runtime
            .register_metadata(runtime.build_metadata("1.0.0", "calculator", "ops", vec![]))
            .await
            .unwrap();
        runtime.start().await.unwrap();

        let msg = register_sub.recv().await.unwrap();
        let register: RegisterMessage = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(register.service, "calc");
        assert_eq!(register.version, "1.0.0");
        assert_eq!(register.metadata.methods.len(), 1);
        assert_eq!(register.instance.host_ip, "10.1.1.1");

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn started_runtime_answers_rpc() {
        let bus = MemoryBus::new();
        let runtime = ServiceRuntime::with_host("echo", Arc::new(bus.clone()), test_host());
        runtime.register_fn("echo", |args| async move { Ok(args) });
        runtime.start().await.unwrap();

        let request = json!({"id": "r1", "method": "echo", "args": {"x": 5}});
        let reply = bus
            .request(
                "$SRV.echo.echo",
                serde_json::to_vec(&request).unwrap(),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        let response: trellis_core::RpcResponse = serde_json::from_slice(&reply).unwrap();
        assert!(response.success);
        assert_eq!(response.result.unwrap()["x"], json!(5));

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let bus = MemoryBus::new();
        let runtime = ServiceRuntime::with_host("dup", Arc::new(bus), test_host());
        runtime.start().await.unwrap();
        assert!(runtime.start().await.is_err());
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn metadata_update_preserves_registration_time() {
        let bus = MemoryBus::new();
        let runtime = ServiceRuntime::with_host("meta", Arc::new(bus), test_host());

        runtime
            .register_metadata(runtime.build_metadata("1.0.0", "", "", vec![]))
            .await
            .unwrap();
        let registered_at = runtime.metadata().unwrap().registered_at;

        tokio::time::sleep(Duration::from_millis(5)).await;
        runtime
            .register_metadata(runtime.build_metadata("1.1.0", "", "", vec![]))
            .await
            .unwrap();

        let metadata = runtime.metadata().unwrap();
        assert_eq!(metadata.version, "1.1.0");
        assert_eq!(metadata.registered_at, registered_at);
        assert!(metadata.updated_at >= registered_at);
    }

    #[tokio::test]
    async fn wait_resolves_on_targeted_stop() {
        let bus = MemoryBus::new();
        let runtime = ServiceRuntime::with_host("ctl", Arc::new(bus.clone()), test_host());
        runtime.start().await.unwrap();

        let control = trellis_core::ControlMessage {
            service: "ctl".to_string(),
            instance_key: runtime.instance_key(),
            command: trellis_core::ControlCommand::Stop,
            timestamp: Utc::now(),
        };
        bus.publish("$LL.control.ctl.cmd", serde_json::to_vec(&control).unwrap())
            .await
            .unwrap();

        assert_eq!(runtime.wait().await, Some(ControlOutcome::Stop));
        runtime.shutdown().await;
    }
}
