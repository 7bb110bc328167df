//! Manager composition root.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use trellis_bus::BusConnection;
use trellis_bus::Subscription;
use trellis_core::subject::HEARTBEAT_PREFIX;
use trellis_core::subject::REGISTER_PREFIX;

use crate::catalog::Catalog;
use crate::control::ControlPlane;
use crate::events;
use crate::events::EventStream;
use crate::liveness::LivenessConfig;
use crate::liveness::LivenessTracker;
use crate::liveness::TrackerMessage;

/// Backlog between the bus callbacks and the liveness actor.
const TRACKER_QUEUE_DEPTH: usize = 256;

/// The mesh manager: subscribes to control-plane traffic and maintains
/// the catalog through the liveness actor.
pub struct Manager {
    bus: Arc<dyn BusConnection>,
    catalog: Arc<dyn Catalog>,
    config: LivenessConfig,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    /// Manager with the default liveness tuning.
    pub fn new(bus: Arc<dyn BusConnection>, catalog: Arc<dyn Catalog>) -> Self {
        Self::with_config(bus, catalog, LivenessConfig::default())
    }

    /// Manager with explicit liveness tuning.
    pub fn with_config(bus: Arc<dyn BusConnection>, catalog: Arc<dyn Catalog>, config: LivenessConfig) -> Self {
        Self {
            bus,
            catalog,
            config,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Control plane sharing this manager's bus and catalog.
    pub fn control(&self) -> ControlPlane<Arc<dyn Catalog>> {
        ControlPlane::new(Arc::clone(&self.bus), Arc::clone(&self.catalog))
    }

    /// Subscribe to the bus and start the liveness actor.
    ///
    /// Returns the stream of service lifecycle events.
    pub async fn start(&self) -> anyhow::Result<EventStream> {
        if self.started.swap(true, Ordering::AcqRel) {
            anyhow::bail!("manager already running");
        }

        let register_sub = self
            .bus
            .subscribe(&format!("{REGISTER_PREFIX}.>"))
            .await
            .context("subscribe to register subject")?;
        let heartbeat_sub = self
            .bus
            .subscribe(&format!("{HEARTBEAT_PREFIX}.>"))
            .await
            .context("subscribe to heartbeat subject")?;

        let (events_tx, events_rx) = events::channel();
        let (tracker_tx, tracker_rx) = mpsc::channel(TRACKER_QUEUE_DEPTH);

        let tracker = LivenessTracker::new(Arc::clone(&self.catalog), events_tx, self.config.clone());
        self.tasks
            .lock()
            .push(tokio::spawn(tracker.run(tracker_rx, self.shutdown.clone())));

        self.tasks.lock().push(tokio::spawn(ingest_loop(
            register_sub,
            heartbeat_sub,
            tracker_tx,
            self.shutdown.clone(),
        )));

        info!("manager started");
        Ok(events_rx)
    }

    /// Stop the actor and release subscriptions.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for task in self.tasks.lock().drain(..) {
            let _ = task.await;
        }
        info!("manager stopped");
    }
}

/// Parse raw bus traffic into tracker messages.
///
/// Unparseable payloads are dropped with a log line; the stream
/// continues.
async fn ingest_loop(
    mut register_sub: Subscription,
    mut heartbeat_sub: Subscription,
    tracker: mpsc::Sender<TrackerMessage>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            message = register_sub.recv() => {
                let Some(message) = message else { break };
                match serde_json::from_slice(&message.payload) {
                    Ok(register) => Some(TrackerMessage::Register(Box::new(register))),
                    Err(err) => {
                        warn!(%err, subject = %message.subject, "dropping unparseable register message");
                        None
                    }
                }
            }
            message = heartbeat_sub.recv() => {
                let Some(message) = message else { break };
                match serde_json::from_slice(&message.payload) {
                    Ok(heartbeat) => Some(TrackerMessage::Heartbeat(heartbeat)),
                    Err(err) => {
                        warn!(%err, subject = %message.subject, "dropping unparseable heartbeat");
                        None
                    }
                }
            }
            _ = shutdown.cancelled() => break,
        };

        if let Some(message) = message {
            if tracker.send(message).await.is_err() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("timeout", &self.config.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use trellis_bus::MemoryBus;
    use trellis_core::HeartbeatMessage;
    use trellis_core::InstanceInfo;
    use trellis_core::RegisterMessage;
    use trellis_core::ServiceEventKind;
    use trellis_core::ServiceMetadata;

    use super::*;
    use crate::memory::MemoryCatalog;

    fn register_payload(service: &str) -> Vec<u8> {
        serde_json::to_vec(&RegisterMessage {
            service: service.to_string(),
            version: "1.0.0".to_string(),
            metadata: ServiceMetadata {
                name: service.to_string(),
                version: "1.0.0".to_string(),
                description: String::new(),
                author: String::new(),
                tags: vec![],
                methods: vec![],
                registered_at: Utc::now(),
                updated_at: Utc::now(),
            },
            instance: InstanceInfo {
                language: "rust".to_string(),
                host_ip: "10.0.0.1".to_string(),
                host_mac: "aa:bb:cc:dd:ee:ff".to_string(),
                working_dir: "/srv".to_string(),
            },
            timestamp: Utc::now(),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn manager_tracks_register_from_the_bus() {
        let bus = MemoryBus::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let manager = Manager::new(Arc::new(bus.clone()), Arc::clone(&catalog) as Arc<dyn Catalog>);

        let mut events = manager.start().await.unwrap();
        bus.publish("$LL.register.svc", register_payload("svc")).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind, ServiceEventKind::Registered);
        assert!(catalog.get_service("svc").await.unwrap().is_some());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn garbage_on_the_bus_is_dropped() {
        let bus = MemoryBus::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let manager = Manager::new(Arc::new(bus.clone()), Arc::clone(&catalog) as Arc<dyn Catalog>);

        let mut events = manager.start().await.unwrap();
        bus.publish("$LL.register.bad", b"not json".to_vec()).await.unwrap();
        bus.publish("$LL.heartbeat.bad", b"also not json".to_vec()).await.unwrap();
        bus.publish("$LL.register.svc", register_payload("svc")).await.unwrap();

        // The good message still lands after the bad ones.
        let event = events.recv().await.unwrap();
        assert_eq!(event.service, "svc");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_without_register_sets_status() {
        let bus = MemoryBus::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let manager = Manager::new(Arc::new(bus.clone()), Arc::clone(&catalog) as Arc<dyn Catalog>);

        let _events = manager.start().await.unwrap();
        let beat = HeartbeatMessage {
            service: "lone".to_string(),
            version: "0.9.0".to_string(),
            timestamp: Utc::now(),
        };
        bus.publish("$LL.heartbeat.lone", serde_json::to_vec(&beat).unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = catalog.get_service_status("lone").await.unwrap().unwrap();
        assert!(status.online);
        assert_eq!(status.version, "0.9.0");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let bus = MemoryBus::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let manager = Manager::new(Arc::new(bus), catalog as Arc<dyn Catalog>);

        let _events = manager.start().await.unwrap();
        assert!(manager.start().await.is_err());
        manager.shutdown().await;
    }
}
