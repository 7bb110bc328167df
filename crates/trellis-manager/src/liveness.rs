//! Liveness tracking actor.
//!
//! All register and heartbeat traffic for the mesh funnels into one
//! task that owns the `last_seen` map; the 10 s sweep tick is served
//! from the same loop, so per-service transitions are serialized without
//! any lock discipline. Catalog write failures are logged and the stream
//! continues: a duplicate `online` event is preferable to a missed one.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use trellis_core::HeartbeatMessage;
use trellis_core::RegisterMessage;
use trellis_core::ServiceEvent;
use trellis_core::ServiceEventKind;
use trellis_core::constants::DEFAULT_LIVENESS_TIMEOUT;
use trellis_core::constants::LIVENESS_SWEEP_INTERVAL;

use crate::catalog::Catalog;
use crate::events::EventSender;
use crate::registry::InstanceRegistry;

/// Tuning for the liveness tracker.
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// A service with no heartbeat for this long is marked offline.
    pub timeout: Duration,
    /// Cadence of the timeout sweep.
    pub sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LIVENESS_TIMEOUT,
            sweep_interval: LIVENESS_SWEEP_INTERVAL,
        }
    }
}

/// Inbound bus traffic, already parsed by the manager's ingest task.
#[derive(Debug)]
pub(crate) enum TrackerMessage {
    Register(Box<RegisterMessage>),
    Heartbeat(HeartbeatMessage),
}

pub(crate) struct LivenessTracker<C> {
    catalog: C,
    registry: InstanceRegistry<C>,
    events: EventSender,
    config: LivenessConfig,
    last_seen: HashMap<String, Instant>,
}

impl<C: Catalog + Clone> LivenessTracker<C> {
    pub(crate) fn new(catalog: C, events: EventSender, config: LivenessConfig) -> Self {
        let registry = InstanceRegistry::new(catalog.clone());
        Self {
            catalog,
            registry,
            events,
            config,
            last_seen: HashMap::new(),
        }
    }

    /// Serve tracker messages and sweep ticks until shutdown.
    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<TrackerMessage>, shutdown: CancellationToken) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh tracker
        // never sweeps before anything was observed.
        sweep.tick().await;

        loop {
            tokio::select! {
                message = rx.recv() => {
                    match message {
                        Some(TrackerMessage::Register(register)) => self.handle_register(*register).await,
                        Some(TrackerMessage::Heartbeat(heartbeat)) => self.handle_heartbeat(heartbeat).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => self.sweep().await,
                _ = shutdown.cancelled() => break,
            }
        }
    }

    async fn handle_register(&mut self, register: RegisterMessage) {
        let service = if register.metadata.name.is_empty() {
            register.service.clone()
        } else {
            register.metadata.name.clone()
        };
        info!(service = %service, version = %register.version, "service registration");

        let is_update = match self.catalog.get_service(&service).await {
            Ok(existing) => existing.is_some(),
            Err(err) => {
                warn!(%err, service = %service, "failed to look up service, treating as new");
                false
            }
        };

        if let Err(err) = self.catalog.save_service(&register.metadata).await {
            warn!(%err, service = %service, "failed to save service metadata");
        }
        if let Err(err) = self.catalog.save_methods(&service, &register.metadata.methods).await {
            warn!(%err, service = %service, "failed to save methods");
        }
        if let Err(err) = self
            .registry
            .upsert_on_register(&service, &register.instance, &register.version)
            .await
        {
            warn!(%err, service = %service, "failed to save instance");
        }
        if let Err(err) = self.catalog.update_service_status(&service, true, &register.version).await {
            warn!(%err, service = %service, "failed to update status");
        }

        self.last_seen.insert(service.clone(), Instant::now());

        let kind = if is_update {
            ServiceEventKind::Updated
        } else {
            ServiceEventKind::Registered
        };
        self.record_event(ServiceEvent::now(kind, service), true).await;
    }

    async fn handle_heartbeat(&mut self, heartbeat: HeartbeatMessage) {
        debug!(service = %heartbeat.service, version = %heartbeat.version, "heartbeat");

        let status = match self.catalog.get_service_status(&heartbeat.service).await {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, service = %heartbeat.service, "failed to read status");
                None
            }
        };

        self.last_seen.insert(heartbeat.service.clone(), Instant::now());
        if let Err(err) = self
            .catalog
            .update_service_status(&heartbeat.service, true, &heartbeat.version)
            .await
        {
            warn!(%err, service = %heartbeat.service, "failed to update status");
        }

        // Offline -> online transition is streamed; routine heartbeats
        // are only appended to the catalog history.
        if let Some(status) = status {
            if !status.online {
                info!(service = %heartbeat.service, "service back online");
                self.record_event(ServiceEvent::now(ServiceEventKind::Online, &heartbeat.service), true)
                    .await;
            }
        }
        self.record_event(ServiceEvent::now(ServiceEventKind::Heartbeat, &heartbeat.service), false)
            .await;
    }

    async fn sweep(&mut self) {
        let timeout = self.config.timeout;
        let expired: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| seen.elapsed() > timeout)
            .map(|(service, _)| service.clone())
            .collect();

        for service in expired {
            info!(service = %service, timeout_secs = timeout.as_secs(), "service heartbeat timeout");

            if let Err(err) = self.catalog.update_service_status(&service, false, "").await {
                warn!(%err, service = %service, "failed to mark service offline");
            }
            if let Err(err) = self.registry.mark_service_offline(&service).await {
                warn!(%err, service = %service, "failed to mark instances offline");
            }

            // Removing the entry makes the next heartbeat an online
            // transition again.
            self.last_seen.remove(&service);
            self.record_event(ServiceEvent::now(ServiceEventKind::Offline, service), true).await;
        }
    }

    /// Persist an event and optionally push it to the stream.
    async fn record_event(&self, event: ServiceEvent, stream: bool) {
        if let Err(err) = self.catalog.save_event(&event).await {
            warn!(%err, service = %event.service, kind = event.kind.as_str(), "failed to save event");
        }
        if stream {
            self.events.emit(event);
        }
    }
}
