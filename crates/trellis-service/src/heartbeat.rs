//! Heartbeat beacon loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use trellis_bus::BusConnection;
use trellis_core::HeartbeatMessage;
use trellis_core::ServiceMetadata;
use trellis_core::subject::heartbeat_subject;

/// Emit one heartbeat immediately, then one per `interval` until
/// shutdown.
///
/// Publish failures are logged and the loop continues; a transient bus
/// outage must not kill the beacon.
pub(crate) async fn heartbeat_loop(
    bus: Arc<dyn BusConnection>,
    service: String,
    metadata: Arc<RwLock<Option<ServiceMetadata>>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let subject = heartbeat_subject(&service);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let version = metadata
                    .read()
                    .as_ref()
                    .map(|m| m.version.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                let beat = HeartbeatMessage {
                    service: service.clone(),
                    version,
                    timestamp: Utc::now(),
                };
                let payload = match serde_json::to_vec(&beat) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, "failed to encode heartbeat");
                        continue;
                    }
                };
                if let Err(err) = bus.publish(&subject, payload).await {
                    warn!(%err, service = %service, "failed to publish heartbeat");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}
