//! Instance-side control channel handler.
//!
//! Instances subscribe to `$LL.control.<service>.>` and act only on
//! messages whose `instance_key` matches their own. The handler never
//! exits the process itself: it resolves to a [`ControlOutcome`] and the
//! process entry point maps that to the documented exit code, which is
//! the contract with the supervisor.

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use trellis_bus::Subscription;
use trellis_core::ControlCommand;
use trellis_core::ControlMessage;
use trellis_core::constants::EXIT_CODE_RESTART;
use trellis_core::constants::EXIT_CODE_STOP;

/// Resolution of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// `stop` received: exit normally.
    Stop,
    /// `restart` received: exit with the restart code so the supervisor
    /// relaunches the process.
    Restart,
}

impl ControlOutcome {
    /// The process exit code this outcome maps to.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Stop => EXIT_CODE_STOP,
            Self::Restart => EXIT_CODE_RESTART,
        }
    }
}

/// Consume control messages until one targets this instance or shutdown
/// is requested.
///
/// Unparseable messages and messages for other instances are dropped
/// with a log line. The subscription is released before returning.
pub(crate) async fn control_loop(
    mut subscription: Subscription,
    instance_key: String,
    shutdown: CancellationToken,
) -> Option<ControlOutcome> {
    loop {
        tokio::select! {
            message = subscription.recv() => {
                let Some(message) = message else { return None };
                let control: ControlMessage = match serde_json::from_slice(&message.payload) {
                    Ok(control) => control,
                    Err(err) => {
                        warn!(%err, subject = %message.subject, "dropping unparseable control message");
                        continue;
                    }
                };

                if control.instance_key != instance_key {
                    debug!(
                        target_key = %control.instance_key,
                        own_key = %instance_key,
                        "control message for another instance, ignoring"
                    );
                    continue;
                }

                let outcome = match control.command {
                    ControlCommand::Stop => ControlOutcome::Stop,
                    ControlCommand::Restart => ControlOutcome::Restart,
                };
                info!(command = control.command.as_str(), "control command accepted");
                subscription.unsubscribe();
                return Some(outcome);
            }
            _ = shutdown.cancelled() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trellis_bus::BusConnection;
    use trellis_bus::MemoryBus;
    use trellis_core::subject::control_wildcard;

    use super::*;

    async fn publish_control(bus: &MemoryBus, service: &str, instance_key: &str, command: ControlCommand) {
        let message = ControlMessage {
            service: service.to_string(),
            instance_key: instance_key.to_string(),
            command,
            timestamp: Utc::now(),
        };
        let payload = serde_json::to_vec(&message).unwrap();
        bus.publish(&format!("$LL.control.{service}.cmd"), payload).await.unwrap();
    }

    #[tokio::test]
    async fn stop_resolves_for_matching_instance() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(&control_wildcard("svc")).await.unwrap();
        let handle = tokio::spawn(control_loop(sub, "key-1".to_string(), CancellationToken::new()));

        publish_control(&bus, "svc", "key-1", ControlCommand::Stop).await;

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, Some(ControlOutcome::Stop));
        assert_eq!(ControlOutcome::Stop.exit_code(), 0);
    }

    #[tokio::test]
    async fn restart_maps_to_exit_code_99() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(&control_wildcard("svc")).await.unwrap();
        let handle = tokio::spawn(control_loop(sub, "key-1".to_string(), CancellationToken::new()));

        publish_control(&bus, "svc", "key-1", ControlCommand::Restart).await;

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, ControlOutcome::Restart);
        assert_eq!(outcome.exit_code(), 99);
    }

    #[tokio::test]
    async fn other_instances_commands_are_ignored() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(&control_wildcard("svc")).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(control_loop(sub, "key-1".to_string(), shutdown.clone()));

        publish_control(&bus, "svc", "key-2", ControlCommand::Stop).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), None);
    }

    #[tokio::test]
    async fn unparseable_message_is_dropped() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe(&control_wildcard("svc")).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(control_loop(sub, "key-1".to_string(), shutdown.clone()));

        bus.publish("$LL.control.svc.cmd", b"garbage".to_vec()).await.unwrap();
        publish_control(&bus, "svc", "key-1", ControlCommand::Stop).await;

        assert_eq!(handle.await.unwrap(), Some(ControlOutcome::Stop));
    }
}
