//! Service event stream.
//!
//! The liveness tracker pushes [`ServiceEvent`]s into a small buffered
//! channel; downstream consumers (WebSocket fan-out, audit log) are out
//! of scope. Emission never blocks the tracker: when the buffer is full
//! the event is dropped with a log line, and the catalog remains the
//! durable record.

use tokio::sync::mpsc;
use tracing::warn;

use trellis_core::ServiceEvent;
use trellis_core::constants::EVENT_CHANNEL_CAPACITY;

/// Sending half, held by the liveness tracker.
#[derive(Clone)]
pub(crate) struct EventSender {
    sender: mpsc::Sender<ServiceEvent>,
}

impl EventSender {
    /// Push an event without blocking; drops on a full or closed channel.
    pub(crate) fn emit(&self, event: ServiceEvent) {
        if let Err(err) = self.sender.try_send(event) {
            warn!(%err, "dropping service event, stream is full or closed");
        }
    }
}

/// Receiving half, handed to the manager's consumer.
pub struct EventStream {
    receiver: mpsc::Receiver<ServiceEvent>,
}

impl EventStream {
    /// Receive the next event, or `None` once the manager stops.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<ServiceEvent> {
        self.receiver.try_recv().ok()
    }
}

/// Create a connected sender/stream pair.
pub(crate) fn channel() -> (EventSender, EventStream) {
    let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (EventSender { sender }, EventStream { receiver })
}

#[cfg(test)]
mod tests {
    use trellis_core::ServiceEventKind;

    use super::*;

    #[tokio::test]
    async fn events_flow_in_order() {
        let (sender, mut stream) = channel();
        sender.emit(ServiceEvent::now(ServiceEventKind::Registered, "svc"));
        sender.emit(ServiceEvent::now(ServiceEventKind::Offline, "svc"));

        assert_eq!(stream.recv().await.unwrap().kind, ServiceEventKind::Registered);
        assert_eq!(stream.recv().await.unwrap().kind, ServiceEventKind::Offline);
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn emit_survives_dropped_receiver() {
        let (sender, stream) = channel();
        drop(stream);
        // Does not panic or block.
        sender.emit(ServiceEvent::now(ServiceEventKind::Online, "svc"));
    }
}
