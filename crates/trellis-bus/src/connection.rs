//! The [`BusConnection`] trait and its message types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;
use tokio::sync::mpsc;

/// Errors from bus operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BusError {
    /// The connection has been closed.
    #[snafu(display("bus connection closed"))]
    Closed,

    /// A request got no reply within its timeout.
    #[snafu(display("request to '{subject}' timed out after {timeout_ms}ms"))]
    RequestTimeout {
        /// Subject the request was sent to.
        subject: String,
        /// Timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The subject or pattern is not valid.
    #[snafu(display("invalid subject '{subject}': {reason}"))]
    InvalidSubject {
        /// The offending subject.
        subject: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A keyed object or KV entry was not found.
    #[snafu(display("key '{key}' not found in bucket '{bucket}'"))]
    KeyNotFound {
        /// Bucket that was searched.
        bucket: String,
        /// Key that was not found.
        key: String,
    },

    /// Transport-level failure.
    #[snafu(display("transport error: {reason}"))]
    Transport {
        /// Human-readable description of the failure.
        reason: String,
    },
}

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Concrete subject the message was published on.
    pub subject: String,
    /// Raw payload bytes.
    pub payload: Vec<u8>,
    /// Reply subject for request/reply traffic; `None` for plain publishes.
    pub reply: Option<String>,
}

/// A live subscription to a subject pattern.
///
/// Messages are pushed into the receiver as they arrive; dropping the
/// subscription (or calling [`Subscription::unsubscribe`]) stops delivery.
pub struct Subscription {
    pub(crate) id: u64,
    pub(crate) receiver: mpsc::UnboundedReceiver<BusMessage>,
    pub(crate) on_unsubscribe: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl Subscription {
    /// Receive the next message, or `None` once the subscription ends.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    /// Stop delivery and deregister from the bus.
    pub fn unsubscribe(mut self) {
        if let Some(hook) = self.on_unsubscribe.take() {
            hook(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hook) = self.on_unsubscribe.take() {
            hook(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// An entry in a KV bucket, with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    /// Monotonically increasing per-bucket revision.
    pub revision: u64,
}

/// A watch on a KV key; yields every update after the watch began.
pub struct KvWatch {
    pub(crate) receiver: mpsc::UnboundedReceiver<KvEntry>,
}

impl KvWatch {
    /// Receive the next update, or `None` once the watch ends.
    pub async fn next(&mut self) -> Option<KvEntry> {
        self.receiver.recv().await
    }
}

/// Connection to the pub/sub substrate.
///
/// Implementations reconnect transparently with backed-off retries (see
/// [`Backoff`](crate::Backoff)); callers never observe a transient
/// disconnect as an error.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Publish a payload to a concrete subject.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Subscribe to a subject pattern (tail `>` wildcard supported).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;

    /// Publish and await a single reply, failing after `timeout`.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BusError>;

    /// Store an object under `bucket`/`key`, replacing any previous value.
    async fn object_put(&self, bucket: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Fetch an object by `bucket`/`key`.
    async fn object_get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BusError>;

    /// Write a KV entry; returns the new revision.
    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError>;

    /// Read a KV entry, `None` if absent.
    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError>;

    /// Watch a KV key for updates.
    async fn kv_watch(&self, bucket: &str, key: &str) -> Result<KvWatch, BusError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: BusConnection + ?Sized> BusConnection for Arc<T> {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        (**self).publish(subject, payload).await
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        (**self).subscribe(pattern).await
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BusError> {
        (**self).request(subject, payload, timeout).await
    }

    async fn object_put(&self, bucket: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        (**self).object_put(bucket, key, payload).await
    }

    async fn object_get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BusError> {
        (**self).object_get(bucket, key).await
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError> {
        (**self).kv_put(bucket, key, value).await
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError> {
        (**self).kv_get(bucket, key).await
    }

    async fn kv_watch(&self, bucket: &str, key: &str) -> Result<KvWatch, BusError> {
        (**self).kv_watch(bucket, key).await
    }
}
