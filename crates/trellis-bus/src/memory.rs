//! Process-local bus implementation.
//!
//! [`MemoryBus`] implements the full [`BusConnection`] surface without a
//! broker: subscriptions are matched in-process, request/reply uses
//! ephemeral inbox subjects, and the object/KV buckets are plain maps.
//! It is the deterministic backend for tests and the substrate for
//! embedded single-process deployments.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

use trellis_core::subject::subject_matches;

use crate::connection::BusConnection;
use crate::connection::BusError;
use crate::connection::BusMessage;
use crate::connection::KvEntry;
use crate::connection::KvWatch;
use crate::connection::Subscription;

struct SubscriptionEntry {
    id: u64,
    pattern: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct KvBucket {
    revision: u64,
    entries: HashMap<String, KvEntry>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<KvEntry>>>,
}

#[derive(Default)]
struct Inner {
    subscriptions: Vec<SubscriptionEntry>,
    objects: HashMap<String, HashMap<String, Vec<u8>>>,
    kv: HashMap<String, KvBucket>,
}

/// In-memory [`BusConnection`].
///
/// Clones share the same bus; a service and a manager holding clones of
/// one `MemoryBus` see each other's traffic.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    next_sub_id: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, subject: &str, payload: &[u8], reply: Option<&str>) {
        let mut inner = self.inner.lock();
        // Prune subscriptions whose receivers have been dropped.
        inner.subscriptions.retain(|sub| !sub.sender.is_closed());
        for sub in &inner.subscriptions {
            if subject_matches(&sub.pattern, subject) {
                let _ = sub.sender.send(BusMessage {
                    subject: subject.to_string(),
                    payload: payload.to_vec(),
                    reply: reply.map(str::to_string),
                });
            }
        }
    }

    fn add_subscription(&self, pattern: &str) -> Subscription {
        let id = self.next_sub_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.lock().subscriptions.push(SubscriptionEntry {
            id,
            pattern: pattern.to_string(),
            sender,
        });

        let inner = Arc::clone(&self.inner);
        Subscription {
            id,
            receiver,
            on_unsubscribe: Some(Box::new(move |sub_id| {
                inner.lock().subscriptions.retain(|sub| sub.id != sub_id);
            })),
        }
    }
}

#[async_trait]
impl BusConnection for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        trace!(subject, bytes = payload.len(), "publish");
        self.deliver(subject, &payload, None);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        if pattern.is_empty() {
            return Err(BusError::InvalidSubject {
                subject: pattern.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        Ok(self.add_subscription(pattern))
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let mut reply_sub = self.add_subscription(&inbox);
        self.deliver(subject, &payload, Some(&inbox));

        match tokio::time::timeout(timeout, reply_sub.recv()).await {
            Ok(Some(msg)) => Ok(msg.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::RequestTimeout {
                subject: subject.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn object_put(&self, bucket: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.inner
            .lock()
            .objects
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), payload);
        Ok(())
    }

    async fn object_get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BusError> {
        self.inner
            .lock()
            .objects
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| BusError::KeyNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<u64, BusError> {
        let mut inner = self.inner.lock();
        let bucket = inner.kv.entry(bucket.to_string()).or_default();
        bucket.revision += 1;
        let entry = KvEntry {
            key: key.to_string(),
            value,
            revision: bucket.revision,
        };
        bucket.entries.insert(key.to_string(), entry.clone());
        if let Some(watchers) = bucket.watchers.get_mut(key) {
            watchers.retain(|w| w.send(entry.clone()).is_ok());
        }
        Ok(entry.revision)
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BusError> {
        Ok(self.inner.lock().kv.get(bucket).and_then(|b| b.entries.get(key)).cloned())
    }

    async fn kv_watch(&self, bucket: &str, key: &str) -> Result<KvWatch, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .kv
            .entry(bucket.to_string())
            .or_default()
            .watchers
            .entry(key.to_string())
            .or_default()
            .push(sender);
        Ok(KvWatch { receiver })
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryBus")
            .field("subscriptions", &inner.subscriptions.len())
            .field("object_buckets", &inner.objects.len())
            .field("kv_buckets", &inner.kv.len())
            .finish()
    }
}
