//! Bus abstraction for the Trellis mesh.
//!
//! Every Trellis process talks to the pub/sub substrate through the
//! [`BusConnection`] trait: subject-based publish/subscribe, request/reply,
//! and keyed object and KV buckets. The broker itself is out of scope;
//! [`MemoryBus`] provides a process-local implementation used by tests and
//! embedded deployments, and real broker bindings implement the same trait.

mod backoff;
mod connection;
mod memory;

pub use backoff::Backoff;
pub use connection::BusConnection;
pub use connection::BusError;
pub use connection::BusMessage;
pub use connection::KvEntry;
pub use connection::KvWatch;
pub use connection::Subscription;
pub use memory::MemoryBus;
