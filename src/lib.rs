//! Trellis: a lightweight service mesh control plane over a pub/sub bus.
//!
//! Independent service processes register themselves with typed method
//! metadata, emit periodic liveness beacons, expose a versioned backup
//! facility, and can be remote-controlled; a manager observes the bus
//! and maintains the authoritative view of services, instances,
//! statuses, and events.
//!
//! This crate re-exports the workspace surface and adds the process
//! [`supervisor`] that honors the control channel's restart contract.
//!
//! # Quick tour
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use trellis::bus::MemoryBus;
//! use trellis::manager::Manager;
//! use trellis::manager::MemoryCatalog;
//! use trellis::service::ServiceRuntime;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let bus = Arc::new(MemoryBus::new());
//!
//! // Manager side: observe the bus.
//! let catalog = Arc::new(MemoryCatalog::new());
//! let manager = Manager::new(bus.clone(), catalog);
//! let mut events = manager.start().await?;
//!
//! // Service side: register a method and go live.
//! let runtime = ServiceRuntime::new("math", bus.clone());
//! runtime.register_fn("ping", |args| async move { Ok(args) });
//! runtime.start().await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.kind.as_str(), event.service);
//! }
//! # Ok(())
//! # }
//! ```

pub mod supervisor;

pub use supervisor::ExitReason;
pub use supervisor::Supervisor;

pub use trellis_core as core;

pub mod bus {
    //! Bus abstraction and the in-memory substrate.
    pub use trellis_bus::Backoff;
    pub use trellis_bus::BusConnection;
    pub use trellis_bus::BusError;
    pub use trellis_bus::BusMessage;
    pub use trellis_bus::KvEntry;
    pub use trellis_bus::MemoryBus;
    pub use trellis_bus::Subscription;
}

pub mod service {
    //! Service-side runtime and caller-side client.
    pub use trellis_service::ArgsMap;
    pub use trellis_service::ClientError;
    pub use trellis_service::ControlOutcome;
    pub use trellis_service::RpcDispatcher;
    pub use trellis_service::ServiceClient;
    pub use trellis_service::ServiceRuntime;
}

pub mod backup {
    //! Versioned backup engine, RPC surface, and client.
    pub use trellis_backup::BackupClient;
    pub use trellis_backup::BackupError;
    pub use trellis_backup::BackupService;
    pub use trellis_backup::BackupStore;
    pub use trellis_backup::apply_diff;
    pub use trellis_backup::binary_diff;
    pub use trellis_backup::reverse_merge;
}

pub mod manager {
    //! Manager: liveness tracking, catalog, control plane.
    pub use trellis_manager::Catalog;
    pub use trellis_manager::ControlPlane;
    pub use trellis_manager::EventStream;
    pub use trellis_manager::LivenessConfig;
    pub use trellis_manager::Manager;
    pub use trellis_manager::MemoryCatalog;
}
