//! Durable mirror of the mesh state.
//!
//! The [`Catalog`] trait is the manager's only storage seam: the liveness
//! tracker and the instance registry write through it, and the admin
//! surface (out of scope here) reads from it. [`MemoryCatalog`]
//! (crate::MemoryCatalog) is the in-process implementation; a relational
//! backend implements the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use snafu::Snafu;

use trellis_core::Instance;
use trellis_core::MethodMetadata;
use trellis_core::ServiceEvent;
use trellis_core::ServiceMetadata;
use trellis_core::ServiceStatus;

/// Errors from catalog operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CatalogError {
    /// The named service does not exist.
    #[snafu(display("service '{service}' not found"))]
    ServiceNotFound {
        /// Service name that was looked up.
        service: String,
    },

    /// The keyed instance does not exist.
    #[snafu(display("instance '{instance_key}' not found"))]
    InstanceNotFound {
        /// Instance key that was looked up.
        instance_key: String,
    },

    /// Backend failure.
    #[snafu(display("catalog storage error: {reason}"))]
    Storage {
        /// Human-readable description of the failure.
        reason: String,
    },
}

/// Result type for catalog operations.
pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

/// Storage interface consumed by the tracker and registry.
///
/// Implementations are internally thread-safe; all component writes
/// funnel through this API.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Insert or update a service's metadata.
    async fn save_service(&self, metadata: &ServiceMetadata) -> Result<()>;

    /// Fetch a service's metadata by name.
    async fn get_service(&self, name: &str) -> Result<Option<ServiceMetadata>>;

    /// All registered services.
    async fn list_services(&self) -> Result<Vec<ServiceMetadata>>;

    /// Replace the method set of a service.
    async fn save_methods(&self, service: &str, methods: &[MethodMetadata]) -> Result<()>;

    /// Method set of a service.
    async fn get_methods(&self, service: &str) -> Result<Vec<MethodMetadata>>;

    /// Update the aggregate online/offline status of a service.
    async fn update_service_status(&self, service: &str, online: bool, version: &str) -> Result<()>;

    /// Current status of a service.
    async fn get_service_status(&self, service: &str) -> Result<Option<ServiceStatus>>;

    /// Insert or update an instance row (keyed by `instance_key`).
    async fn save_instance(&self, instance: &Instance) -> Result<()>;

    /// Fetch an instance by key.
    async fn get_instance(&self, instance_key: &str) -> Result<Option<Instance>>;

    /// All instances of a service.
    async fn list_instances_by_service(&self, service: &str) -> Result<Vec<Instance>>;

    /// All instances across services.
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Delete an instance row.
    async fn delete_instance(&self, instance_key: &str) -> Result<()>;

    /// Append an immutable event record.
    async fn save_event(&self, event: &ServiceEvent) -> Result<()>;

    /// Events, newest first, paginated.
    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<ServiceEvent>>;

    /// Transactionally delete a service with its methods, instances,
    /// status, and event history.
    async fn delete_service_cascade(&self, name: &str) -> Result<()>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: Catalog + ?Sized> Catalog for Arc<T> {
    async fn save_service(&self, metadata: &ServiceMetadata) -> Result<()> {
        (**self).save_service(metadata).await
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceMetadata>> {
        (**self).get_service(name).await
    }

    async fn list_services(&self) -> Result<Vec<ServiceMetadata>> {
        (**self).list_services().await
    }

    async fn save_methods(&self, service: &str, methods: &[MethodMetadata]) -> Result<()> {
        (**self).save_methods(service, methods).await
    }

    async fn get_methods(&self, service: &str) -> Result<Vec<MethodMetadata>> {
        (**self).get_methods(service).await
    }

    async fn update_service_status(&self, service: &str, online: bool, version: &str) -> Result<()> {
        (**self).update_service_status(service, online, version).await
    }

    async fn get_service_status(&self, service: &str) -> Result<Option<ServiceStatus>> {
        (**self).get_service_status(service).await
    }

    async fn save_instance(&self, instance: &Instance) -> Result<()> {
        (**self).save_instance(instance).await
    }

    async fn get_instance(&self, instance_key: &str) -> Result<Option<Instance>> {
        (**self).get_instance(instance_key).await
    }

    async fn list_instances_by_service(&self, service: &str) -> Result<Vec<Instance>> {
        (**self).list_instances_by_service(service).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        (**self).list_instances().await
    }

    async fn delete_instance(&self, instance_key: &str) -> Result<()> {
        (**self).delete_instance(instance_key).await
    }

    async fn save_event(&self, event: &ServiceEvent) -> Result<()> {
        (**self).save_event(event).await
    }

    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<ServiceEvent>> {
        (**self).list_events(limit, offset).await
    }

    async fn delete_service_cascade(&self, name: &str) -> Result<()> {
        (**self).delete_service_cascade(name).await
    }
}
