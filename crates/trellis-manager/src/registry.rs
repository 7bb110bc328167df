//! Instance registry.
//!
//! The registry is the sole owner of instance state: per-instance rows
//! keyed by `instance_key`, upserted on register and flipped offline by
//! the liveness sweep. Any other reader goes through it (or the catalog
//! it writes to).

use chrono::Utc;
use snafu::Snafu;

use trellis_core::Instance;
use trellis_core::InstanceInfo;
use trellis_core::instance_key;

use crate::catalog::Catalog;
use crate::catalog::CatalogError;

/// Errors from registry operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RegistryError {
    /// The keyed instance does not exist.
    #[snafu(display("instance '{instance_key}' not found"))]
    NotFound {
        /// Instance key that was looked up.
        instance_key: String,
    },

    /// Deleting an online instance violates the registry invariant.
    #[snafu(display("cannot delete online instance '{instance_key}'"))]
    InstanceOnline {
        /// Instance key of the online instance.
        instance_key: String,
    },

    /// Catalog failure.
    #[snafu(display("{source}"))]
    Catalog {
        /// Source error.
        source: CatalogError,
    },
}

impl From<CatalogError> for RegistryError {
    fn from(source: CatalogError) -> Self {
        Self::Catalog { source }
    }
}

/// Per-instance records over the catalog.
pub struct InstanceRegistry<C> {
    catalog: C,
}

impl<C: Catalog> InstanceRegistry<C> {
    pub fn new(catalog: C) -> Self {
        Self { catalog }
    }

    /// Upsert the row for a registering instance.
    ///
    /// `first_seen` is preserved from an existing row so re-registration
    /// never rejuvenates an instance; everything else reflects the new
    /// registration.
    pub async fn upsert_on_register(
        &self,
        service: &str,
        info: &InstanceInfo,
        version: &str,
    ) -> Result<Instance, RegistryError> {
        let key = instance_key(&info.host_ip, &info.host_mac, service);
        let now = Utc::now();
        let first_seen = match self.catalog.get_instance(&key).await? {
            Some(existing) => existing.first_seen.min(now),
            None => now,
        };

        let instance = Instance {
            service_name: service.to_string(),
            instance_key: key,
            language: info.language.clone(),
            host_ip: info.host_ip.clone(),
            host_mac: info.host_mac.clone(),
            working_dir: info.working_dir.clone(),
            version: version.to_string(),
            first_seen,
            last_heartbeat: now,
            online: true,
        };
        self.catalog.save_instance(&instance).await?;
        Ok(instance)
    }

    /// Flip every instance of a service offline (liveness sweep).
    pub async fn mark_service_offline(&self, service: &str) -> Result<(), RegistryError> {
        for mut instance in self.catalog.list_instances_by_service(service).await? {
            if instance.online {
                instance.online = false;
                self.catalog.save_instance(&instance).await?;
            }
        }
        Ok(())
    }

    /// Flip one instance offline (after a targeted stop).
    pub async fn mark_instance_offline(&self, key: &str) -> Result<(), RegistryError> {
        let mut instance = self.catalog.get_instance(key).await?.ok_or_else(|| RegistryError::NotFound {
            instance_key: key.to_string(),
        })?;
        instance.online = false;
        self.catalog.save_instance(&instance).await?;
        Ok(())
    }

    /// Delete an instance row; rejected while the instance is online.
    pub async fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let instance = self.catalog.get_instance(key).await?.ok_or_else(|| RegistryError::NotFound {
            instance_key: key.to_string(),
        })?;
        if instance.online {
            return Err(RegistryError::InstanceOnline {
                instance_key: key.to_string(),
            });
        }
        self.catalog.delete_instance(key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::MemoryCatalog;

    fn info(ip: &str) -> InstanceInfo {
        InstanceInfo {
            language: "rust".to_string(),
            host_ip: ip.to_string(),
            host_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            working_dir: "/srv".to_string(),
        }
    }

    #[tokio::test]
    async fn register_creates_exactly_one_row_per_key() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = InstanceRegistry::new(Arc::clone(&catalog) as Arc<dyn Catalog>);

        for _ in 0..3 {
            registry.upsert_on_register("svc", &info("10.0.0.1"), "1.0.0").await.unwrap();
        }
        registry.upsert_on_register("svc", &info("10.0.0.2"), "1.0.0").await.unwrap();

        assert_eq!(catalog.list_instances_by_service("svc").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn reregistration_preserves_first_seen() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = InstanceRegistry::new(Arc::clone(&catalog) as Arc<dyn Catalog>);

        let first = registry.upsert_on_register("svc", &info("10.0.0.1"), "1.0.0").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = registry.upsert_on_register("svc", &info("10.0.0.1"), "1.1.0").await.unwrap();

        assert_eq!(second.first_seen, first.first_seen);
        assert!(second.last_heartbeat >= first.last_heartbeat);
        assert_eq!(second.version, "1.1.0");
    }

    #[tokio::test]
    async fn sweep_marks_all_instances_offline() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = InstanceRegistry::new(Arc::clone(&catalog) as Arc<dyn Catalog>);

        registry.upsert_on_register("svc", &info("10.0.0.1"), "1.0.0").await.unwrap();
        registry.upsert_on_register("svc", &info("10.0.0.2"), "1.0.0").await.unwrap();

        registry.mark_service_offline("svc").await.unwrap();
        let instances = catalog.list_instances_by_service("svc").await.unwrap();
        assert!(instances.iter().all(|i| !i.online));
    }

    #[tokio::test]
    async fn online_instances_cannot_be_deleted() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = InstanceRegistry::new(Arc::clone(&catalog) as Arc<dyn Catalog>);

        let instance = registry.upsert_on_register("svc", &info("10.0.0.1"), "1.0.0").await.unwrap();

        let err = registry.delete(&instance.instance_key).await.unwrap_err();
        assert!(matches!(err, RegistryError::InstanceOnline { .. }));

        registry.mark_instance_offline(&instance.instance_key).await.unwrap();
        registry.delete(&instance.instance_key).await.unwrap();
        assert!(catalog.get_instance(&instance.instance_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_unknown_instance_is_not_found() {
        let catalog = Arc::new(MemoryCatalog::new());
        let registry = InstanceRegistry::new(Arc::clone(&catalog) as Arc<dyn Catalog>);
        let err = registry.delete("missing").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound { .. }));
    }
}
