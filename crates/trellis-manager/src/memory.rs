//! In-memory catalog implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use trellis_core::Instance;
use trellis_core::MethodMetadata;
use trellis_core::ServiceEvent;
use trellis_core::ServiceMetadata;
use trellis_core::ServiceStatus;

use crate::catalog::Catalog;
use crate::catalog::Result;

#[derive(Default)]
struct Inner {
    services: HashMap<String, ServiceMetadata>,
    methods: HashMap<String, Vec<MethodMetadata>>,
    statuses: HashMap<String, ServiceStatus>,
    instances: HashMap<String, Instance>,
    events: Vec<ServiceEvent>,
}

/// [`Catalog`] backed by process-local maps.
///
/// The deterministic backend for tests and for embedded single-process
/// deployments; everything is lost on restart, which the mesh tolerates
/// because services re-register and heartbeat continuously.
#[derive(Default)]
pub struct MemoryCatalog {
    inner: RwLock<Inner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events (test/introspection helper).
    pub fn event_count(&self) -> usize {
        self.inner.read().events.len()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn save_service(&self, metadata: &ServiceMetadata) -> Result<()> {
        let mut inner = self.inner.write();
        let mut stored = metadata.clone();
        if let Some(existing) = inner.services.get(&metadata.name) {
            stored.registered_at = existing.registered_at;
        }
        inner.services.insert(metadata.name.clone(), stored);
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Option<ServiceMetadata>> {
        Ok(self.inner.read().services.get(name).cloned())
    }

    async fn list_services(&self) -> Result<Vec<ServiceMetadata>> {
        let mut services: Vec<ServiceMetadata> = self.inner.read().services.values().cloned().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(services)
    }

    async fn save_methods(&self, service: &str, methods: &[MethodMetadata]) -> Result<()> {
        self.inner.write().methods.insert(service.to_string(), methods.to_vec());
        Ok(())
    }

    async fn get_methods(&self, service: &str) -> Result<Vec<MethodMetadata>> {
        Ok(self.inner.read().methods.get(service).cloned().unwrap_or_default())
    }

    async fn update_service_status(&self, service: &str, online: bool, version: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let now = Utc::now();
        let status = inner.statuses.entry(service.to_string()).or_insert_with(|| ServiceStatus {
            service_name: service.to_string(),
            online: false,
            last_seen: now,
            version: String::new(),
            updated_at: now,
        });
        status.online = online;
        status.updated_at = now;
        if online {
            status.last_seen = now;
        }
        if !version.is_empty() {
            status.version = version.to_string();
        }
        Ok(())
    }

    async fn get_service_status(&self, service: &str) -> Result<Option<ServiceStatus>> {
        Ok(self.inner.read().statuses.get(service).cloned())
    }

    async fn save_instance(&self, instance: &Instance) -> Result<()> {
        self.inner
            .write()
            .instances
            .insert(instance.instance_key.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_key: &str) -> Result<Option<Instance>> {
        Ok(self.inner.read().instances.get(instance_key).cloned())
    }

    async fn list_instances_by_service(&self, service: &str) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .inner
            .read()
            .instances
            .values()
            .filter(|i| i.service_name == service)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.instance_key.cmp(&b.instance_key));
        Ok(instances)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self.inner.read().instances.values().cloned().collect();
        instances.sort_by(|a, b| a.instance_key.cmp(&b.instance_key));
        Ok(instances)
    }

    async fn delete_instance(&self, instance_key: &str) -> Result<()> {
        self.inner.write().instances.remove(instance_key);
        Ok(())
    }

    async fn save_event(&self, event: &ServiceEvent) -> Result<()> {
        self.inner.write().events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, limit: usize, offset: usize) -> Result<Vec<ServiceEvent>> {
        let inner = self.inner.read();
        Ok(inner.events.iter().rev().skip(offset).take(limit).cloned().collect())
    }

    async fn delete_service_cascade(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.write();
        inner.services.remove(name);
        inner.methods.remove(name);
        inner.statuses.remove(name);
        inner.instances.retain(|_, instance| instance.service_name != name);
        inner.events.retain(|event| event.service != name);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("MemoryCatalog")
            .field("services", &inner.services.len())
            .field("instances", &inner.instances.len())
            .field("events", &inner.events.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trellis_core::ServiceEventKind;
    use trellis_core::instance_key;

    use super::*;

    fn metadata(name: &str, version: &str) -> ServiceMetadata {
        ServiceMetadata {
            name: name.to_string(),
            version: version.to_string(),
            description: String::new(),
            author: String::new(),
            tags: vec![],
            methods: vec![],
            registered_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn instance(service: &str, ip: &str) -> Instance {
        Instance {
            service_name: service.to_string(),
            instance_key: instance_key(ip, "aa:bb:cc:dd:ee:ff", service),
            language: "rust".to_string(),
            host_ip: ip.to_string(),
            host_mac: "aa:bb:cc:dd:ee:ff".to_string(),
            working_dir: "/srv".to_string(),
            version: "1.0.0".to_string(),
            first_seen: Utc::now(),
            last_heartbeat: Utc::now(),
            online: true,
        }
    }

    #[tokio::test]
    async fn save_service_preserves_registration_time() {
        let catalog = MemoryCatalog::new();
        catalog.save_service(&metadata("svc", "1.0.0")).await.unwrap();
        let first = catalog.get_service("svc").await.unwrap().unwrap();

        catalog.save_service(&metadata("svc", "2.0.0")).await.unwrap();
        let second = catalog.get_service("svc").await.unwrap().unwrap();

        assert_eq!(second.version, "2.0.0");
        assert_eq!(second.registered_at, first.registered_at);
    }

    #[tokio::test]
    async fn instance_upsert_is_keyed() {
        let catalog = MemoryCatalog::new();
        catalog.save_instance(&instance("svc", "10.0.0.1")).await.unwrap();
        catalog.save_instance(&instance("svc", "10.0.0.1")).await.unwrap();
        catalog.save_instance(&instance("svc", "10.0.0.2")).await.unwrap();

        assert_eq!(catalog.list_instances_by_service("svc").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn status_upsert_tracks_last_seen_only_when_online() {
        let catalog = MemoryCatalog::new();
        catalog.update_service_status("svc", true, "1.0.0").await.unwrap();
        let online = catalog.get_service_status("svc").await.unwrap().unwrap();
        assert!(online.online);
        assert_eq!(online.version, "1.0.0");

        catalog.update_service_status("svc", false, "").await.unwrap();
        let offline = catalog.get_service_status("svc").await.unwrap().unwrap();
        assert!(!offline.online);
        // Version survives the offline transition.
        assert_eq!(offline.version, "1.0.0");
        assert_eq!(offline.last_seen, online.last_seen);
    }

    #[tokio::test]
    async fn events_are_newest_first_and_paginated() {
        let catalog = MemoryCatalog::new();
        for kind in [
            ServiceEventKind::Registered,
            ServiceEventKind::Online,
            ServiceEventKind::Offline,
        ] {
            catalog.save_event(&ServiceEvent::now(kind, "svc")).await.unwrap();
        }

        let events = catalog.list_events(2, 0).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ServiceEventKind::Offline);

        let events = catalog.list_events(2, 2).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ServiceEventKind::Registered);
    }

    #[tokio::test]
    async fn cascade_delete_removes_everything() {
        let catalog = MemoryCatalog::new();
        catalog.save_service(&metadata("svc", "1.0.0")).await.unwrap();
        catalog.save_methods("svc", &[MethodMetadata::named("m")]).await.unwrap();
        catalog.update_service_status("svc", true, "1.0.0").await.unwrap();
        catalog.save_instance(&instance("svc", "10.0.0.1")).await.unwrap();
        catalog
            .save_event(&ServiceEvent::now(ServiceEventKind::Registered, "svc"))
            .await
            .unwrap();
        catalog.save_service(&metadata("other", "1.0.0")).await.unwrap();

        catalog.delete_service_cascade("svc").await.unwrap();

        assert!(catalog.get_service("svc").await.unwrap().is_none());
        assert!(catalog.get_methods("svc").await.unwrap().is_empty());
        assert!(catalog.get_service_status("svc").await.unwrap().is_none());
        assert!(catalog.list_instances_by_service("svc").await.unwrap().is_empty());
        assert_eq!(catalog.list_events(10, 0).await.unwrap().len(), 0);
        assert!(catalog.get_service("other").await.unwrap().is_some());
    }
}
