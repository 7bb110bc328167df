//! Typed caller-side helpers for the `backup.*` namespace.
//!
//! Wraps a [`ServiceClient`] with base64 framing and the chunked
//! upload/download drivers, so callers work in bytes and version numbers
//! rather than raw arg maps.

use anyhow::Context;
use anyhow::bail;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;

use trellis_core::constants::DEFAULT_CHUNK_SIZE;
use trellis_service::ArgsMap;
use trellis_service::ServiceClient;

use crate::chunk;
use crate::chunk::ChunkAssembler;
use crate::store::BackupVersion;

/// Service name the backup agent conventionally registers under.
pub const DEFAULT_BACKUP_SERVICE: &str = "backup-agent";

/// Client for a remote backup service.
#[derive(Debug, Clone)]
pub struct BackupClient {
    client: ServiceClient,
    service: String,
}

impl BackupClient {
    /// Client targeting the conventional `backup-agent` service.
    pub fn new(client: ServiceClient) -> Self {
        Self::for_service(client, DEFAULT_BACKUP_SERVICE)
    }

    /// Client targeting a specific backup service.
    pub fn for_service(client: ServiceClient, service: impl Into<String>) -> Self {
        Self {
            client,
            service: service.into(),
        }
    }

    async fn call(&self, method: &str, args: ArgsMap) -> anyhow::Result<ArgsMap> {
        self.client
            .call(&self.service, method, args)
            .await
            .with_context(|| format!("call {method}"))
    }

    fn base_args(service_name: &str, backup_name: &str) -> ArgsMap {
        let mut args = ArgsMap::new();
        args.insert("service_name".to_string(), json!(service_name));
        args.insert("backup_name".to_string(), json!(backup_name));
        args
    }

    fn version_from(result: &ArgsMap) -> anyhow::Result<u64> {
        result
            .get("version")
            .and_then(|v| v.as_u64())
            .context("response missing version")
    }

    /// Create a full backup; returns the new version number.
    pub async fn create(&self, service_name: &str, backup_name: &str, data: &[u8]) -> anyhow::Result<u64> {
        let mut args = Self::base_args(service_name, backup_name);
        args.insert("data".to_string(), json!(BASE64.encode(data)));
        let result = self.call("backup.create", args).await?;
        Self::version_from(&result)
    }

    /// Create a full backup under a retention policy.
    pub async fn create_with_max_versions(
        &self,
        service_name: &str,
        backup_name: &str,
        data: &[u8],
        max_versions: u32,
    ) -> anyhow::Result<u64> {
        let mut args = Self::base_args(service_name, backup_name);
        args.insert("data".to_string(), json!(BASE64.encode(data)));
        args.insert("max_versions".to_string(), json!(max_versions));
        let result = self.call("backup.create", args).await?;
        Self::version_from(&result)
    }

    /// Create an incremental backup; returns the new version number.
    pub async fn create_incremental(&self, service_name: &str, backup_name: &str, data: &[u8]) -> anyhow::Result<u64> {
        let mut args = Self::base_args(service_name, backup_name);
        args.insert("data".to_string(), json!(BASE64.encode(data)));
        let result = self.call("backup.create_incremental", args).await?;
        Self::version_from(&result)
    }

    /// List stored versions; returns `(current_version, versions)`.
    pub async fn list(&self, service_name: &str, backup_name: &str) -> anyhow::Result<(u64, Vec<BackupVersion>)> {
        let result = self.call("backup.list", Self::base_args(service_name, backup_name)).await?;
        let current = result
            .get("current_version")
            .and_then(|v| v.as_u64())
            .context("response missing current_version")?;
        let versions = result
            .get("versions")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .context("decode versions")?
            .unwrap_or_default();
        Ok((current, versions))
    }

    /// Fetch the raw stored bytes of a version.
    pub async fn get(&self, service_name: &str, backup_name: &str, version: u64) -> anyhow::Result<Vec<u8>> {
        let mut args = Self::base_args(service_name, backup_name);
        args.insert("version".to_string(), json!(version));
        let result = self.call("backup.get", args).await?;
        let encoded = result.get("data").and_then(|v| v.as_str()).context("response missing data")?;
        BASE64.decode(encoded).context("decode backup data")
    }

    /// Delete a version.
    pub async fn delete(&self, service_name: &str, backup_name: &str, version: u64) -> anyhow::Result<()> {
        let mut args = Self::base_args(service_name, backup_name);
        args.insert("version".to_string(), json!(version));
        self.call("backup.delete", args).await?;
        Ok(())
    }

    /// Run retention now; returns the number of versions removed.
    pub async fn cleanup(&self, service_name: &str, backup_name: &str) -> anyhow::Result<u64> {
        let result = self.call("backup.cleanup", Self::base_args(service_name, backup_name)).await?;
        Ok(result.get("cleaned").and_then(|v| v.as_u64()).unwrap_or(0))
    }

    /// Upload a payload in chunks and store it as a new full version.
    ///
    /// Drives the whole init / chunk / complete protocol; `chunk_size`
    /// of zero uses the default.
    pub async fn upload(
        &self,
        service_name: &str,
        backup_name: &str,
        data: &[u8],
        chunk_size: usize,
    ) -> anyhow::Result<u64> {
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        let file_id = format!("{service_name}.{backup_name}");
        let metadata = chunk::ChunkMetadata::for_payload(data, chunk_size, file_id);

        let mut args = Self::base_args(service_name, backup_name);
        args.insert(
            "metadata".to_string(),
            json!(BASE64.encode(chunk::encode_chunk_metadata(&metadata))),
        );
        let result = self.call("backup.upload_init", args).await?;
        let transfer_id = result
            .get("transfer_id")
            .and_then(|v| v.as_str())
            .context("response missing transfer_id")?
            .to_string();

        for piece in chunk::split_chunks(data, chunk_size) {
            let mut args = ArgsMap::new();
            args.insert("transfer_id".to_string(), json!(transfer_id));
            args.insert("chunk".to_string(), json!(BASE64.encode(chunk::encode_chunk(&piece))));
            self.call("backup.upload_chunk", args).await?;
        }

        let mut args = ArgsMap::new();
        args.insert("transfer_id".to_string(), json!(transfer_id));
        let result = self.call("backup.upload_complete", args).await?;
        Self::version_from(&result)
    }

    /// Download a version in chunks and reassemble it.
    pub async fn download(
        &self,
        service_name: &str,
        backup_name: &str,
        version: u64,
        chunk_size: usize,
    ) -> anyhow::Result<Vec<u8>> {
        let mut args = Self::base_args(service_name, backup_name);
        args.insert("version".to_string(), json!(version));
        if chunk_size > 0 {
            args.insert("chunk_size".to_string(), json!(chunk_size));
        }
        let result = self.call("backup.download_init", args).await?;

        let transfer_id = result
            .get("transfer_id")
            .and_then(|v| v.as_str())
            .context("response missing transfer_id")?
            .to_string();
        let total_chunks = result
            .get("total_chunks")
            .and_then(|v| v.as_u64())
            .context("response missing total_chunks")? as u32;
        let metadata_encoded = result
            .get("metadata")
            .and_then(|v| v.as_str())
            .context("response missing metadata")?;
        let metadata = chunk::decode_chunk_metadata(&BASE64.decode(metadata_encoded).context("decode metadata")?)?;

        if metadata.total_chunks != total_chunks {
            bail!(
                "transfer metadata disagrees on chunk count: {} vs {}",
                metadata.total_chunks,
                total_chunks
            );
        }

        let mut assembler = ChunkAssembler::new(metadata);
        for index in 0..total_chunks {
            let mut args = ArgsMap::new();
            args.insert("transfer_id".to_string(), json!(transfer_id));
            args.insert("chunk_index".to_string(), json!(index));
            let result = self.call("backup.download_chunk", args).await?;
            let encoded = result
                .get("chunk")
                .and_then(|v| v.as_str())
                .context("response missing chunk")?;
            let piece = chunk::decode_chunk(&BASE64.decode(encoded).context("decode chunk")?)?;
            assembler.add_chunk(piece)?;
        }

        Ok(assembler.assemble()?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use trellis_bus::MemoryBus;
    use trellis_core::InstanceInfo;
    use trellis_service::ServiceRuntime;

    use super::*;
    use crate::service::BackupService;

    async fn start_agent(bus: &MemoryBus, dir: &tempfile::TempDir) -> ServiceRuntime {
        let runtime = ServiceRuntime::with_host(
            "backup-agent",
            Arc::new(bus.clone()),
            InstanceInfo {
                language: "rust".to_string(),
                host_ip: "10.0.0.3".to_string(),
                host_mac: "bb:bb:bb:bb:bb:bb".to_string(),
                working_dir: "/srv/backup".to_string(),
            },
        );
        BackupService::new(dir.path()).register(&runtime);
        runtime.start().await.unwrap();
        runtime
    }

    #[tokio::test]
    async fn create_list_get_delete_cycle() {
        let bus = MemoryBus::new();
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_agent(&bus, &dir).await;
        let client = BackupClient::new(ServiceClient::new(Arc::new(bus)));

        let v1 = client.create("svc", "db", b"one").await.unwrap();
        assert_eq!(v1, 1);
        let v2 = client.create("svc", "db", b"two").await.unwrap();
        assert_eq!(v2, 2);

        let (current, versions) = client.list("svc", "db").await.unwrap();
        assert_eq!(current, 2);
        assert_eq!(versions.len(), 2);

        assert_eq!(client.get("svc", "db", 1).await.unwrap(), b"one");

        client.delete("svc", "db", 1).await.unwrap();
        let (_, versions) = client.list("svc", "db").await.unwrap();
        assert_eq!(versions.len(), 1);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn retention_via_client() {
        let bus = MemoryBus::new();
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_agent(&bus, &dir).await;
        let client = BackupClient::new(ServiceClient::new(Arc::new(bus)));

        for i in 0..4u8 {
            client
                .create_with_max_versions("svc", "db", &[i; 8], 2)
                .await
                .unwrap();
        }

        let (current, versions) = client.list("svc", "db").await.unwrap();
        assert_eq!(current, 4);
        let numbers: Vec<u64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![3, 4]);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn chunked_upload_download_roundtrip() {
        let bus = MemoryBus::new();
        let dir = tempfile::tempdir().unwrap();
        let runtime = start_agent(&bus, &dir).await;
        let client = BackupClient::new(ServiceClient::new(Arc::new(bus)));

        let payload: Vec<u8> = (0..50_000).map(|i| (i % 239) as u8).collect();
        let version = client.upload("svc", "blob", &payload, 8 * 1024).await.unwrap();
        assert_eq!(version, 1);

        let downloaded = client.download("svc", "blob", version, 8 * 1024).await.unwrap();
        assert_eq!(downloaded, payload);

        runtime.shutdown().await;
    }
}
