//! On-disk version store.
//!
//! Layout: `<root>/<service>.<backup>/metadata.json` plus one `v<N>.bin`
//! per version. Writes are not atomic across the two files; a leftover
//! `v<N>.bin` with no manifest entry is ignored on load, and a manifest
//! entry whose file is missing surfaces as a read error on retrieval.
//!
//! Every operation on one `(service, backup)` pair runs under that pair's
//! mutex; distinct pairs proceed in parallel.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::checksum_hex;
use crate::diff;
use crate::error::BackupError;
use crate::error::IoSnafu;
use crate::error::MetadataCorruptSnafu;
use crate::error::Result;

/// Kind of a stored version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupVersionKind {
    /// Self-contained snapshot.
    Full,
    /// Block diff against `base_version`.
    Incremental,
}

/// Manifest entry for one stored version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupVersion {
    pub version: u64,
    #[serde(rename = "type")]
    pub kind: BackupVersionKind,
    /// The full version this diff applies to; `None` for full versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u64>,
    pub file_size: u64,
    /// SHA-256 hex over the stored file bytes.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Per-backup manifest, persisted as `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub service_name: String,
    pub backup_name: String,
    /// Highest version number ever assigned; never decreases.
    pub current_version: u64,
    /// Retention bound; 0 means unlimited.
    pub max_versions: u32,
    /// Stored versions, ascending.
    pub versions: Vec<BackupVersion>,
}

impl BackupManifest {
    fn empty(service: &str, backup: &str) -> Self {
        Self {
            service_name: service.to_string(),
            backup_name: backup.to_string(),
            current_version: 0,
            max_versions: 0,
            versions: Vec::new(),
        }
    }

    /// Manifest entry for a version, if it is still retained.
    pub fn version(&self, version: u64) -> Option<&BackupVersion> {
        self.versions.iter().find(|v| v.version == version)
    }

    /// The newest retained full version.
    pub fn newest_full(&self) -> Option<&BackupVersion> {
        self.versions.iter().rev().find(|v| v.kind == BackupVersionKind::Full)
    }
}

/// Outcome of a create operation.
#[derive(Debug, Clone)]
pub struct CreateReceipt {
    pub version: u64,
    pub size: u64,
    pub checksum: String,
    pub kind: BackupVersionKind,
    /// Set for incremental versions.
    pub base_version: Option<u64>,
    /// Versions removed by retention as part of this create.
    pub cleaned: u32,
}

/// The on-disk version store.
pub struct BackupStore {
    root: PathBuf,
    locks: parking_lot::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl BackupStore {
    /// Store rooted at `root`; the directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_lock(&self, service: &str, backup: &str) -> Arc<Mutex<()>> {
        let key = format!("{service}.{backup}");
        Arc::clone(self.locks.lock().entry(key).or_default())
    }

    fn backup_dir(&self, service: &str, backup: &str) -> PathBuf {
        self.root.join(format!("{service}.{backup}"))
    }

    fn manifest_path(&self, service: &str, backup: &str) -> PathBuf {
        self.backup_dir(service, backup).join("metadata.json")
    }

    fn version_path(&self, service: &str, backup: &str, version: u64) -> PathBuf {
        self.backup_dir(service, backup).join(format!("v{version}.bin"))
    }

    async fn load_manifest(&self, service: &str, backup: &str) -> Result<BackupManifest> {
        let path = self.manifest_path(service, backup);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).context(MetadataCorruptSnafu {
                path: path.display().to_string(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BackupManifest::empty(service, backup)),
            Err(err) => Err(err).context(IoSnafu {
                path: path.display().to_string(),
            }),
        }
    }

    async fn save_manifest(&self, manifest: &BackupManifest) -> Result<()> {
        let dir = self.backup_dir(&manifest.service_name, &manifest.backup_name);
        tokio::fs::create_dir_all(&dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;
        let path = self.manifest_path(&manifest.service_name, &manifest.backup_name);
        let bytes = serde_json::to_vec_pretty(manifest).expect("manifest serializes");
        tokio::fs::write(&path, bytes).await.context(IoSnafu {
            path: path.display().to_string(),
        })
    }

    /// Store `data` as a new full version.
    pub async fn create_full(
        &self,
        service: &str,
        backup: &str,
        data: &[u8],
        max_versions: Option<u32>,
    ) -> Result<CreateReceipt> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;

        let mut manifest = self.load_manifest(service, backup).await?;
        self.write_version(&mut manifest, data, BackupVersionKind::Full, None, max_versions)
            .await
    }

    /// Store `data` as an incremental diff against the newest full version.
    pub async fn create_incremental(
        &self,
        service: &str,
        backup: &str,
        data: &[u8],
        max_versions: Option<u32>,
    ) -> Result<CreateReceipt> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;

        let mut manifest = self.load_manifest(service, backup).await?;
        let base = manifest.newest_full().cloned().ok_or_else(|| BackupError::NoFullBackup {
            service: service.to_string(),
            backup: backup.to_string(),
        })?;

        let base_bytes = self.read_verified(&manifest, &base).await?;
        let ops = diff::binary_diff(&base_bytes, data);
        let encoded = diff::encode_diff_ops(&ops);

        self.write_version(
            &mut manifest,
            &encoded,
            BackupVersionKind::Incremental,
            Some(base.version),
            max_versions,
        )
        .await
    }

    async fn write_version(
        &self,
        manifest: &mut BackupManifest,
        bytes: &[u8],
        kind: BackupVersionKind,
        base_version: Option<u64>,
        max_versions: Option<u32>,
    ) -> Result<CreateReceipt> {
        if let Some(max) = max_versions.filter(|m| *m > 0) {
            manifest.max_versions = max;
        }

        manifest.current_version += 1;
        let version = manifest.current_version;
        let digest = checksum_hex(bytes);

        let dir = self.backup_dir(&manifest.service_name, &manifest.backup_name);
        tokio::fs::create_dir_all(&dir).await.context(IoSnafu {
            path: dir.display().to_string(),
        })?;
        let path = self.version_path(&manifest.service_name, &manifest.backup_name, version);
        tokio::fs::write(&path, bytes).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;

        manifest.versions.push(BackupVersion {
            version,
            kind,
            base_version,
            file_size: bytes.len() as u64,
            checksum: digest.clone(),
            created_at: Utc::now(),
        });

        if let Err(err) = self.save_manifest(manifest).await {
            // Keep the two files consistent: no manifest entry, no payload.
            let _ = tokio::fs::remove_file(&path).await;
            return Err(err);
        }

        let cleaned = self.apply_retention(manifest).await;
        if cleaned > 0 {
            if let Err(err) = self.save_manifest(manifest).await {
                warn!(
                    service = %manifest.service_name,
                    backup = %manifest.backup_name,
                    %err,
                    "failed to persist manifest after retention"
                );
            }
        }

        debug!(
            service = %manifest.service_name,
            backup = %manifest.backup_name,
            version,
            kind = ?kind,
            size = bytes.len(),
            cleaned,
            "stored backup version"
        );

        Ok(CreateReceipt {
            version,
            size: bytes.len() as u64,
            checksum: digest,
            kind,
            base_version,
            cleaned,
        })
    }

    /// Remove versions past the retention bound, oldest first.
    async fn apply_retention(&self, manifest: &mut BackupManifest) -> u32 {
        if manifest.max_versions == 0 || manifest.versions.len() <= manifest.max_versions as usize {
            return 0;
        }

        let excess = manifest.versions.len() - manifest.max_versions as usize;
        let mut cleaned = 0u32;
        for entry in manifest.versions.drain(..excess) {
            let path = self.version_path(&manifest.service_name, &manifest.backup_name, entry.version);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => cleaned += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => cleaned += 1,
                Err(err) => warn!(version = entry.version, %err, "failed to delete retained-out version file"),
            }
        }
        cleaned
    }

    async fn read_verified(&self, manifest: &BackupManifest, entry: &BackupVersion) -> Result<Vec<u8>> {
        let path = self.version_path(&manifest.service_name, &manifest.backup_name, entry.version);
        let bytes = tokio::fs::read(&path).await.context(IoSnafu {
            path: path.display().to_string(),
        })?;
        if checksum_hex(&bytes) != entry.checksum {
            return Err(BackupError::ChecksumMismatch {
                context: format!("for version {}", entry.version),
            });
        }
        Ok(bytes)
    }

    fn require_version<'m>(manifest: &'m BackupManifest, version: u64) -> Result<&'m BackupVersion> {
        manifest.version(version).ok_or(BackupError::VersionNotFound {
            version,
            current: manifest.current_version,
        })
    }

    /// Read the raw stored bytes of a version, verified against the
    /// manifest checksum. For incremental versions this is the encoded
    /// diff, not the snapshot; see [`BackupStore::materialize`].
    pub async fn get(&self, service: &str, backup: &str, version: u64) -> Result<Vec<u8>> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;

        let manifest = self.load_manifest(service, backup).await?;
        let entry = Self::require_version(&manifest, version)?;
        self.read_verified(&manifest, entry).await
    }

    /// Reconstruct the snapshot a version represents.
    ///
    /// Full versions are returned directly; incrementals are materialized
    /// by folding the patch chain over its base full version.
    pub async fn materialize(&self, service: &str, backup: &str, version: u64) -> Result<Vec<u8>> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;

        let manifest = self.load_manifest(service, backup).await?;
        let mut entry = Self::require_version(&manifest, version)?;

        let mut patches = Vec::new();
        while entry.kind == BackupVersionKind::Incremental {
            let raw = self.read_verified(&manifest, entry).await?;
            patches.push(diff::decode_diff_ops(&raw)?);
            let base = entry.base_version.unwrap_or(0);
            entry = Self::require_version(&manifest, base)?;
        }

        let base_bytes = self.read_verified(&manifest, entry).await?;
        patches.reverse();
        diff::reverse_merge(&base_bytes, &patches)
    }

    /// Delete a single version: file and manifest entry.
    pub async fn delete(&self, service: &str, backup: &str, version: u64) -> Result<()> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;

        let mut manifest = self.load_manifest(service, backup).await?;
        Self::require_version(&manifest, version)?;

        let path = self.version_path(service, backup, version);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).context(IoSnafu {
                    path: path.display().to_string(),
                });
            }
        }

        manifest.versions.retain(|v| v.version != version);
        self.save_manifest(&manifest).await
    }

    /// Current manifest for a backup (empty manifest if none exists yet).
    pub async fn list(&self, service: &str, backup: &str) -> Result<BackupManifest> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;
        self.load_manifest(service, backup).await
    }

    /// Run retention now; returns the number of versions removed.
    pub async fn cleanup(&self, service: &str, backup: &str) -> Result<u32> {
        let lock = self.entry_lock(service, backup);
        let _guard = lock.lock().await;

        let mut manifest = self.load_manifest(service, backup).await?;
        if manifest.max_versions == 0 {
            return Ok(0);
        }
        let cleaned = self.apply_retention(&mut manifest).await;
        if cleaned > 0 {
            self.save_manifest(&manifest).await?;
        }
        Ok(cleaned)
    }
}
