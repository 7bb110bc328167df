//! The `backup.*` RPC surface.
//!
//! [`BackupService`] wires the version store and the transfer table into
//! a [`ServiceRuntime`]: every method declares typed parameter metadata,
//! so malformed calls are rejected by the dispatcher's validator before
//! a handler runs. Binary payloads travel base64-encoded inside the JSON
//! args.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use trellis_core::MethodMetadata;
use trellis_core::constants::DEFAULT_TRANSFER_TTL;
use trellis_core::types::ParamType;
use trellis_core::types::ParameterMetadata;
use trellis_service::ArgsMap;
use trellis_service::ServiceRuntime;

use crate::chunk;
use crate::store::BackupStore;
use crate::store::CreateReceipt;
use crate::transfer::TransferTable;

/// Cadence of the abandoned-transfer reaper.
const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Backup engine exposed as a mesh service.
pub struct BackupService {
    store: Arc<BackupStore>,
    transfers: Arc<TransferTable>,
}

impl BackupService {
    /// Service storing versions under `root`, with the default transfer
    /// TTL.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            store: Arc::new(BackupStore::new(root)),
            transfers: Arc::new(TransferTable::new(DEFAULT_TRANSFER_TTL)),
        }
    }

    /// Service over pre-built store and transfer table.
    pub fn with_parts(store: Arc<BackupStore>, transfers: Arc<TransferTable>) -> Self {
        Self { store, transfers }
    }

    pub fn store(&self) -> &Arc<BackupStore> {
        &self.store
    }

    pub fn transfers(&self) -> &Arc<TransferTable> {
        &self.transfers
    }

    /// Start the reaper for abandoned transfers.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        self.transfers.spawn_reaper(REAPER_INTERVAL, shutdown)
    }

    /// Register every `backup.*` method on `runtime`.
    pub fn register(&self, runtime: &ServiceRuntime) {
        let store = Arc::clone(&self.store);
        runtime.register_method(create_metadata("backup.create"), move |args| {
            let store = Arc::clone(&store);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;
                let data = decode_base64(&args, "data")?;
                let max_versions = optional_u32(&args, "max_versions")?;

                let receipt = store.create_full(&service, &backup, &data, max_versions).await?;
                Ok(receipt_result(&receipt))
            }
        });

        let store = Arc::clone(&self.store);
        runtime.register_method(create_metadata("backup.create_incremental"), move |args| {
            let store = Arc::clone(&store);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;
                let data = decode_base64(&args, "data")?;
                let max_versions = optional_u32(&args, "max_versions")?;

                let receipt = store.create_incremental(&service, &backup, &data, max_versions).await?;
                let mut result = receipt_result(&receipt);
                result.insert("type".to_string(), json!("incremental"));
                if let Some(base) = receipt.base_version {
                    result.insert("base_version".to_string(), json!(base));
                }
                Ok(result)
            }
        });

        let store = Arc::clone(&self.store);
        runtime.register_method(named_backup_metadata("backup.list"), move |args| {
            let store = Arc::clone(&store);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;

                let manifest = store.list(&service, &backup).await?;
                let mut result = ArgsMap::new();
                result.insert("current_version".to_string(), json!(manifest.current_version));
                result.insert("versions".to_string(), serde_json::to_value(&manifest.versions)?);
                Ok(result)
            }
        });

        let store = Arc::clone(&self.store);
        runtime.register_method(versioned_metadata("backup.get"), move |args| {
            let store = Arc::clone(&store);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;
                let version = required_u64(&args, "version")?;

                let data = store.get(&service, &backup, version).await?;
                let mut result = ArgsMap::new();
                result.insert("data".to_string(), json!(BASE64.encode(&data)));
                result.insert("size".to_string(), json!(data.len()));
                result.insert("checksum".to_string(), json!(crate::checksum_hex(&data)));
                Ok(result)
            }
        });

        let store = Arc::clone(&self.store);
        runtime.register_method(versioned_metadata("backup.delete"), move |args| {
            let store = Arc::clone(&store);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;
                let version = required_u64(&args, "version")?;

                store.delete(&service, &backup, version).await?;
                let mut result = ArgsMap::new();
                result.insert("deleted".to_string(), json!(true));
                result.insert("version".to_string(), json!(version));
                Ok(result)
            }
        });

        let store = Arc::clone(&self.store);
        runtime.register_method(named_backup_metadata("backup.cleanup"), move |args| {
            let store = Arc::clone(&store);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;

                let cleaned = store.cleanup(&service, &backup).await?;
                let mut result = ArgsMap::new();
                result.insert("cleaned".to_string(), json!(cleaned));
                Ok(result)
            }
        });

        let transfers = Arc::clone(&self.transfers);
        runtime.register_method(upload_init_metadata(), move |args| {
            let transfers = Arc::clone(&transfers);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;
                let metadata_bytes = decode_base64(&args, "metadata")?;
                let metadata = chunk::decode_chunk_metadata(&metadata_bytes)?;

                let ticket = transfers.begin_upload(&service, &backup, metadata);
                debug!(
                    transfer_id = %ticket.transfer_id,
                    total_chunks = ticket.total_chunks,
                    "upload transfer opened"
                );
                let mut result = ArgsMap::new();
                result.insert("transfer_id".to_string(), json!(ticket.transfer_id));
                result.insert("total_chunks".to_string(), json!(ticket.total_chunks));
                result.insert("total_size".to_string(), json!(ticket.total_size));
                Ok(result)
            }
        });

        let transfers = Arc::clone(&self.transfers);
        runtime.register_method(upload_chunk_metadata(), move |args| {
            let transfers = Arc::clone(&transfers);
            async move {
                let transfer_id = required_str(&args, "transfer_id")?;
                let chunk_bytes = decode_base64(&args, "chunk")?;
                let chunk = chunk::decode_chunk(&chunk_bytes)?;

                transfers.add_upload_chunk(&transfer_id, chunk)?;
                let mut result = ArgsMap::new();
                result.insert("ok".to_string(), json!(true));
                Ok(result)
            }
        });

        let store = Arc::clone(&self.store);
        let transfers = Arc::clone(&self.transfers);
        runtime.register_method(transfer_only_metadata("backup.upload_complete"), move |args| {
            let store = Arc::clone(&store);
            let transfers = Arc::clone(&transfers);
            async move {
                let transfer_id = required_str(&args, "transfer_id")?;
                let (service, backup, payload) = transfers.complete_upload(&transfer_id)?;

                // Spool the assembled payload through the temp area so a
                // crash mid-create never leaves a half-written version.
                let temp_dir = store.root().join("temp");
                tokio::fs::create_dir_all(&temp_dir).await.context("create temp dir")?;
                let spool = temp_dir.join(format!("{transfer_id}.tmp"));
                tokio::fs::write(&spool, &payload).await.context("spool upload payload")?;

                let receipt = store.create_full(&service, &backup, &payload, None).await;
                let _ = tokio::fs::remove_file(&spool).await;
                let receipt = receipt?;

                Ok(receipt_result(&receipt))
            }
        });

        let store = Arc::clone(&self.store);
        let transfers = Arc::clone(&self.transfers);
        runtime.register_method(download_init_metadata(), move |args| {
            let store = Arc::clone(&store);
            let transfers = Arc::clone(&transfers);
            async move {
                let service = required_str(&args, "service_name")?;
                let backup = required_str(&args, "backup_name")?;
                let version = required_u64(&args, "version")?;
                let chunk_size = optional_u32(&args, "chunk_size")?.unwrap_or(0) as usize;

                let payload = store.get(&service, &backup, version).await?;
                let file_id = format!("{service}.{backup}.v{version}");
                let effective_size = if chunk_size == 0 {
                    trellis_core::constants::DEFAULT_CHUNK_SIZE
                } else {
                    chunk_size
                };
                let metadata = chunk::ChunkMetadata::for_payload(&payload, effective_size, file_id);
                let encoded_metadata = chunk::encode_chunk_metadata(&metadata);
                let (transfer_id, total_chunks) = transfers.begin_download(payload, chunk_size);

                let mut result = ArgsMap::new();
                result.insert("transfer_id".to_string(), json!(transfer_id));
                result.insert("total_chunks".to_string(), json!(total_chunks));
                result.insert("metadata".to_string(), json!(BASE64.encode(encoded_metadata)));
                Ok(result)
            }
        });

        let transfers = Arc::clone(&self.transfers);
        runtime.register_method(download_chunk_metadata(), move |args| {
            let transfers = Arc::clone(&transfers);
            async move {
                let transfer_id = required_str(&args, "transfer_id")?;
                let index = required_u64(&args, "chunk_index")? as u32;

                let chunk = transfers.download_chunk(&transfer_id, index)?;
                let mut result = ArgsMap::new();
                result.insert("chunk".to_string(), json!(BASE64.encode(chunk::encode_chunk(&chunk))));
                Ok(result)
            }
        });
    }
}

// ============================================================================
// Argument helpers
// ============================================================================

fn required_str(args: &ArgsMap, name: &str) -> anyhow::Result<String> {
    args.get(name)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .with_context(|| format!("missing {name}"))
}

fn required_u64(args: &ArgsMap, name: &str) -> anyhow::Result<u64> {
    args.get(name)
        .and_then(|v| v.as_f64())
        .filter(|v| *v >= 0.0)
        .map(|v| v as u64)
        .with_context(|| format!("missing {name}"))
}

fn optional_u32(args: &ArgsMap, name: &str) -> anyhow::Result<Option<u32>> {
    match args.get(name) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .filter(|v| *v >= 0.0)
            .map(|v| Some(v as u32))
            .with_context(|| format!("invalid {name}")),
    }
}

fn decode_base64(args: &ArgsMap, name: &str) -> anyhow::Result<Vec<u8>> {
    let encoded = required_str(args, name)?;
    BASE64.decode(encoded).with_context(|| format!("decode {name}"))
}

fn receipt_result(receipt: &CreateReceipt) -> ArgsMap {
    let mut result = ArgsMap::new();
    result.insert("version".to_string(), json!(receipt.version));
    result.insert("size".to_string(), json!(receipt.size));
    result.insert("checksum".to_string(), json!(receipt.checksum));
    if receipt.cleaned > 0 {
        result.insert("cleaned".to_string(), json!(receipt.cleaned));
    }
    result
}

// ============================================================================
// Method metadata
// ============================================================================

fn param(name: &str, param_type: ParamType, required: bool) -> ParameterMetadata {
    ParameterMetadata {
        name: name.to_string(),
        param_type,
        required,
        description: String::new(),
        default: None,
    }
}

fn create_metadata(name: &str) -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("service_name", ParamType::String, true),
            param("backup_name", ParamType::String, true),
            param("data", ParamType::String, true),
            param("max_versions", ParamType::Number, false),
        ],
        ..MethodMetadata::named(name)
    }
}

fn named_backup_metadata(name: &str) -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("service_name", ParamType::String, true),
            param("backup_name", ParamType::String, true),
        ],
        ..MethodMetadata::named(name)
    }
}

fn versioned_metadata(name: &str) -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("service_name", ParamType::String, true),
            param("backup_name", ParamType::String, true),
            param("version", ParamType::Number, true),
        ],
        ..MethodMetadata::named(name)
    }
}

fn upload_init_metadata() -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("service_name", ParamType::String, true),
            param("backup_name", ParamType::String, true),
            param("metadata", ParamType::String, true),
        ],
        ..MethodMetadata::named("backup.upload_init")
    }
}

fn upload_chunk_metadata() -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("transfer_id", ParamType::String, true),
            param("chunk", ParamType::String, true),
        ],
        ..MethodMetadata::named("backup.upload_chunk")
    }
}

fn transfer_only_metadata(name: &str) -> MethodMetadata {
    MethodMetadata {
        params: vec![param("transfer_id", ParamType::String, true)],
        ..MethodMetadata::named(name)
    }
}

fn download_init_metadata() -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("service_name", ParamType::String, true),
            param("backup_name", ParamType::String, true),
            param("version", ParamType::Number, true),
            param("chunk_size", ParamType::Number, false),
        ],
        ..MethodMetadata::named("backup.download_init")
    }
}

fn download_chunk_metadata() -> MethodMetadata {
    MethodMetadata {
        params: vec![
            param("transfer_id", ParamType::String, true),
            param("chunk_index", ParamType::Number, true),
        ],
        ..MethodMetadata::named("backup.download_chunk")
    }
}
