//! Versioned backup engine for the Trellis mesh.
//!
//! Backups are stored per `(service, backup)` pair as a sequence of
//! numbered versions: self-contained `full` snapshots and `incremental`
//! block diffs against the newest full snapshot. Payloads larger than the
//! bus's per-message limit travel as checksummed chunks through the
//! upload/download transfer protocol.
//!
//! The engine is exposed in three layers:
//!
//! - [`BackupStore`]: the on-disk version store (direct API),
//! - [`BackupService`]: the `backup.*` RPC surface over a service runtime,
//! - [`BackupClient`]: typed caller-side helpers, including chunked
//!   transfer drivers.

pub mod chunk;
pub mod client;
pub mod diff;
mod error;
pub mod service;
pub mod store;
pub mod transfer;

pub use chunk::Chunk;
pub use chunk::ChunkAssembler;
pub use chunk::ChunkMetadata;
pub use chunk::split_chunks;
pub use client::BackupClient;
pub use diff::DiffKind;
pub use diff::DiffOp;
pub use diff::apply_diff;
pub use diff::binary_diff;
pub use diff::reverse_merge;
pub use error::BackupError;
pub use error::Result;
pub use service::BackupService;
pub use store::BackupManifest;
pub use store::BackupStore;
pub use store::BackupVersion;
pub use store::BackupVersionKind;
pub use store::CreateReceipt;
pub use transfer::TransferTable;

use sha2::Digest;
use sha2::Sha256;

/// SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// SHA-256 of `data` as lowercase hex.
pub fn checksum_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
