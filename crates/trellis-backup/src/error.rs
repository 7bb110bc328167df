//! Error types for the backup engine.

use snafu::Snafu;

/// Result type for backup operations.
pub type Result<T, E = BackupError> = std::result::Result<T, E>;

/// Errors from backup engine operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BackupError {
    /// An incremental was requested with no full version to base on.
    #[snafu(display("no full backup found for {service}.{backup}, create a full backup first"))]
    NoFullBackup {
        /// Service the backup belongs to.
        service: String,
        /// Backup name within the service.
        backup: String,
    },

    /// The requested version does not exist.
    #[snafu(display("version {version} not found (current: {current})"))]
    VersionNotFound {
        /// Version that was requested.
        version: u64,
        /// Current (highest ever assigned) version.
        current: u64,
    },

    /// A stored payload, block, or chunk failed checksum verification.
    #[snafu(display("checksum mismatch {context}"))]
    ChecksumMismatch {
        /// What was being verified, e.g. "for chunk 3" or "at position 4096".
        context: String,
    },

    /// A binary frame ended before the declared field.
    #[snafu(display("truncated frame at byte {offset}"))]
    TruncatedFrame {
        /// Offset at which the frame ran out.
        offset: usize,
    },

    /// A diff op kind byte that the codec does not know.
    #[snafu(display("unknown diff op kind {kind}"))]
    UnknownOpKind {
        /// The unrecognized kind byte.
        kind: u8,
    },

    /// A `Match` op referenced bytes past the end of the base.
    #[snafu(display("match operation out of bounds: {end} > base length {len}"))]
    MatchOutOfBounds {
        /// Exclusive end offset of the requested range.
        end: u64,
        /// Length of the base payload.
        len: u64,
    },

    /// The transfer id is unknown (never allocated, completed, or reaped).
    #[snafu(display("transfer '{transfer_id}' not found"))]
    TransferNotFound {
        /// The transfer id presented by the caller.
        transfer_id: String,
    },

    /// Completion requested before every chunk arrived.
    #[snafu(display("incomplete transfer: {received}/{total} chunks received"))]
    IncompleteTransfer {
        /// Chunks received so far.
        received: u32,
        /// Total chunks expected.
        total: u32,
    },

    /// A download chunk index past the end of the payload.
    #[snafu(display("chunk index {index} out of range (total {total})"))]
    ChunkOutOfRange {
        /// Requested index.
        index: u32,
        /// Total chunks in the transfer.
        total: u32,
    },

    /// A chunk index missing during assembly.
    #[snafu(display("missing chunk {index}"))]
    MissingChunk {
        /// Index of the absent chunk.
        index: u32,
    },

    /// Filesystem failure.
    #[snafu(display("I/O error on {path}: {source}"))]
    Io {
        /// Path that failed.
        path: String,
        /// Source error.
        source: std::io::Error,
    },

    /// `metadata.json` exists but does not parse.
    #[snafu(display("corrupt metadata at {path}: {source}"))]
    MetadataCorrupt {
        /// Path of the metadata file.
        path: String,
        /// Source error.
        source: serde_json::Error,
    },
}
