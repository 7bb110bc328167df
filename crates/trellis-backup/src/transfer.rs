//! Chunked transfer state.
//!
//! Uploads and downloads that exceed the bus's per-message limit are
//! staged here, keyed by a server-assigned transfer id. Entries are
//! purged on completion; a reaper task removes transfers abandoned by
//! their client.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use uuid::Uuid;

use trellis_core::constants::DEFAULT_CHUNK_SIZE;

use crate::chunk::Chunk;
use crate::chunk::ChunkAssembler;
use crate::chunk::ChunkMetadata;
use crate::chunk::total_chunks;
use crate::error::BackupError;
use crate::error::Result;

/// Handle returned by [`TransferTable::begin_upload`].
#[derive(Debug, Clone)]
pub struct UploadTicket {
    pub transfer_id: String,
    pub total_chunks: u32,
    pub total_size: u64,
}

struct UploadState {
    service: String,
    backup: String,
    assembler: ChunkAssembler,
    last_activity: Instant,
}

struct DownloadState {
    payload: Vec<u8>,
    chunk_size: usize,
    total_chunks: u32,
    served: HashSet<u32>,
    last_activity: Instant,
}

/// In-memory table of live chunked transfers.
pub struct TransferTable {
    uploads: Mutex<HashMap<String, UploadState>>,
    downloads: Mutex<HashMap<String, DownloadState>>,
    ttl: Duration,
}

impl TransferTable {
    /// Table whose entries expire after `ttl` of inactivity.
    pub fn new(ttl: Duration) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Allocate an upload assembler for the described payload.
    pub fn begin_upload(&self, service: &str, backup: &str, metadata: ChunkMetadata) -> UploadTicket {
        let transfer_id = Uuid::new_v4().to_string();
        let ticket = UploadTicket {
            transfer_id: transfer_id.clone(),
            total_chunks: metadata.total_chunks,
            total_size: metadata.total_size,
        };
        self.uploads.lock().insert(
            transfer_id,
            UploadState {
                service: service.to_string(),
                backup: backup.to_string(),
                assembler: ChunkAssembler::new(metadata),
                last_activity: Instant::now(),
            },
        );
        ticket
    }

    /// Accept one upload chunk; duplicates with valid checksums are
    /// ignored, corrupt bytes fail regardless of index.
    pub fn add_upload_chunk(&self, transfer_id: &str, chunk: Chunk) -> Result<()> {
        let mut uploads = self.uploads.lock();
        let state = uploads.get_mut(transfer_id).ok_or_else(|| BackupError::TransferNotFound {
            transfer_id: transfer_id.to_string(),
        })?;
        state.last_activity = Instant::now();
        state.assembler.add_chunk(chunk)
    }

    /// Chunk indices still missing from an upload.
    pub fn missing_chunks(&self, transfer_id: &str) -> Result<Vec<u32>> {
        let uploads = self.uploads.lock();
        let state = uploads.get(transfer_id).ok_or_else(|| BackupError::TransferNotFound {
            transfer_id: transfer_id.to_string(),
        })?;
        Ok(state.assembler.missing_chunks())
    }

    /// Assemble a finished upload and purge it from the table.
    ///
    /// An incomplete transfer stays resident so the client can send the
    /// missing chunks; an assembled payload that fails the whole-payload
    /// checksum is discarded.
    pub fn complete_upload(&self, transfer_id: &str) -> Result<(String, String, Vec<u8>)> {
        let mut uploads = self.uploads.lock();
        let state = uploads.get_mut(transfer_id).ok_or_else(|| BackupError::TransferNotFound {
            transfer_id: transfer_id.to_string(),
        })?;

        if !state.assembler.is_complete() {
            state.last_activity = Instant::now();
            return Err(BackupError::IncompleteTransfer {
                received: state.assembler.received(),
                total: state.assembler.metadata().total_chunks,
            });
        }

        let state = uploads.remove(transfer_id).expect("entry checked above");
        let payload = state.assembler.assemble()?;
        Ok((state.service, state.backup, payload))
    }

    /// Cache a payload for chunked download.
    pub fn begin_download(&self, payload: Vec<u8>, chunk_size: usize) -> (String, u32) {
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        let chunks = total_chunks(payload.len(), chunk_size);
        let transfer_id = Uuid::new_v4().to_string();
        self.downloads.lock().insert(
            transfer_id.clone(),
            DownloadState {
                payload,
                chunk_size,
                total_chunks: chunks,
                served: HashSet::new(),
                last_activity: Instant::now(),
            },
        );
        (transfer_id, chunks)
    }

    /// Slice one chunk out of a cached download payload.
    ///
    /// The transfer is purged once every index has been served at least
    /// once.
    pub fn download_chunk(&self, transfer_id: &str, index: u32) -> Result<Chunk> {
        let mut downloads = self.downloads.lock();
        let state = downloads.get_mut(transfer_id).ok_or_else(|| BackupError::TransferNotFound {
            transfer_id: transfer_id.to_string(),
        })?;

        if index >= state.total_chunks {
            return Err(BackupError::ChunkOutOfRange {
                index,
                total: state.total_chunks,
            });
        }

        let start = index as usize * state.chunk_size;
        let end = (start + state.chunk_size).min(state.payload.len());
        let chunk = Chunk::new(index, state.payload[start..end].to_vec());

        state.served.insert(index);
        state.last_activity = Instant::now();
        if state.served.len() as u32 == state.total_chunks {
            downloads.remove(transfer_id);
            debug!(transfer_id, "download transfer complete, purged");
        }

        Ok(chunk)
    }

    /// Drop transfers idle longer than the table's TTL.
    pub fn reap_idle(&self) -> usize {
        let ttl = self.ttl;
        let mut reaped = 0;

        self.uploads.lock().retain(|transfer_id, state| {
            let keep = state.last_activity.elapsed() <= ttl;
            if !keep {
                info!(transfer_id, "reaping abandoned upload transfer");
                reaped += 1;
            }
            keep
        });
        self.downloads.lock().retain(|transfer_id, state| {
            let keep = state.last_activity.elapsed() <= ttl;
            if !keep {
                info!(transfer_id, "reaping abandoned download transfer");
                reaped += 1;
            }
            keep
        });

        reaped
    }

    /// Spawn the reaper loop; ticks every `interval` until cancelled.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        table.reap_idle();
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }

    #[cfg(test)]
    fn live_transfers(&self) -> (usize, usize) {
        (self.uploads.lock().len(), self.downloads.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::split_chunks;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 241) as u8).collect()
    }

    #[test]
    fn upload_roundtrip() {
        let table = TransferTable::new(Duration::from_secs(300));
        let data = payload(5000);
        let metadata = ChunkMetadata::for_payload(&data, 1024, "t");
        let ticket = table.begin_upload("svc", "db", metadata);
        assert_eq!(ticket.total_chunks, 5);
        assert_eq!(ticket.total_size, 5000);

        for chunk in split_chunks(&data, 1024) {
            table.add_upload_chunk(&ticket.transfer_id, chunk).unwrap();
        }

        let (service, backup, assembled) = table.complete_upload(&ticket.transfer_id).unwrap();
        assert_eq!(service, "svc");
        assert_eq!(backup, "db");
        assert_eq!(assembled, data);
        assert_eq!(table.live_transfers(), (0, 0));
    }

    #[test]
    fn incomplete_upload_stays_resident() {
        let table = TransferTable::new(Duration::from_secs(300));
        let data = payload(3000);
        let ticket = table.begin_upload("svc", "db", ChunkMetadata::for_payload(&data, 1024, "t"));

        let chunks = split_chunks(&data, 1024);
        table.add_upload_chunk(&ticket.transfer_id, chunks[0].clone()).unwrap();

        let err = table.complete_upload(&ticket.transfer_id).unwrap_err();
        assert!(matches!(err, BackupError::IncompleteTransfer { received: 1, total: 3 }));
        assert_eq!(table.missing_chunks(&ticket.transfer_id).unwrap(), vec![1, 2]);

        // Sending the stragglers finishes the transfer.
        table.add_upload_chunk(&ticket.transfer_id, chunks[1].clone()).unwrap();
        table.add_upload_chunk(&ticket.transfer_id, chunks[2].clone()).unwrap();
        assert!(table.complete_upload(&ticket.transfer_id).is_ok());
    }

    #[test]
    fn unknown_transfer_rejected() {
        let table = TransferTable::new(Duration::from_secs(300));
        let err = table.add_upload_chunk("nope", Chunk::new(0, vec![1])).unwrap_err();
        assert!(matches!(err, BackupError::TransferNotFound { .. }));
        let err = table.download_chunk("nope", 0).unwrap_err();
        assert!(matches!(err, BackupError::TransferNotFound { .. }));
    }

    #[test]
    fn download_serves_slices_and_purges_when_done() {
        let table = TransferTable::new(Duration::from_secs(300));
        let data = payload(2500);
        let (transfer_id, total) = table.begin_download(data.clone(), 1024);
        assert_eq!(total, 3);

        // Out of order on purpose.
        let mut collected = vec![Vec::new(); 3];
        for index in [2u32, 0, 1] {
            let chunk = table.download_chunk(&transfer_id, index).unwrap();
            chunk.verify().unwrap();
            collected[index as usize] = chunk.data;
        }
        assert_eq!(collected.concat(), data);
        assert_eq!(table.live_transfers(), (0, 0));
    }

    #[test]
    fn download_index_out_of_range() {
        let table = TransferTable::new(Duration::from_secs(300));
        let (transfer_id, _) = table.begin_download(payload(100), 64);
        let err = table.download_chunk(&transfer_id, 2).unwrap_err();
        assert!(matches!(err, BackupError::ChunkOutOfRange { index: 2, total: 2 }));
    }

    #[test]
    fn reap_removes_idle_transfers() {
        let table = TransferTable::new(Duration::ZERO);
        table.begin_upload("svc", "db", ChunkMetadata::for_payload(&payload(10), 4, "t"));
        table.begin_download(payload(10), 4);
        assert_eq!(table.live_transfers(), (1, 1));

        assert_eq!(table.reap_idle(), 2);
        assert_eq!(table.live_transfers(), (0, 0));
    }

    #[tokio::test]
    async fn reaper_task_stops_on_cancel() {
        let table = Arc::new(TransferTable::new(Duration::ZERO));
        let token = CancellationToken::new();
        let handle = table.spawn_reaper(Duration::from_millis(10), token.clone());

        table.begin_download(payload(10), 4);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(table.live_transfers(), (0, 0));

        token.cancel();
        handle.await.unwrap();
    }
}
