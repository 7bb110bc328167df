//! Fixed limits and cadences shared across the mesh.
//!
//! Constants are part of the wire contract: a service built against one
//! release must stay legible to a manager built against another, so the
//! cadences and exit codes here change only with a protocol revision.

use std::time::Duration;

// ============================================================================
// Liveness cadences
// ============================================================================

/// Interval between heartbeat beacons emitted by every service instance.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Interval at which the manager sweeps the last-seen map for timeouts.
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// A service with no heartbeat for this long is marked offline.
///
/// Three missed beacons at the default [`HEARTBEAT_INTERVAL`].
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(90);

// ============================================================================
// RPC
// ============================================================================

/// Default caller-side timeout for a plain RPC call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Backup engine
// ============================================================================

/// Block size for the binary diff algorithm (4 KiB).
pub const DIFF_BLOCK_SIZE: usize = 4096;

/// Default chunk size for chunked transfers (1 MiB).
///
/// Sized to stay under typical per-message limits on the bus.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunked transfers idle longer than this are reaped from memory.
pub const DEFAULT_TRANSFER_TTL: Duration = Duration::from_secs(300);

// ============================================================================
// Control channel
// ============================================================================

/// Exit code for a normal stop requested over the control channel.
pub const EXIT_CODE_STOP: i32 = 0;

/// Exit code signalling the supervisor to relaunch the process.
///
/// The restart contract lives entirely in the supervisor: the instance
/// exits with this code and performs no in-process teardown beyond
/// unsubscribing.
pub const EXIT_CODE_RESTART: i32 = 99;

// ============================================================================
// Bus
// ============================================================================

/// Initial delay between reconnect attempts; retries are unbounded.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the manager's service event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 100;
