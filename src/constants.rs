//! Tuning constants shared across the sync engine.

/// Maximum UIDs per `UID STORE` command.
/// Keeps command lines under server length limits (~8KB).
pub const FLAG_SYNC_BATCH_SIZE: usize = 500;

/// Capacity of the scheduler's trigger queue.
pub const TRIGGER_QUEUE_SIZE: usize = 64;

/// Capacity of the operation event broadcast channel.
/// Slow observers miss events rather than block the worker.
pub const EVENT_CHANNEL_SIZE: usize = 64;

/// How often `cmsync run` checks that the server address is reachable.
pub const CONNECTIVITY_CHECK_SECS: u64 = 30;

/// Timeout of one reachability check.
pub const CONNECTIVITY_CHECK_TIMEOUT_SECS: u64 = 5;
