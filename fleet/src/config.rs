use std::time::Duration;

#[cfg(target_os = "macos")]
const DEFAULT_CHUNK_SIZE: usize = 4096 * 16;
#[cfg(not(target_os = "macos"))]
const DEFAULT_CHUNK_SIZE: usize = 4096 * 32;

/// Tunables for a batch operation.
///
/// The defaults are the values the devices have been qualified against;
/// tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Interval between discovery snapshots in every wait loop.
    pub poll_interval: Duration,
    /// How long a device may stay invisible before it is given up on.
    pub discovery_timeout: Duration,
    /// How long the bootloader volume may take to appear after a reset.
    pub mass_storage_timeout: Duration,
    pub reset_attempts: u32,
    pub reset_backoff: Duration,
    pub write_attempts: u32,
    pub write_backoff: Duration,
    /// Bytes written between durability syncs. The bootloader's USB
    /// mass-storage controller silently corrupts writes that are not
    /// flushed and synced per chunk.
    pub chunk_size: usize,
    /// Pause after the cohort has entered the bootloader, before anyone
    /// starts writing. Freshly mounted volumes reject writes for a moment.
    pub settle_delay: Duration,
    /// How long a processor may take to finalize the image and come back
    /// in serial mode. Display firmware is observed to take minutes.
    pub reenumeration_timeout: Duration,
    /// Minimum interval between byte-count progress messages.
    pub progress_interval: Duration,
    pub entry_barrier_timeout: Duration,
    pub write_barrier_timeout: Duration,
    pub reenumeration_barrier_timeout: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            poll_interval: Duration::from_millis(100),
            discovery_timeout: Duration::from_secs(30),
            mass_storage_timeout: Duration::from_secs(30),
            reset_attempts: 3,
            reset_backoff: Duration::from_secs(6),
            write_attempts: 6,
            write_backoff: Duration::from_millis(500),
            chunk_size: DEFAULT_CHUNK_SIZE,
            settle_delay: Duration::from_secs(6),
            reenumeration_timeout: Duration::from_secs(400),
            progress_interval: Duration::from_secs(1),
            entry_barrier_timeout: Duration::from_secs(120),
            write_barrier_timeout: Duration::from_secs(400),
            reenumeration_barrier_timeout: Duration::from_secs(420),
        }
    }
}
