use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Error surfaced by the discovery collaborator.
///
/// The backend is opaque to the core: transient enumeration hiccups are
/// retried by the polling loops, anything else carries a message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ScanError(pub String);

impl From<io::Error> for ScanError {
    fn from(err: io::Error) -> Self {
        ScanError(err.to_string())
    }
}

/// Terminal outcome of one device task.
///
/// None of these cross the task boundary: each one ends its device task
/// with a `success = false` progress message and the batch carries on
/// joining the remaining tasks.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("device {0} no longer exists")]
    DeviceNotFound(String),
    #[error("failed to enter bootloader on {0}")]
    BootloaderEntryFailed(String),
    #[error("firmware write failed: {0}")]
    WriteFailed(#[source] io::Error),
    // Same operator-facing wording as DeviceNotFound: by this point the
    // device has simply dropped off the bus.
    #[error("device {0} no longer exists")]
    ReenumerationTimeout(String),
    #[error("aborted by peer")]
    PeerAborted,
    #[error("invalid firmware file: {}", .0.display())]
    InvalidFirmwareFile(PathBuf),
    #[error("cancelled")]
    Cancelled,
    #[error("discovery error: {0}")]
    Scan(#[from] ScanError),
}

pub type Result<T, E = UpdateError> = std::result::Result<T, E>;
