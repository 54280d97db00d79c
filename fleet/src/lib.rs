//! Core orchestration for updating fleets of dual-processor devices.
//!
//! Each device carries a main and a display processor, each of which can be
//! rebooted from its serial CDC interface into a UF2 mass-storage
//! bootloader. This crate drives whole batches of them in lockstep: one
//! cohort per processor role, synchronized at phase barriers so that no
//! device races ahead of a peer, with per-device narration delivered over
//! an event channel.
//!
//! Device discovery and reset live behind the [DeviceScanner] trait; a
//! platform backend supplies the USB and mount-table specifics.

mod barrier;
mod bootloader;
mod config;
mod device;
mod error;
mod flash;
mod orchestrator;
mod progress;

#[cfg(test)]
mod testutil;

pub use barrier::{BarrierError, PhaseBarrier};
pub use bootloader::{BootState, BootloaderController};
pub use config::UpdaterConfig;
pub use device::{Device, DeviceScanner, ExposureKind, ProcessorHandle, ProcessorRole};
pub use error::{Result, ScanError, UpdateError};
pub use flash::{FlashJob, FlashSession};
pub use orchestrator::{Orchestrator, ReflashPlan, RoleSelection};
pub use progress::{
    BatchOutcome, CancelToken, ControlCommand, ControlHandle, INDETERMINATE, ProgressMessage,
    ProgressSender, UpdateEvent,
};
