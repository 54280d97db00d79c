use std::fmt;
use std::path::PathBuf;

use nonempty::NonEmpty;

use crate::error::ScanError;

/// One of the two independently flashable processors on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorRole {
    Main,
    Display,
}

impl ProcessorRole {
    pub fn name(&self) -> &'static str {
        match self {
            ProcessorRole::Main => "main",
            ProcessorRole::Display => "display",
        }
    }
}

impl fmt::Display for ProcessorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a processor is currently visible on the USB bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureKind {
    Serial,
    MassStorage,
    Unknown,
}

/// Point-in-time view of one processor of a device.
///
/// `mounts` is populated only in mass-storage mode; the bootloader may
/// surface more than one mount point for the same volume, so it is kept
/// as a non-empty list with the first entry being the preferred one.
#[derive(Debug, Clone)]
pub struct ProcessorHandle {
    pub role: ProcessorRole,
    pub kind: ExposureKind,
    pub port: Option<String>,
    pub mounts: Option<NonEmpty<PathBuf>>,
}

/// Point-in-time snapshot of one device.
///
/// Snapshots go stale the moment a processor changes exposure, so nothing
/// in the core holds on to one: every decision point re-discovers and
/// re-matches by serial.
#[derive(Debug, Clone)]
pub struct Device {
    pub serial: String,
    pub main: Option<ProcessorHandle>,
    pub display: Option<ProcessorHandle>,
}

impl Device {
    pub fn handle(&self, role: ProcessorRole) -> Option<&ProcessorHandle> {
        match role {
            ProcessorRole::Main => self.main.as_ref(),
            ProcessorRole::Display => self.display.as_ref(),
        }
    }

    pub fn exposure(&self, role: ProcessorRole) -> Option<ExposureKind> {
        self.handle(role).map(|handle| handle.kind)
    }

    /// Preferred mount path for a role, if it is in mass-storage mode.
    pub fn mount(&self, role: ProcessorRole) -> Option<&PathBuf> {
        self.handle(role)
            .and_then(|handle| handle.mounts.as_ref())
            .map(|mounts| mounts.first())
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serial)
    }
}

/// The narrow interface to the device-discovery/control collaborator.
///
/// `discover_all` may fail transiently (a device mid-re-enumeration can
/// make the whole enumeration hiccup); callers retry inside their own
/// deadline instead of treating it as fatal.
pub trait DeviceScanner: Send + Sync {
    /// Point-in-time enumeration of all connected devices.
    fn discover_all(&self) -> Result<Vec<Device>, ScanError>;

    /// Command one processor out of its application firmware and into the
    /// mass-storage bootloader.
    fn reset_to_bootloader(&self, serial: &str, role: ProcessorRole) -> Result<(), ScanError>;
}
