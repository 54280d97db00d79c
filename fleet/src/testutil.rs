use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use nonempty::NonEmpty;

use crate::config::UpdaterConfig;
use crate::device::{Device, DeviceScanner, ExposureKind, ProcessorHandle, ProcessorRole};
use crate::error::ScanError;
use crate::progress::{ProgressMessage, UpdateEvent};

/// Scripted in-memory scanner for driving the core through its states.
#[derive(Default)]
pub struct FakeScanner {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    devices: BTreeMap<String, FakeDevice>,
    resets: Vec<(String, ProcessorRole)>,
    fail_resets: bool,
    reset_enters_bootloader: bool,
}

#[derive(Default, Clone)]
struct FakeDevice {
    main: Option<FakeHandle>,
    display: Option<FakeHandle>,
}

#[derive(Clone)]
struct FakeHandle {
    kind: ExposureKind,
    mount: Option<PathBuf>,
}

impl FakeScanner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a device with both processors in the given exposure kind.
    pub fn add_device(&self, serial: &str, kind: ExposureKind) {
        let handle = FakeHandle { kind, mount: None };
        self.inner.lock().unwrap().devices.insert(
            serial.to_string(),
            FakeDevice {
                main: Some(handle.clone()),
                display: Some(handle),
            },
        );
    }

    pub fn set_exposure(&self, serial: &str, role: ProcessorRole, kind: ExposureKind) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(device) = inner.devices.get_mut(serial) {
            if let Some(handle) = device.handle_mut(role) {
                handle.kind = kind;
            }
        }
    }

    pub fn set_mount(&self, serial: &str, role: ProcessorRole, path: PathBuf) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(device) = inner.devices.get_mut(serial) {
            if let Some(handle) = device.handle_mut(role) {
                handle.mount = Some(path);
            }
        }
    }

    /// Flip an exposure kind after a delay, from a helper thread. Used to
    /// simulate a device finalizing its image and re-enumerating.
    pub fn set_exposure_later(
        self: &Arc<Self>,
        delay: Duration,
        serial: &str,
        role: ProcessorRole,
        kind: ExposureKind,
    ) {
        let scanner = Arc::clone(self);
        let serial = serial.to_string();
        thread::spawn(move || {
            thread::sleep(delay);
            scanner.set_exposure(&serial, role, kind);
        });
    }

    pub fn fail_resets(&self, fail: bool) {
        self.inner.lock().unwrap().fail_resets = fail;
    }

    /// When set, a successful reset immediately flips the role into
    /// mass-storage mode.
    pub fn reset_enters_bootloader(&self, enabled: bool) {
        self.inner.lock().unwrap().reset_enters_bootloader = enabled;
    }

    pub fn reset_count(&self, serial: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .resets
            .iter()
            .filter(|(s, _)| s == serial)
            .count()
    }
}

impl FakeDevice {
    fn handle_mut(&mut self, role: ProcessorRole) -> Option<&mut FakeHandle> {
        match role {
            ProcessorRole::Main => self.main.as_mut(),
            ProcessorRole::Display => self.display.as_mut(),
        }
    }
}

impl DeviceScanner for FakeScanner {
    fn discover_all(&self) -> Result<Vec<Device>, ScanError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .devices
            .iter()
            .map(|(serial, device)| Device {
                serial: serial.clone(),
                main: device.main.clone().map(|h| to_handle(ProcessorRole::Main, h)),
                display: device
                    .display
                    .clone()
                    .map(|h| to_handle(ProcessorRole::Display, h)),
            })
            .collect())
    }

    fn reset_to_bootloader(&self, serial: &str, role: ProcessorRole) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().unwrap();
        inner.resets.push((serial.to_string(), role));
        if inner.fail_resets {
            return Err(ScanError("serial port went away".into()));
        }
        if inner.reset_enters_bootloader {
            if let Some(device) = inner.devices.get_mut(serial) {
                if let Some(handle) = device.handle_mut(role) {
                    handle.kind = ExposureKind::MassStorage;
                }
            }
        }
        Ok(())
    }
}

fn to_handle(role: ProcessorRole, fake: FakeHandle) -> ProcessorHandle {
    ProcessorHandle {
        role,
        port: match fake.kind {
            ExposureKind::Serial => Some("/dev/ttyACM0".into()),
            _ => None,
        },
        mounts: fake.mount.map(NonEmpty::new),
        kind: fake.kind,
    }
}

/// Config with all waits shrunk so tests finish quickly.
pub fn fast_config() -> UpdaterConfig {
    UpdaterConfig {
        poll_interval: Duration::from_millis(5),
        discovery_timeout: Duration::from_millis(250),
        mass_storage_timeout: Duration::from_millis(250),
        reset_attempts: 3,
        reset_backoff: Duration::from_millis(5),
        write_attempts: 6,
        write_backoff: Duration::from_millis(1),
        chunk_size: 16,
        settle_delay: Duration::ZERO,
        reenumeration_timeout: Duration::from_secs(2),
        progress_interval: Duration::ZERO,
        entry_barrier_timeout: Duration::from_secs(5),
        write_barrier_timeout: Duration::from_secs(5),
        reenumeration_barrier_timeout: Duration::from_secs(5),
    }
}

/// Drain every per-device message currently in the event channel.
pub fn drain_messages(rx: &mpsc::Receiver<UpdateEvent>) -> Vec<ProgressMessage> {
    rx.try_iter()
        .filter_map(|event| match event {
            UpdateEvent::Device(msg) => Some(msg),
            UpdateEvent::BatchFinished(_) => None,
        })
        .collect()
}
