use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::UpdaterConfig;
use crate::device::{Device, DeviceScanner, ExposureKind, ProcessorRole};
use crate::error::{Result, UpdateError};
use crate::progress::{CancelToken, ProgressSender};

/// Where the bootloader-entry state machine currently is.
///
/// `Failed` is reachable from every other state; the terminal state stays
/// observable after [BootloaderController::run] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    WaitingForDevice,
    Resetting,
    WaitingForMassStorage,
    Ready,
    Failed,
}

/// Drives one processor of one device from serial (or unknown) mode into
/// the confirmed mass-storage bootloader.
pub struct BootloaderController<'a> {
    scanner: &'a dyn DeviceScanner,
    serial: String,
    role: ProcessorRole,
    config: &'a UpdaterConfig,
    progress: ProgressSender,
    cancel: CancelToken,
    state: BootState,
}

impl<'a> BootloaderController<'a> {
    pub fn new(
        scanner: &'a dyn DeviceScanner,
        serial: impl Into<String>,
        role: ProcessorRole,
        config: &'a UpdaterConfig,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Self {
        BootloaderController {
            scanner,
            serial: serial.into(),
            role,
            config,
            progress,
            cancel,
            state: BootState::WaitingForDevice,
        }
    }

    pub fn state(&self) -> BootState {
        self.state
    }

    /// Push the device-role into the bootloader, or fail cleanly.
    pub fn run(&mut self) -> Result<()> {
        match self.try_run() {
            Ok(()) => {
                self.state = BootState::Ready;
                self.progress.detail(format!("{} bootloader ready", self.role));
                Ok(())
            }
            Err(err) => {
                self.state = BootState::Failed;
                Err(err)
            }
        }
    }

    fn try_run(&mut self) -> Result<()> {
        self.state = BootState::WaitingForDevice;
        self.progress
            .detail(format!("waiting for {} processor", self.role));
        let device = self.wait_for_exposure(None, self.config.discovery_timeout)?;

        // Re-entry is idempotent: a processor already in the bootloader
        // must not be reset again.
        if device.exposure(self.role) == Some(ExposureKind::MassStorage) {
            debug!("{} {} already in bootloader mode", self.serial, self.role);
            return Ok(());
        }

        self.state = BootState::Resetting;
        self.reset_with_retries()?;

        self.state = BootState::WaitingForMassStorage;
        self.progress.detail("waiting for bootloader volume");
        self.wait_for_exposure(
            Some(ExposureKind::MassStorage),
            self.config.mass_storage_timeout,
        )
        .map_err(|err| match err {
            UpdateError::DeviceNotFound(serial) => UpdateError::ReenumerationTimeout(serial),
            other => other,
        })?;
        Ok(())
    }

    /// Poll discovery until the target role is seen (in `want`, or in any
    /// exposure kind when `want` is `None`), the deadline passes, or a quit
    /// request arrives.
    fn wait_for_exposure(
        &self,
        want: Option<ExposureKind>,
        timeout: Duration,
    ) -> Result<Device> {
        let start = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            match self.scanner.discover_all() {
                Ok(devices) => {
                    if let Some(device) = devices.into_iter().find(|d| d.serial == self.serial) {
                        let matched = match want {
                            None => device.handle(self.role).is_some(),
                            Some(kind) => device.exposure(self.role) == Some(kind),
                        };
                        if matched {
                            return Ok(device);
                        }
                    }
                }
                // Transient: a sibling mid-re-enumeration can make the
                // whole snapshot fail. Keep polling until the deadline.
                Err(err) => debug!("discovery failed while waiting for {}: {err}", self.serial),
            }
            if start.elapsed() >= timeout {
                return Err(UpdateError::DeviceNotFound(self.serial.clone()));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn reset_with_retries(&self) -> Result<()> {
        self.progress
            .detail(format!("resetting {} into bootloader", self.role));
        for attempt in 1..=self.config.reset_attempts {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            match self.scanner.reset_to_bootloader(&self.serial, self.role) {
                Ok(()) => {
                    info!("{} {}: reset command issued", self.serial, self.role);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        "{} {}: reset attempt {attempt}/{} failed: {err}",
                        self.serial, self.role, self.config.reset_attempts
                    );
                    if attempt < self.config.reset_attempts
                        && !self.cancel.sleep_for(self.config.reset_backoff)
                    {
                        return Err(UpdateError::Cancelled);
                    }
                }
            }
        }
        Err(UpdateError::BootloaderEntryFailed(self.serial.clone()))
    }
}
