use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use log::{debug, info, warn};

use crate::barrier::PhaseBarrier;
use crate::bootloader::BootloaderController;
use crate::config::UpdaterConfig;
use crate::device::{DeviceScanner, ExposureKind, ProcessorRole};
use crate::error::{Result, UpdateError};
use crate::progress::{CancelToken, ProgressSender};

/// Name under which the bootloader expects the image on its volume.
const FIRMWARE_FILE_NAME: &str = "firmware.uf2";

/// One firmware image destined for one processor of one device.
#[derive(Debug, Clone)]
pub struct FlashJob {
    pub serial: String,
    pub role: ProcessorRole,
    pub source: PathBuf,
    /// Ordinal within the cohort, for log correlation.
    pub index: usize,
}

/// Destination of the chunked copy.
///
/// The `sync` hook exists because the devices' USB mass-storage
/// controllers silently corrupt writes that are not flushed and synced
/// per chunk; tests substitute an in-memory sink with injected faults.
pub(crate) trait FirmwareSink: Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
}

impl FirmwareSink for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Copies one firmware image onto one device-role's bootloader volume,
/// keeping in step with its cohort at the [PhaseBarrier] checkpoints.
pub struct FlashSession<'a> {
    scanner: &'a dyn DeviceScanner,
    job: FlashJob,
    config: &'a UpdaterConfig,
    progress: ProgressSender,
    cancel: CancelToken,
}

impl<'a> FlashSession<'a> {
    pub fn new(
        scanner: &'a dyn DeviceScanner,
        job: FlashJob,
        config: &'a UpdaterConfig,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Self {
        FlashSession {
            scanner,
            job,
            config,
            progress,
            cancel,
        }
    }

    /// Run the full flash sequence: bootloader entry, synchronized write,
    /// synchronized finalization, re-enumeration.
    ///
    /// Checkpoints, in order: before the first byte is written (no device
    /// starts cold after another has primed the bus), after the last byte
    /// (the firmware's finalization timers are sensitive to bus activity
    /// from siblings still writing), and after re-enumeration.
    pub fn run(&self, barrier: &PhaseBarrier) -> Result<()> {
        let total = self.validate_source()?;
        debug!(
            "job {}: {} {} <- {} ({total} bytes)",
            self.job.index,
            self.job.serial,
            self.job.role,
            self.job.source.display()
        );

        let mut controller = BootloaderController::new(
            self.scanner,
            self.job.serial.clone(),
            self.job.role,
            self.config,
            self.progress.clone(),
            self.cancel.clone(),
        );
        if let Err(err) = controller.run() {
            // A device that cannot enter the bootloader would strand the
            // whole cohort at the pre-write checkpoint; fail the peers fast.
            barrier.abort();
            return Err(err);
        }

        // Freshly mounted volumes reject writes for a moment.
        if !self.cancel.sleep_for(self.config.settle_delay) {
            return Err(UpdateError::Cancelled);
        }

        self.checkpoint(barrier, self.config.entry_barrier_timeout)?;

        let mount = self.resolve_mount()?;
        self.copy_image(&mount, total)?;

        self.checkpoint(barrier, self.config.write_barrier_timeout)?;

        self.progress
            .detail("waiting for device to finalize and reboot");
        self.wait_for_serial()?;

        self.checkpoint(barrier, self.config.reenumeration_barrier_timeout)?;

        info!("{} {}: firmware updated", self.job.serial, self.job.role);
        self.progress
            .complete(format!("{} firmware updated", self.job.role));
        Ok(())
    }

    fn checkpoint(&self, barrier: &PhaseBarrier, timeout: std::time::Duration) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        barrier.wait(timeout).map_err(|_| UpdateError::PeerAborted)
    }

    fn validate_source(&self) -> Result<u64> {
        let len = fs::metadata(&self.job.source).map(|m| m.len()).unwrap_or(0);
        if len == 0 {
            return Err(UpdateError::InvalidFirmwareFile(self.job.source.clone()));
        }
        Ok(len)
    }

    /// Re-resolve the live mount path. The handle captured during
    /// bootloader entry may be stale: mounting can lag the mode change.
    fn resolve_mount(&self) -> Result<PathBuf> {
        let start = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            match self.scanner.discover_all() {
                Ok(devices) => {
                    if let Some(mount) = devices
                        .iter()
                        .find(|d| d.serial == self.job.serial)
                        .and_then(|d| d.mount(self.job.role))
                    {
                        return Ok(mount.clone());
                    }
                }
                Err(err) => debug!("discovery failed resolving mount: {err}"),
            }
            if start.elapsed() >= self.config.mass_storage_timeout {
                return Err(UpdateError::DeviceNotFound(self.job.serial.clone()));
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn copy_image(&self, mount: &Path, total: u64) -> Result<()> {
        let dest_path = mount.join(FIRMWARE_FILE_NAME);
        let mut source = File::open(&self.job.source)
            .map_err(|_| UpdateError::InvalidFirmwareFile(self.job.source.clone()))?;
        let mut dest = File::create(&dest_path).map_err(UpdateError::WriteFailed)?;
        self.copy_stream(&mut source, &mut dest, total)
    }

    fn copy_stream<S: FirmwareSink>(
        &self,
        source: &mut impl Read,
        dest: &mut S,
        total: u64,
    ) -> Result<()> {
        let mut buf = vec![0u8; self.config.chunk_size];
        let mut written: u64 = 0;
        let mut last_report = Instant::now();
        let mut last_reported = 0u64;
        self.progress
            .percent(0, format!("writing {} firmware", self.job.role));
        loop {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            let n = source.read(&mut buf).map_err(UpdateError::WriteFailed)?;
            if n == 0 {
                break;
            }
            self.write_chunk(dest, &buf[..n], written)?;
            written += n as u64;
            if (last_report.elapsed() >= self.config.progress_interval || written == total)
                && written != last_reported
            {
                let pct = ((written * 100) / total).min(100) as i16;
                self.progress.percent(
                    pct,
                    format!("writing {} firmware ({written}/{total} bytes)", self.job.role),
                );
                last_report = Instant::now();
                last_reported = written;
            }
        }
        self.progress.detail("finalizing write");
        Ok(())
    }

    /// Write one chunk durably, retrying transient failures. Every attempt
    /// rewinds to the chunk's offset so a short write cannot shear the
    /// image.
    fn write_chunk<S: FirmwareSink>(&self, dest: &mut S, chunk: &[u8], offset: u64) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.config.write_attempts {
            let result = dest
                .seek(SeekFrom::Start(offset))
                .and_then(|_| dest.write_all(chunk))
                .and_then(|()| dest.flush())
                .and_then(|()| dest.sync());
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(
                        "{} {}: chunk write attempt {attempt}/{} at offset {offset} failed: {err}",
                        self.job.serial, self.job.role, self.config.write_attempts
                    );
                    last_err = Some(err);
                    if attempt < self.config.write_attempts
                        && !self.cancel.sleep_for(self.config.write_backoff)
                    {
                        return Err(UpdateError::Cancelled);
                    }
                }
            }
        }
        Err(UpdateError::WriteFailed(last_err.unwrap_or_else(|| {
            io::Error::other("write retries exhausted")
        })))
    }

    /// Wait for the processor to leave the bootloader and come back in
    /// serial mode. Display firmware is observed to take minutes here.
    fn wait_for_serial(&self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }
            match self.scanner.discover_all() {
                Ok(devices) => {
                    if devices.iter().any(|d| {
                        d.serial == self.job.serial
                            && d.exposure(self.job.role) == Some(ExposureKind::Serial)
                    }) {
                        return Ok(());
                    }
                }
                Err(err) => debug!("discovery failed during re-enumeration wait: {err}"),
            }
            if start.elapsed() >= self.config.reenumeration_timeout {
                return Err(UpdateError::ReenumerationTimeout(self.job.serial.clone()));
            }
            thread::sleep(self.config.poll_interval);
        }
    }
}
