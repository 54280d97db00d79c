use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;

use log::{error, info, warn};

use crate::barrier::PhaseBarrier;
use crate::bootloader::BootloaderController;
use crate::config::UpdaterConfig;
use crate::device::{DeviceScanner, ProcessorRole};
use crate::error::UpdateError;
use crate::flash::{FlashJob, FlashSession};
use crate::progress::{BatchOutcome, CancelToken, ControlHandle, ProgressSender, UpdateEvent};

/// Which processor roles a batch operation covers.
///
/// The display cohort always runs before the main cohort, and a failed
/// display cohort prevents the main cohort from starting at all: a
/// half-reflashed device pair is a hazard the operator must catch before
/// reconnecting anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSelection {
    pub main: bool,
    pub display: bool,
}

impl Default for RoleSelection {
    fn default() -> Self {
        RoleSelection {
            main: true,
            display: true,
        }
    }
}

impl RoleSelection {
    pub fn only(role: ProcessorRole) -> Self {
        RoleSelection {
            main: role == ProcessorRole::Main,
            display: role == ProcessorRole::Display,
        }
    }

    fn ordered(&self) -> Vec<ProcessorRole> {
        let mut roles = Vec::new();
        if self.display {
            roles.push(ProcessorRole::Display);
        }
        if self.main {
            roles.push(ProcessorRole::Main);
        }
        roles
    }
}

/// Everything one reflash batch needs. Immutable once handed over.
#[derive(Debug, Clone)]
pub struct ReflashPlan {
    pub serials: Vec<String>,
    pub main_image: Option<PathBuf>,
    pub display_image: Option<PathBuf>,
    pub roles: RoleSelection,
}

impl ReflashPlan {
    fn image(&self, role: ProcessorRole) -> Option<&PathBuf> {
        match role {
            ProcessorRole::Main => self.main_image.as_ref(),
            ProcessorRole::Display => self.display_image.as_ref(),
        }
    }
}

/// Owns the threads, barriers and channels of batch operations.
///
/// Batch entry points return immediately; per-device narration arrives on
/// the event channel and every batch terminates with one
/// [UpdateEvent::BatchFinished], whatever the individual outcomes.
pub struct Orchestrator {
    scanner: Arc<dyn DeviceScanner>,
    config: Arc<UpdaterConfig>,
    events: mpsc::Sender<UpdateEvent>,
    cancel: CancelToken,
}

/// Shared handles cloned into every task of one batch.
#[derive(Clone)]
struct BatchContext {
    scanner: Arc<dyn DeviceScanner>,
    config: Arc<UpdaterConfig>,
    events: mpsc::Sender<UpdateEvent>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(
        scanner: Arc<dyn DeviceScanner>,
        config: UpdaterConfig,
    ) -> (Self, mpsc::Receiver<UpdateEvent>) {
        let (tx, rx) = mpsc::channel();
        (
            Orchestrator {
                scanner,
                config: Arc::new(config),
                events: tx,
                cancel: CancelToken::new(),
            },
            rx,
        )
    }

    /// Write side of the control channel. `Quit` is advisory: tasks abort
    /// at their next cancellation check, an in-flight chunk write is not
    /// interrupted mid-syscall.
    pub fn control(&self) -> ControlHandle {
        ControlHandle::new(self.cancel.clone())
    }

    fn context(&self) -> BatchContext {
        BatchContext {
            scanner: Arc::clone(&self.scanner),
            config: Arc::clone(&self.config),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Enter the bootloader on every listed device, one cohort per enabled
    /// role. Returns immediately.
    pub fn enter_bootloader(
        &self,
        serials: Vec<String>,
        roles: RoleSelection,
    ) -> thread::JoinHandle<BatchOutcome> {
        let ctx = self.context();
        thread::spawn(move || {
            let mut outcome = BatchOutcome::default();
            for role in roles.ordered() {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let failed = run_entry_cohort(&ctx, &serials, role);
                outcome.failed += failed;
                outcome.succeeded += serials.len() - failed;
                if failed > 0 {
                    warn!("{role} cohort failed; remaining roles skipped");
                    break;
                }
            }
            finish(ctx, outcome)
        })
    }

    /// Reflash every listed device, display cohort first, fail-fast.
    /// Returns immediately.
    pub fn reflash(&self, plan: ReflashPlan) -> thread::JoinHandle<BatchOutcome> {
        let ctx = self.context();
        thread::spawn(move || {
            let mut outcome = BatchOutcome::default();
            for role in plan.roles.ordered() {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let Some(image) = plan.image(role) else {
                    warn!("no {role} image supplied; {role} cohort skipped");
                    continue;
                };
                let failed = run_flash_cohort(&ctx, &plan.serials, role, image);
                outcome.failed += failed;
                outcome.succeeded += plan.serials.len() - failed;
                if failed > 0 {
                    warn!("{role} cohort failed; remaining roles skipped");
                    break;
                }
            }
            finish(ctx, outcome)
        })
    }
}

fn run_entry_cohort(ctx: &BatchContext, serials: &[String], role: ProcessorRole) -> usize {
    info!("entering {role} bootloader on {} device(s)", serials.len());
    let barrier = Arc::new(PhaseBarrier::new(serials.len()));
    let mut tasks = Vec::with_capacity(serials.len());
    for serial in serials {
        let ctx = ctx.clone();
        let barrier = Arc::clone(&barrier);
        let serial = serial.clone();
        tasks.push(thread::spawn(move || {
            let progress = ProgressSender::new(serial.clone(), ctx.events.clone());
            let mut controller = BootloaderController::new(
                ctx.scanner.as_ref(),
                serial.clone(),
                role,
                &ctx.config,
                progress.clone(),
                ctx.cancel.clone(),
            );
            let result = match controller.run() {
                // Hold the cohort together so nobody's next phase races a
                // peer still mid-reset.
                Ok(()) => barrier
                    .wait(ctx.config.entry_barrier_timeout)
                    .map_err(|_| UpdateError::PeerAborted),
                Err(err) => {
                    // Fail the peers fast instead of letting them hang at
                    // the rendezvous until its timeout.
                    barrier.abort();
                    Err(err)
                }
            };
            report(&progress, &serial, role, result, "bootloader entry complete")
        }));
    }
    join_failures(tasks)
}

fn run_flash_cohort(
    ctx: &BatchContext,
    serials: &[String],
    role: ProcessorRole,
    image: &Path,
) -> usize {
    info!(
        "flashing {role} firmware {} onto {} device(s)",
        image.display(),
        serials.len()
    );
    let barrier = Arc::new(PhaseBarrier::new(serials.len()));
    let mut tasks = Vec::with_capacity(serials.len());
    for (index, serial) in serials.iter().enumerate() {
        let ctx = ctx.clone();
        let barrier = Arc::clone(&barrier);
        let job = FlashJob {
            serial: serial.clone(),
            role,
            source: image.to_path_buf(),
            index,
        };
        tasks.push(thread::spawn(move || {
            let serial = job.serial.clone();
            let progress = ProgressSender::new(serial.clone(), ctx.events.clone());
            let session = FlashSession::new(
                ctx.scanner.as_ref(),
                job,
                &ctx.config,
                progress.clone(),
                ctx.cancel.clone(),
            );
            let result = session.run(&barrier);
            // The session narrates its own success; only failures need a
            // terminal message here.
            match result {
                Ok(()) => true,
                Err(err) => {
                    error!("{serial} {role}: {err}");
                    progress.failure(err.to_string());
                    false
                }
            }
        }));
    }
    join_failures(tasks)
}

fn report(
    progress: &ProgressSender,
    serial: &str,
    role: ProcessorRole,
    result: Result<(), UpdateError>,
    done: &str,
) -> bool {
    match result {
        Ok(()) => {
            progress.complete(format!("{role} {done}"));
            true
        }
        Err(err) => {
            error!("{serial} {role}: {err}");
            progress.failure(err.to_string());
            false
        }
    }
}

/// A panicked child counts as failed; the batch itself never panics.
fn join_failures(tasks: Vec<thread::JoinHandle<bool>>) -> usize {
    tasks
        .into_iter()
        .map(|task| task.join().unwrap_or(false))
        .filter(|ok| !ok)
        .count()
}

fn finish(ctx: BatchContext, mut outcome: BatchOutcome) -> BatchOutcome {
    if ctx.cancel.is_cancelled() {
        outcome.cancelled = true;
    }
    info!(
        "batch finished: {} succeeded, {} failed{}",
        outcome.succeeded,
        outcome.failed,
        if outcome.cancelled { " (cancelled)" } else { "" }
    );
    let _ = ctx.events.send(UpdateEvent::BatchFinished(outcome.clone()));
    outcome
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::device::ExposureKind;
    use crate::progress::ControlCommand;
    use crate::testutil::{FakeScanner, drain_messages, fast_config};

    fn serials(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Flip a role back to serial exposure once its firmware file appears,
    /// like a device rebooting after a completed write.
    fn reboot_when_flashed(scanner: &Arc<FakeScanner>, serial: &str, role: ProcessorRole, mount: PathBuf) {
        let scanner = Arc::clone(scanner);
        let serial = serial.to_string();
        std::thread::spawn(move || {
            let marker = mount.join("firmware.uf2");
            for _ in 0..500 {
                if marker.exists() {
                    scanner.set_exposure(&serial, role, ExposureKind::Serial);
                    return;
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        });
    }

    #[test]
    fn entry_failure_aborts_every_peer_in_the_cohort() {
        let scanner = FakeScanner::new();
        // FW0001 needs a reset that will never succeed; FW0002 is already
        // in the bootloader and would otherwise sail through.
        scanner.add_device("FW0001", ExposureKind::Serial);
        scanner.add_device("FW0002", ExposureKind::MassStorage);
        scanner.fail_resets(true);

        let (orchestrator, rx) =
            Orchestrator::new(scanner.clone(), fast_config());
        let outcome = orchestrator
            .enter_bootloader(serials(&["FW0001", "FW0002"]), RoleSelection::only(ProcessorRole::Display))
            .join()
            .unwrap();

        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.succeeded, 0);

        let messages = drain_messages(&rx);
        let peer_failure = messages
            .iter()
            .find(|m| m.serial == "FW0002" && !m.success)
            .expect("peer must fail");
        assert!(peer_failure.text.contains("aborted by peer"));
        assert!(
            !messages
                .iter()
                .any(|m| m.serial == "FW0002" && m.text.contains("entry complete"))
        );
    }

    #[test]
    fn entry_succeeds_for_a_healthy_cohort_on_both_roles() {
        let scanner = FakeScanner::new();
        scanner.add_device("FW0001", ExposureKind::MassStorage);
        scanner.add_device("FW0002", ExposureKind::MassStorage);

        let (orchestrator, rx) = Orchestrator::new(scanner.clone(), fast_config());
        let outcome = orchestrator
            .enter_bootloader(serials(&["FW0001", "FW0002"]), RoleSelection::default())
            .join()
            .unwrap();

        // Two devices, two role cohorts.
        assert_eq!(outcome.succeeded, 4);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.all_succeeded());

        let events: Vec<UpdateEvent> = rx.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(UpdateEvent::BatchFinished(outcome)) if outcome.all_succeeded()
        ));
    }

    #[test]
    fn display_failure_prevents_the_main_cohort_from_starting() {
        let dir = TempDir::new().unwrap();
        let display_image = dir.path().join("display.uf2");
        fs::write(&display_image, b"").unwrap(); // invalid on purpose
        let main_image = dir.path().join("main.uf2");
        fs::write(&main_image, vec![1u8; 64]).unwrap();

        let scanner = FakeScanner::new();
        let main_mounts: Vec<TempDir> = (0..2).map(|_| TempDir::new().unwrap()).collect();
        for (i, serial) in ["FW0001", "FW0002"].iter().enumerate() {
            scanner.add_device(serial, ExposureKind::MassStorage);
            scanner.set_mount(serial, ProcessorRole::Main, main_mounts[i].path().to_path_buf());
        }

        let (orchestrator, rx) = Orchestrator::new(scanner.clone(), fast_config());
        let outcome = orchestrator
            .reflash(ReflashPlan {
                serials: serials(&["FW0001", "FW0002"]),
                main_image: Some(main_image),
                display_image: Some(display_image),
                roles: RoleSelection::default(),
            })
            .join()
            .unwrap();

        assert_eq!(outcome.failed, 2);
        assert_eq!(outcome.succeeded, 0);

        // Zero main-role tasks were started: nothing was written to the
        // main mounts and no main-role message was ever produced.
        for mount in &main_mounts {
            assert!(!mount.path().join("firmware.uf2").exists());
        }
        assert!(
            !drain_messages(&rx)
                .iter()
                .any(|m| m.text.contains("main"))
        );
    }

    #[test]
    fn reflash_updates_both_roles_in_sequence() {
        let dir = TempDir::new().unwrap();
        let display_image = dir.path().join("display.uf2");
        fs::write(&display_image, vec![0xD1u8; 48]).unwrap();
        let main_image = dir.path().join("main.uf2");
        fs::write(&main_image, vec![0x4Du8; 80]).unwrap();

        let scanner = FakeScanner::new();
        let serial_names = ["FW0001", "FW0002"];
        let mut mounts = Vec::new();
        for serial in serial_names {
            scanner.add_device(serial, ExposureKind::Serial);
            for role in [ProcessorRole::Display, ProcessorRole::Main] {
                let mount = TempDir::new().unwrap();
                scanner.set_mount(serial, role, mount.path().to_path_buf());
                reboot_when_flashed(&scanner, serial, role, mount.path().to_path_buf());
                mounts.push((serial, role, mount));
            }
        }
        scanner.reset_enters_bootloader(true);

        let (orchestrator, _rx) = Orchestrator::new(scanner.clone(), fast_config());
        let outcome = orchestrator
            .reflash(ReflashPlan {
                serials: serials(&serial_names),
                main_image: Some(main_image.clone()),
                display_image: Some(display_image.clone()),
                roles: RoleSelection::default(),
            })
            .join()
            .unwrap();

        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.succeeded, 4);

        for (_, role, mount) in &mounts {
            let expected = match role {
                ProcessorRole::Display => fs::read(&display_image).unwrap(),
                ProcessorRole::Main => fs::read(&main_image).unwrap(),
            };
            assert_eq!(fs::read(mount.path().join("firmware.uf2")).unwrap(), expected);
        }
    }

    #[test]
    fn quit_cancels_a_batch_before_it_gets_going() {
        let scanner = FakeScanner::new();
        scanner.add_device("FW0001", ExposureKind::Serial);

        let (orchestrator, rx) = Orchestrator::new(scanner.clone(), fast_config());
        orchestrator.control().send(ControlCommand::Quit);
        let outcome = orchestrator
            .enter_bootloader(serials(&["FW0001"]), RoleSelection::default())
            .join()
            .unwrap();

        assert!(outcome.cancelled);
        assert!(!outcome.all_succeeded());
        let events: Vec<UpdateEvent> = rx.try_iter().collect();
        assert!(matches!(
            events.last(),
            Some(UpdateEvent::BatchFinished(outcome)) if outcome.cancelled
        ));
    }
}
