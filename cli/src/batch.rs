use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::thread;

use signal_hook::consts::SIGINT;
use signal_hook::iterator::Signals;

use fleet::{
    BatchOutcome, ControlCommand, DeviceScanner, Orchestrator, ReflashPlan, RoleSelection,
    UpdateEvent, UpdaterConfig,
};

use crate::CliError;

pub(crate) fn enter_bootloader(
    scanner: Arc<dyn DeviceScanner>,
    serials: Vec<String>,
    roles: RoleSelection,
) -> Result<BatchOutcome, CliError> {
    let serials = resolve_serials(scanner.as_ref(), serials)?;
    let (orchestrator, events) = Orchestrator::new(scanner, UpdaterConfig::default());
    quit_on_interrupt(&orchestrator)?;
    let batch = orchestrator.enter_bootloader(serials, roles);
    drain(&events);
    batch.join().map_err(|_| CliError::BatchPanicked)
}

pub(crate) fn reflash(
    scanner: Arc<dyn DeviceScanner>,
    mut plan: ReflashPlan,
) -> Result<BatchOutcome, CliError> {
    if plan.main_image.is_none() && plan.display_image.is_none() {
        return Err(CliError::NoImages);
    }
    plan.serials = resolve_serials(scanner.as_ref(), plan.serials)?;
    let (orchestrator, events) = Orchestrator::new(scanner, UpdaterConfig::default());
    quit_on_interrupt(&orchestrator)?;
    let batch = orchestrator.reflash(plan);
    drain(&events);
    batch.join().map_err(|_| CliError::BatchPanicked)
}

/// No serials on the command line means every discovered device.
fn resolve_serials(
    scanner: &dyn DeviceScanner,
    provided: Vec<String>,
) -> Result<Vec<String>, CliError> {
    if !provided.is_empty() {
        return Ok(provided);
    }
    let serials: Vec<String> = scanner
        .discover_all()?
        .into_iter()
        .map(|device| device.serial)
        .collect();
    if serials.is_empty() {
        return Err(CliError::NoDevices);
    }
    Ok(serials)
}

/// First Ctrl-C asks the batch to wind down; device tasks abort at their
/// next cancellation check.
fn quit_on_interrupt(orchestrator: &Orchestrator) -> Result<(), CliError> {
    let mut signals = Signals::new([SIGINT])?;
    let control = orchestrator.control();
    thread::spawn(move || {
        if signals.forever().next().is_some() {
            eprintln!("interrupted, cancelling...");
            control.send(ControlCommand::Quit);
        }
    });
    Ok(())
}

/// Print narration until the batch signals completion.
fn drain(events: &Receiver<UpdateEvent>) {
    for event in events.iter() {
        match event {
            UpdateEvent::Device(msg) => {
                if !msg.success {
                    eprintln!("[{}] FAILED: {}", msg.serial, msg.text);
                } else if msg.progress >= 0 {
                    println!("[{}] {:3}% {}", msg.serial, msg.progress, msg.text);
                } else {
                    println!("[{}]      {}", msg.serial, msg.text);
                }
            }
            UpdateEvent::BatchFinished(outcome) => {
                println!(
                    "batch finished: {} succeeded, {} failed{}",
                    outcome.succeeded,
                    outcome.failed,
                    if outcome.cancelled { " (cancelled)" } else { "" }
                );
                break;
            }
        }
    }
}
