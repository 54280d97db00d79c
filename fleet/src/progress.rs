use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

/// Progress value for phases with unknown duration (waiting, finalizing).
pub const INDETERMINATE: i16 = -1;

/// One line of human-readable narration from a device task.
///
/// Ordering across devices is interleaved and unordered; ordering within
/// one device's messages is FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressMessage {
    pub serial: String,
    pub text: String,
    /// 0..=100, or [INDETERMINATE].
    pub progress: i16,
    pub success: bool,
}

/// Summary of one finished batch operation, counted in device tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Everything the presentation layer ever receives from the core.
///
/// `BatchFinished` is always the last event of a batch, after every device
/// task has been joined.
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    Device(ProgressMessage),
    BatchFinished(BatchOutcome),
}

/// Per-device producer handle for the event channel.
///
/// Send failures are ignored: a consumer that has gone away must not take
/// a flashing thread down with it.
#[derive(Clone)]
pub struct ProgressSender {
    serial: String,
    tx: mpsc::Sender<UpdateEvent>,
}

impl ProgressSender {
    pub(crate) fn new(serial: String, tx: mpsc::Sender<UpdateEvent>) -> Self {
        ProgressSender { serial, tx }
    }

    fn send(&self, text: String, progress: i16, success: bool) {
        let _ = self.tx.send(UpdateEvent::Device(ProgressMessage {
            serial: self.serial.clone(),
            text,
            progress,
            success,
        }));
    }

    /// Narration for a phase with unknown duration.
    pub fn detail(&self, text: impl Into<String>) {
        self.send(text.into(), INDETERMINATE, true);
    }

    pub fn percent(&self, progress: i16, text: impl Into<String>) {
        self.send(text.into(), progress.clamp(0, 100), true);
    }

    /// Terminal success message, always at 100.
    pub fn complete(&self, text: impl Into<String>) {
        self.send(text.into(), 100, true);
    }

    /// Terminal failure message.
    pub fn failure(&self, text: impl Into<String>) {
        self.send(text.into(), INDETERMINATE, false);
    }
}

/// Commands flowing back into the core. Broadcast intent: any device task
/// observing `Quit` mid-loop aborts promptly, best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Quit,
}

/// Shared cancellation flag observed by every wait loop in the core.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep in small slices so a quit request is noticed promptly.
    /// Returns `false` if cancelled before the full duration elapsed.
    pub fn sleep_for(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero()) else {
                return true;
            };
            thread::sleep(remaining.min(Duration::from_millis(100)));
        }
    }
}

/// Write side of the control channel, handed to the presentation layer.
#[derive(Clone)]
pub struct ControlHandle {
    cancel: CancelToken,
}

impl ControlHandle {
    pub(crate) fn new(cancel: CancelToken) -> Self {
        ControlHandle { cancel }
    }

    pub fn send(&self, command: ControlCommand) {
        match command {
            ControlCommand::Quit => self.cancel.cancel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_sets_the_shared_token() {
        let token = CancelToken::new();
        let handle = ControlHandle::new(token.clone());
        assert!(!token.is_cancelled());
        handle.send(ControlCommand::Quit);
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let start = Instant::now();
        assert!(!token.sleep_for(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sender_preserves_fifo_order_per_device() {
        let (tx, rx) = mpsc::channel();
        let sender = ProgressSender::new("FW0001".into(), tx);
        sender.detail("first");
        sender.percent(50, "second");
        sender.complete("third");

        let texts: Vec<String> = rx
            .try_iter()
            .map(|event| match event {
                UpdateEvent::Device(msg) => msg.text,
                UpdateEvent::BatchFinished(_) => unreachable!(),
            })
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }
}
