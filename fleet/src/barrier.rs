use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error("cohort aborted by peer")]
    Aborted,
    #[error("timed out waiting for cohort")]
    TimedOut,
}

/// Rendezvous point for a cohort of device tasks.
///
/// All parties calling [PhaseBarrier::wait] are released together once the
/// last one arrives. If any party aborts the barrier (or times out, which
/// counts as an abort), every waiting and future-waiting party fails with
/// [BarrierError::Aborted]: a half-flashed cohort is worse than a fully
/// aborted batch.
///
/// Generations make the same instance reusable for consecutive rendezvous
/// within one phase; an aborted barrier stays aborted, a fresh instance is
/// constructed for the next phase.
pub struct PhaseBarrier {
    parties: usize,
    state: Mutex<State>,
    cvar: Condvar,
}

#[derive(Debug)]
struct State {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

impl PhaseBarrier {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        PhaseBarrier {
            parties,
            state: Mutex::new(State {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Block until the whole cohort has arrived, the barrier is aborted,
    /// or `timeout` elapses (which aborts the barrier for everyone).
    pub fn wait(&self, timeout: Duration) -> Result<(), BarrierError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if state.aborted {
            return Err(BarrierError::Aborted);
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        loop {
            let timed_out = self.cvar.wait_until(&mut state, deadline).timed_out();
            if state.aborted {
                return Err(BarrierError::Aborted);
            }
            if state.generation != generation {
                return Ok(());
            }
            if timed_out {
                state.aborted = true;
                self.cvar.notify_all();
                return Err(BarrierError::TimedOut);
            }
        }
    }

    /// Break the cohort. Idempotent; wakes all waiters.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cvar.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}
