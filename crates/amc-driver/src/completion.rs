//! One-shot completion signal between the interrupt path and a waiting transfer.

use crate::error::{AmcError, Result};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    done: u32,
    killed: bool,
}

/// Counted completion with forced termination
///
/// `complete()` releases exactly one waiter. A wait blocks until completed or
/// killed; there is no timeout.
#[derive(Debug, Default)]
pub struct Completion {
    state: Mutex<State>,
    cond: Condvar,
}

impl Completion {
    /// Create an un-signalled completion
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal completion, waking one waiter
    pub fn complete(&self) {
        let mut state = self.state();
        state.done = state.done.saturating_add(1);
        self.cond.notify_one();
    }

    /// Discard stale completions before starting a new operation.
    ///
    /// A pending kill survives until a wait consumes it.
    pub fn reinit(&self) {
        self.state().done = 0;
    }

    /// Forcefully terminate the current wait, or the next one if nobody is
    /// waiting yet
    pub fn kill(&self) {
        self.state().killed = true;
        self.cond.notify_all();
    }

    /// Block until completed or killed.
    ///
    /// # Errors
    ///
    /// Returns `TransferKilled` if the wait was terminated by [`Completion::kill`].
    pub fn wait_killable(&self) -> Result<()> {
        let mut state = self.state();
        loop {
            if state.killed {
                state.killed = false;
                return Err(AmcError::TransferKilled);
            }
            if state.done > 0 {
                state.done -= 1;
                return Ok(());
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Whether a completion is pending
    pub fn is_done(&self) -> bool {
        self.state().done > 0
    }
}
