//! Exclusive access to the register interface.
//!
//! Any number of openers may hold the register endpoint open. An opener may
//! take the exclusive lock only while it is the sole opener; once locked, the
//! lock is held until released or the holder closes.

use crate::error::{AmcError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Identity of one open of the register endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenerId(u64);

impl std::fmt::Display for OpenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "opener#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct LockState {
    reference_count: usize,
    locked_by: Option<OpenerId>,
}

/// Open count and lock holder, guarded together
#[derive(Debug, Default)]
pub struct RegisterLocking {
    state: Mutex<LockState>,
    next_id: AtomicU64,
}

impl RegisterLocking {
    /// Create with no openers and no holder
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new opener. Opening is never refused.
    pub fn open(&self) -> OpenerId {
        let id = OpenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state();
        state.reference_count += 1;
        tracing::debug!("{id} opened registers, {} open", state.reference_count);
        id
    }

    /// Take the exclusive lock for `id`.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if another opener holds the lock, or if any other
    /// opener has the interface open.
    pub fn acquire_lock(&self, id: OpenerId) -> Result<()> {
        let mut state = self.state();
        if let Some(holder) = state.locked_by {
            if holder != id {
                tracing::warn!("{id} lock refused: held by {holder}");
                return Err(AmcError::busy(format!("locked by {holder}")));
            }
        }
        if state.reference_count > 1 {
            tracing::warn!(
                "{id} lock refused: {} openers",
                state.reference_count
            );
            return Err(AmcError::busy(format!(
                "{} openers share the interface",
                state.reference_count
            )));
        }
        state.locked_by = Some(id);
        Ok(())
    }

    /// Release the lock held by `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotHolder` if `id` does not hold the lock.
    pub fn release_lock(&self, id: OpenerId) -> Result<()> {
        let mut state = self.state();
        if state.locked_by != Some(id) {
            return Err(AmcError::NotHolder);
        }
        state.locked_by = None;
        Ok(())
    }

    /// Unregister `id`, releasing its lock if held
    pub fn close(&self, id: OpenerId) {
        let mut state = self.state();
        if state.locked_by == Some(id) {
            state.locked_by = None;
        }
        state.reference_count = state.reference_count.saturating_sub(1);
        tracing::debug!("{id} closed registers, {} open", state.reference_count);
    }

    /// Number of current openers
    pub fn reference_count(&self) -> usize {
        self.state().reference_count
    }

    /// Current lock holder
    pub fn locked_by(&self) -> Option<OpenerId> {
        self.state().locked_by
    }
}
