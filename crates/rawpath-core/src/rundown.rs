//! Rundown protection for objects shared with the receive path.
//!
//! Readers [`acquire`](Rundown::acquire) a reference before touching the
//! object and release it afterwards. Teardown flips the rundown into the
//! draining state, after which new acquisitions fail, and then waits for the
//! outstanding references to drop to zero.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    refs: usize,
    draining: bool,
}

/// Reference counter that can be drained.
#[derive(Debug, Default)]
pub struct Rundown {
    state: Mutex<State>,
    drained: Condvar,
}

impl Rundown {
    /// New rundown with no references.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference. Fails once draining has started.
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.draining {
            return false;
        }
        state.refs += 1;
        true
    }

    /// Drop a reference taken with [`Self::acquire`].
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        debug_assert!(state.refs > 0, "rundown released more often than acquired");
        state.refs = state.refs.saturating_sub(1);
        if state.refs == 0 && state.draining {
            self.drained.notify_all();
        }
    }

    /// Outstanding references.
    pub fn references(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .refs
    }

    /// Whether draining has started.
    pub fn is_draining(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .draining
    }

    /// Start draining and wait up to `timeout` for all references to go.
    ///
    /// Returns `true` if the rundown fully drained.
    pub fn release_and_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.draining = true;
        while state.refs > 0 {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(refs = state.refs, "rundown wait timed out");
                return false;
            }
            let (next, _) = self
                .drained
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = next;
        }
        true
    }
}
