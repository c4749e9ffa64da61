use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::error::UpdateError;

/// A cheap, shareable cancellation signal with parent/child derivation.
///
/// The crate has no async runtime (the teacher's HTTP client, `minreq`, is
/// blocking), so cancellable sleeps are built on a `Condvar` shared by an
/// entire parent/child family: `cancel()` on any member notifies every
/// sleeper in the family, while `is_cancelled()` only reflects that
/// member's own flag plus its ancestors' — cancelling a child never flips
/// the parent's flag, and siblings don't observe each other's cancellation.
#[derive(Clone)]
pub struct Cancellation {
    own_flag: Arc<AtomicBool>,
    ancestor_flags: Arc<Vec<Arc<AtomicBool>>>,
    signal: Arc<(Mutex<()>, Condvar)>,
}

impl Cancellation {
    #[must_use]
    pub fn new() -> Self {
        Self {
            own_flag: Arc::new(AtomicBool::new(false)),
            ancestor_flags: Arc::new(Vec::new()),
            signal: Arc::new((Mutex::new(()), Condvar::new())),
        }
    }

    /// Derives a child token that observes this token's cancellation (and
    /// that of any of its own ancestors) in addition to its own. Cancelling
    /// the child never cancels the parent. The child shares the family's
    /// wake signal, so a parent-level `cancel()` wakes a child mid-`sleep`
    /// immediately rather than after the child's own timeout elapses.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut ancestors = (*self.ancestor_flags).clone();
        ancestors.push(Arc::clone(&self.own_flag));
        Self {
            own_flag: Arc::new(AtomicBool::new(false)),
            ancestor_flags: Arc::new(ancestors),
            signal: Arc::clone(&self.signal),
        }
    }

    /// A token with no ancestors that never observes anyone else's
    /// cancellation. Used for operations that must run to completion
    /// regardless of the caller's cancellation state (rollback, and the
    /// background start/stop after install per the orchestrator's
    /// load-bearing "never return without starting the service" rule).
    #[must_use]
    pub fn background() -> Self {
        Self::new()
    }

    /// Cancels this token. Visible via `is_cancelled()`/`check()` on this
    /// token and any of its descendants; ancestors are unaffected.
    pub fn cancel(&self) {
        self.own_flag.store(true, Ordering::SeqCst);
        let (lock, condvar) = &*self.signal;
        let _guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        condvar.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.own_flag.load(Ordering::SeqCst) || self.ancestor_flags.iter().any(|f| f.load(Ordering::SeqCst))
    }

    /// Returns `Err(UpdateError::Cancelled)` iff cancellation has fired.
    pub fn check(&self) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps up to `dur`, waking early if cancellation fires anywhere in
    /// this token's family (itself or an ancestor). Returns
    /// `Err(Cancelled)` if it woke early due to cancellation, `Ok(())` if
    /// the full duration elapsed.
    pub fn sleep(&self, dur: Duration) -> Result<(), UpdateError> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        let (lock, condvar) = &*self.signal;
        let guard = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let (_guard, _timeout_result) = condvar
            .wait_timeout(guard, dur)
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if self.is_cancelled() {
            Err(UpdateError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}
