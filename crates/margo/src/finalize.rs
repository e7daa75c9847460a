use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// The two-phase finalize state machine.
///
/// Phase 1 (`request_finalize`) only flips `finalize_requested` when
/// handlers are still in flight; the last handler to exit drives phase
/// 2 itself. Phase 2 (`drain`) is run at most once, guarded by
/// `finalized`.
pub struct FinalizeState {
    finalize_requested: AtomicBool,
    progress_drained: AtomicBool,
    finalized: AtomicBool,
    pending_operations: AtomicUsize,
    waiters: AtomicUsize,
    cvar: Condvar,
    cvar_mutex: Mutex<()>,
}

impl FinalizeState {
    pub fn new() -> Self {
        Self {
            finalize_requested: AtomicBool::new(false),
            progress_drained: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            pending_operations: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            cvar: Condvar::new(),
            cvar_mutex: Mutex::new(()),
        }
    }

    pub fn incr_pending(&self) {
        self.pending_operations.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns `true` if this was the last pending operation *and* a
    /// finalize had already been requested — the caller (the exiting
    /// handler ULT) is then responsible for driving phase 2.
    pub fn decr_pending_triggers_finalize(&self) -> bool {
        let remaining = self.pending_operations.fetch_sub(1, Ordering::SeqCst) - 1;
        remaining == 0 && self.finalize_requested.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending_operations.load(Ordering::SeqCst)
    }

    /// Phase 1. Returns `true` if the caller must immediately run phase
    /// 2 itself (no operations were in flight).
    pub fn request_finalize(&self) -> bool {
        if self.finalize_requested.swap(true, Ordering::SeqCst) {
            return false; // already requested by someone else
        }
        debug!("finalize requested");
        self.pending_operations.load(Ordering::SeqCst) == 0
    }

    pub fn mark_progress_drained(&self) {
        self.progress_drained.store(true, Ordering::SeqCst);
        let _g = self.cvar_mutex.lock();
        self.cvar.notify_all();
    }

    pub fn wait_progress_drained(&self) {
        let mut guard = self.cvar_mutex.lock();
        while !self.progress_drained.load(Ordering::SeqCst) {
            self.cvar.wait(&mut guard);
        }
    }

    /// `wait_for_finalize`: block until `finalized`, then report whether
    /// this caller was the last waiter to leave (responsible for cleanup).
    pub fn wait_for_finalize(&self) -> bool {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.cvar_mutex.lock();
        while !self.finalized.load(Ordering::SeqCst) {
            self.cvar.wait(&mut guard);
        }
        drop(guard);
        self.waiters.fetch_sub(1, Ordering::SeqCst) == 1
    }

    /// Flip `finalized` and wake every `wait_for_finalize` caller.
    /// Returns `true` if no one was waiting at the time (so the caller
    /// driving phase 2 must run cleanup itself).
    pub fn mark_finalized(&self) -> bool {
        let _g = self.cvar_mutex.lock();
        self.finalized.store(true, Ordering::SeqCst);
        self.cvar.notify_all();
        self.waiters.load(Ordering::SeqCst) == 0
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn is_finalize_requested(&self) -> bool {
        self.finalize_requested.load(Ordering::SeqCst)
    }
}

impl Default for FinalizeState {
    fn default() -> Self {
        Self::new()
    }
}
