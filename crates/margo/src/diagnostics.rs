use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free, read-only counters exposed by `Instance::diagnostics()`.
/// Never gates correctness; logged at `debug` on finalize.
#[derive(Default)]
pub struct DiagnosticsCounters {
    pub num_progress_calls: AtomicU64,
    pub num_trigger_calls: AtomicU64,
    pub timers_armed: AtomicU64,
    pub timers_fired: AtomicU64,
}

impl DiagnosticsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_progress(&self) {
        self.num_progress_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trigger(&self) {
        self.num_trigger_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_armed(&self) {
        self.timers_armed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timer_fired(&self, n: u64) {
        self.timers_fired.fetch_add(n, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot, returned by value (spec's diagnostics are
/// read-only and never block the progress loop).
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    pub num_progress_calls: u64,
    pub num_trigger_calls: u64,
    pub timers_armed: u64,
    pub timers_fired: u64,
    pub handle_cache_hits: u64,
    pub handle_cache_misses: u64,
    pub handle_cache_in_use: usize,
    pub pending_operations: usize,
}
