use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info_span};

use crate::abt::Pool;
use crate::instance::Instance;
use crate::monitor::MonitorEvent;

/// Progress-ULT shutdown flag and spin-window bookkeeping. Lives on
/// `Instance`; only the progress ULT itself ever reads the spin
/// window, so it needs no lock beyond what `Instant`'s `Copy` already
/// gives a plain `Mutex<Option<Instant>>`.
pub struct ProgressState {
    pub shutdown_flag: AtomicBool,
    pub timeout_ub: Duration,
    pub spindown: Duration,
    /// Set by [`crate::instance::Instance::migrate_progress`]: the next
    /// loop iteration re-spawns itself onto this pool and returns,
    /// instead of continuing on the old one. `take()`d by
    /// the progress ULT itself, so migration completes atomically with
    /// respect to the loop's own iterations — no iteration ever runs
    /// partway on the old pool and partway on the new one.
    migrate_to: Mutex<Option<Arc<Pool>>>,
}

impl ProgressState {
    pub fn new(timeout_ub_msec: u64, spindown_msec: u64) -> Self {
        Self {
            shutdown_flag: AtomicBool::new(false),
            timeout_ub: Duration::from_millis(timeout_ub_msec),
            spindown: Duration::from_millis(spindown_msec),
            migrate_to: Mutex::new(None),
        }
    }

    pub fn request_migration(&self, target: Arc<Pool>) {
        *self.migrate_to.lock() = Some(target);
    }

    fn take_migration(&self) -> Option<Arc<Pool>> {
        self.migrate_to.lock().take()
    }
}

/// The progress/trigger loop. Runs as one ULT pinned to
/// the configured progress pool until `shutdown_flag` is set.
pub async fn run(instance: Arc<Instance>) {
    let span = info_span!("margo::progress");
    let _enter = span.enter();
    let mut spin_until: Option<Instant> = None;

    loop {
        if instance.progress_state().shutdown_flag.load(Ordering::Acquire) {
            break;
        }

        // A pending migration request is honored before any
        // further progress iteration runs: spawn a fresh copy of this
        // loop onto the target pool and end this one immediately, so no
        // iteration ever straddles both pools.
        if let Some(target) = instance.progress_state().take_migration() {
            debug!(pool = %target.name, "migrating progress ult");
            crate::abt::spawn(&target, run(instance.clone()));
            return;
        }

        // Step 1: drain completions, zero timeout, one at a time.
        loop {
            if instance.progress_state().shutdown_flag.load(Ordering::Acquire) {
                break;
            }
            instance.monitor().on_event(&MonitorEvent::TriggerBegin);
            let triggered = match instance.transport().trigger(0, 1) {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "transport trigger failed");
                    0
                }
            };
            instance.diagnostics().record_trigger();
            instance.monitor().on_event(&MonitorEvent::TriggerEnd { count: triggered });
            if triggered == 0 {
                break;
            }
        }

        // Step 2: yield once to peer ULTs sharing this pool.
        crate::abt::yield_now().await;

        // Step 3: decide the next progress timeout.
        let now = Instant::now();
        let in_spin_window = spin_until.map(|t| now < t).unwrap_or(false);
        let timeout = if in_spin_window {
            Duration::ZERO
        } else {
            let pending = instance.finalize_state().pending_count();
            let pool_total = instance.substrate().progress_pool().total_size();
            if pending > 0 || pool_total > 1 {
                spin_until = Some(now + instance.progress_state().spindown);
                Duration::ZERO
            } else {
                spin_until = None;
                instance.progress_state().timeout_ub
            }
        };
        let timeout = match instance.timers().next_deadline() {
            Some(deadline) if deadline <= now => Duration::ZERO,
            Some(deadline) => timeout.min(deadline.saturating_duration_since(now)),
            None => timeout,
        };

        // Step 4: blocking progress.
        instance
            .monitor()
            .on_event(&MonitorEvent::ProgressBegin { timeout_ms: timeout.as_millis() as u64 });
        let outcome = instance.transport().progress(timeout.as_millis() as u64);
        instance.diagnostics().record_progress();
        match outcome {
            Ok(o) => {
                instance.monitor().on_event(&MonitorEvent::ProgressEnd {
                    outcome: if matches!(o, margo_transport::ProgressOutcome::Success) {
                        "success"
                    } else {
                        "timeout"
                    },
                });
            }
            Err(e) => {
                // Fatal: a non-success, non-timeout return aborts the process.
                error!(error = %e, critical = true, "blocking progress returned a fatal error");
                std::process::abort();
            }
        }

        // Step 5: fire due timers.
        let fired = instance
            .timers()
            .fire_due(Instant::now(), &instance.substrate().rpc_pool());
        if fired > 0 {
            instance.diagnostics().record_timer_fired(fired as u64);
        }
    }

    instance.finalize_state().mark_progress_drained();
}
