use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::abt::Pool;

pub type TimerId = u64;
pub type TimerCallback = Box<dyn FnOnce() + Send>;

struct ArmedTimer {
    id: TimerId,
    deadline: Instant,
    callback: Mutex<Option<TimerCallback>>,
    pool: Option<Arc<Pool>>,
}

impl PartialEq for ArmedTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for ArmedTimer {}
impl PartialOrd for ArmedTimer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for ArmedTimer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the binary heap (a max-heap) pops the earliest deadline.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

/// A sorted structure of armed timers. The progress loop inspects the
/// earliest deadline to clamp its blocking-progress timeout, then
/// fires everything past due.
pub struct TimerWheel {
    heap: Mutex<BinaryHeap<Arc<ArmedTimer>>>,
    by_id: Mutex<std::collections::HashMap<TimerId, Arc<ArmedTimer>>>,
    next_id: AtomicU64,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            by_id: Mutex::new(std::collections::HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn arm(&self, deadline: Instant, pool: Option<Arc<Pool>>, callback: TimerCallback) -> TimerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timer = Arc::new(ArmedTimer {
            id,
            deadline,
            callback: Mutex::new(Some(callback)),
            pool,
        });
        self.heap.lock().push(timer.clone());
        self.by_id.lock().insert(id, timer);
        id
    }

    /// Detach a not-yet-fired timer atomically. Returns `true` if it
    /// was still armed (hadn't already fired).
    pub fn cancel(&self, id: TimerId) -> bool {
        match self.by_id.lock().remove(&id) {
            Some(timer) => timer.callback.lock().take().is_some(),
            None => false,
        }
    }

    /// Soonest deadline among still-armed timers, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut heap = self.heap.lock();
        while let Some(top) = heap.peek() {
            if self.by_id.lock().contains_key(&top.id) {
                return Some(top.deadline);
            }
            heap.pop();
        }
        None
    }

    /// Fire every timer whose deadline has passed, scheduling each
    /// callback on its requested pool (or running it inline if none
    /// was given — the caller's responsibility to pick a sane default).
    pub fn fire_due(&self, now: Instant, default_pool: &Arc<Pool>) -> usize {
        let mut fired = 0;
        loop {
            let due = {
                let mut heap = self.heap.lock();
                match heap.peek() {
                    Some(top) if top.deadline <= now => heap.pop(),
                    _ => None,
                }
            };
            let Some(timer) = due else { break };
            let still_armed = self.by_id.lock().remove(&timer.id).is_some();
            if !still_armed {
                continue;
            }
            if let Some(cb) = timer.callback.lock().take() {
                let pool = timer.pool.clone().unwrap_or_else(|| default_pool.clone());
                crate::abt::spawn(&pool, async move {
                    cb();
                });
                fired += 1;
            }
        }
        fired
    }

    pub fn armed_count(&self) -> usize {
        self.by_id.lock().len()
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abt::pool::AccessClass;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn default_pool() -> Arc<Pool> {
        Pool::new("test-pool", crate::abt::pool::PoolKind::BlockingFifo, AccessClass::Mpmc, true)
    }

    #[test]
    fn next_deadline_tracks_the_earliest_still_armed_timer() {
        let wheel = TimerWheel::new();
        assert!(wheel.next_deadline().is_none());

        let now = Instant::now();
        let later = wheel.arm(now + Duration::from_secs(10), None, Box::new(|| {}));
        let sooner = wheel.arm(now + Duration::from_secs(1), None, Box::new(|| {}));
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(1)));

        // Cancelling the soonest timer exposes the next one.
        assert!(wheel.cancel(sooner));
        assert_eq!(wheel.next_deadline(), Some(now + Duration::from_secs(10)));
        assert!(wheel.cancel(later));
        assert!(wheel.next_deadline().is_none());
    }

    #[test]
    fn cancel_is_idempotent_and_never_double_fires() {
        let wheel = TimerWheel::new();
        let id = wheel.arm(Instant::now(), None, Box::new(|| {}));
        assert!(wheel.cancel(id));
        // A second cancel of the same (already-detached) id reports false,
        // rather than double-firing or panicking.
        assert!(!wheel.cancel(id));
    }

    #[test]
    fn fire_due_only_fires_past_deadlines_and_detaches_them() {
        let wheel = TimerWheel::new();
        let pool = default_pool();
        let fired = Arc::new(AtomicUsize::new(0));

        let now = Instant::now();
        let past = {
            let fired = fired.clone();
            wheel.arm(now - Duration::from_millis(1), None, Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let future = wheel.arm(now + Duration::from_secs(60), None, Box::new(|| {}));

        let n = wheel.fire_due(now, &pool);
        assert_eq!(n, 1);
        assert_eq!(wheel.armed_count(), 1);
        // The due timer's callback was scheduled onto `pool`, not run inline.
        let task = pool.try_pop().expect("fired timer callback scheduled onto pool");
        task.poll_once();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Firing again at the same instant is a no-op: `past` already detached.
        assert_eq!(wheel.fire_due(now, &pool), 0);
        assert!(!wheel.cancel(past));
        assert!(wheel.cancel(future));
    }
}
