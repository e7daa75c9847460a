use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle as OsJoinHandle;
use std::time::Duration;

use super::pool::Pool;

/// An OS thread pulling ULTs from one or more pools in scheduler order.
/// `basic_wait` is the only scheduler kind implemented: pools are
/// polled round-robin, front to back, and the stream parks briefly
/// when all are empty rather than busy-spin.
pub struct ExecutionStream {
    pub name: String,
    pub owning: bool,
    pub affinity: Option<Vec<i32>>,
    pools: Vec<Arc<Pool>>,
    shutdown: Arc<AtomicBool>,
    join: Mutex<Option<OsJoinHandle<()>>>,
}

use parking_lot::Mutex;

impl ExecutionStream {
    pub fn new(name: impl Into<String>, owning: bool, affinity: Option<Vec<i32>>, pools: Vec<Arc<Pool>>) -> Arc<Self> {
        for pool in &pools {
            pool.incr_ref();
        }
        let es = Arc::new(Self {
            name: name.into(),
            owning,
            affinity,
            pools,
            shutdown: Arc::new(AtomicBool::new(false)),
            join: Mutex::new(None),
        });
        es.start();
        es
    }

    fn start(self: &Arc<Self>) {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("margo-es-{name}"))
            .spawn(move || {
                while !shutdown.load(Ordering::Acquire) {
                    let mut ran = false;
                    for pool in &this.pools {
                        if let Some(task) = pool.try_pop() {
                            ran = true;
                            if !task.poll_once() {
                                // still pending; ArcWake re-pushes it on wake,
                                // nothing further to do here.
                            }
                        }
                    }
                    if !ran {
                        std::thread::sleep(Duration::from_micros(200));
                    }
                }
            })
            .expect("failed to spawn margo execution stream thread");
        *self.join.lock() = Some(handle);
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn join(&self) {
        self.shutdown();
        if let Some(handle) = self.join.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        self.shutdown();
        for pool in &self.pools {
            pool.decr_ref();
        }
    }
}
