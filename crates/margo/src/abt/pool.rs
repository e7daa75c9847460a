use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::ult::Runnable;

/// Queueing discipline a pool was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    BasicFifo,
    BlockingFifo,
    RandomWorkStealing,
    PriorityBlocking,
    External,
}

/// Producer/consumer multiplicity a pool was declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    Private,
    Spsc,
    Mpsc,
    Spmc,
    Mpmc,
}

/// A FIFO/priority/work-stealing queue of runnable ULTs.
///
/// `kind`/`access` are metadata only here — `crossbeam-channel`'s
/// unbounded MPMC channel underlies every kind. Nothing up the stack
/// depends on strict priority ordering or work-stealing balance, only
/// on FIFO delivery and reference counting.
pub struct Pool {
    pub name: String,
    pub kind: PoolKind,
    pub access: AccessClass,
    pub owning: bool,
    refcount: AtomicUsize,
    sender: Sender<Runnable>,
    receiver: Receiver<Runnable>,
}

impl Pool {
    pub fn new(name: impl Into<String>, kind: PoolKind, access: AccessClass, owning: bool) -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new(Self {
            name: name.into(),
            kind,
            access,
            owning,
            refcount: AtomicUsize::new(0),
            sender,
            receiver,
        })
    }

    /// An externally-owned pool the instance merely references.
    pub fn external(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, PoolKind::External, AccessClass::Mpmc, false)
    }

    pub(crate) fn push(&self, task: Runnable) {
        let _ = self.sender.send(task);
    }

    pub(crate) fn try_pop(&self) -> Option<Runnable> {
        self.receiver.try_recv().ok()
    }

    pub(crate) fn receiver(&self) -> &Receiver<Runnable> {
        &self.receiver
    }

    pub fn incr_ref(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_ref(&self) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Runnable + suspended tasks currently queued. Tasks are only ever
    /// "in the channel" or "running"; a task being polled is not
    /// counted here — this is a sample taken between progress
    /// iterations, not mid-poll.
    pub fn total_size(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
