use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::Context;

use futures::task::{waker_ref, ArcWake};
use parking_lot::Mutex;

use super::pool::Pool;
use super::sync::Eventual;

/// A user-level thread: any boxed, `Send` future. Cooperative suspension
/// is just `.await`; nothing here is stackful.
pub type Ult = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One schedulable unit inside a [`Pool`]'s queue.
pub(crate) struct Task {
    future: Mutex<Option<Ult>>,
    /// Re-enqueues `self` into this pool when woken mid-poll.
    home: Weak<Pool>,
}

pub(crate) type Runnable = Arc<Task>;

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if let Some(pool) = arc_self.home.upgrade() {
            pool.push(arc_self.clone());
        }
    }
}

impl Task {
    /// Poll once. Returns `true` if the future completed.
    pub(crate) fn poll_once(self: &Arc<Self>) -> bool {
        let mut slot = self.future.lock();
        let Some(mut fut) = slot.take() else {
            return true;
        };
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&waker);
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(()) => true,
            std::task::Poll::Pending => {
                *slot = Some(fut);
                false
            }
        }
    }
}

/// A handle to a spawned ULT's eventual result.
pub struct JoinHandle<T> {
    eventual: Arc<Eventual<T>>,
}

impl<T: Send + 'static> JoinHandle<T> {
    pub async fn join(&self) -> T {
        self.eventual.wait().await
    }
}

/// Spawn `fut` as a new ULT onto `pool`.
pub fn spawn<T, F>(pool: &Arc<Pool>, fut: F) -> JoinHandle<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let eventual = Arc::new(Eventual::new());
    let result_slot = eventual.clone();
    let wrapped: Ult = Box::pin(async move {
        let value = fut.await;
        result_slot.set(value);
    });
    let task = Arc::new(Task {
        future: Mutex::new(Some(wrapped)),
        home: Arc::downgrade(pool),
    });
    pool.push(task);
    JoinHandle { eventual }
}

/// Yield once to the scheduler — an `.await` point with no payload,
/// giving peer ULTs sharing this pool a chance to run.
pub struct Yield(bool);

impl Future for Yield {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> std::task::Poll<()> {
        if self.0 {
            std::task::Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            std::task::Poll::Pending
        }
    }
}

pub fn yield_now() -> Yield {
    Yield(false)
}
