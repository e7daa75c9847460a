use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

struct Inner<T> {
    value: Option<T>,
    wakers: Vec<Waker>,
}

/// A single-shot synchronization primitive, settable once and awaitable
/// by one or more ULTs. Unlike the C library's
/// `ABT_eventual`, `wait` here is an async `.await` point rather than a
/// blocking call — the ULT suspends cooperatively instead of parking
/// its OS thread.
pub struct Eventual<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Clone> Eventual<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                value: None,
                wakers: Vec::new(),
            }),
        }
    }

    /// Set the value and wake every waiter. Setting an already-set
    /// eventual overwrites the value (the request lifecycle never does
    /// this; guarded for robustness rather than relied upon).
    pub fn set(&self, value: T) {
        let mut inner = self.inner.lock();
        inner.value = Some(value);
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.value = None;
    }

    /// Non-blocking check: `Some(value)` if set, without consuming it.
    pub fn test(&self) -> Option<T> {
        self.inner.lock().value.clone()
    }

    pub fn wait(&self) -> Wait<'_, T> {
        Wait { eventual: self }
    }
}

impl<T: Clone> Default for Eventual<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Wait<'a, T> {
    eventual: &'a Eventual<T>,
}

impl<'a, T: Clone> Future for Wait<'a, T> {
    type Output = T;
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let mut inner = self.eventual.inner.lock();
        if let Some(value) = inner.value.clone() {
            Poll::Ready(value)
        } else {
            inner.wakers.push(cx.waker().clone());
            Poll::Pending
        }
    }
}
