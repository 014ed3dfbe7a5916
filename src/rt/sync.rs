//! The predicate-wait primitive.
//!
//! A [`Watch`] is a monitor: state behind a mutex plus a condition signaled
//! whenever that state changes. Every blocking wait in the crate
//! (flow-control reserve, body-pipe reads and writes, result delivery,
//! concurrency-cap back-pressure) is a `wait_while` on some watch, so a
//! wakeup re-evaluates the caller's predicate and nothing sleeps on stale
//! state.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Watch<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Watch<T> {
    pub fn new(value: T) -> Watch<T> {
        Watch {
            state: Mutex::new(value),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block while `pred` holds, re-evaluating after every
    /// [`notify_all`](Watch::notify_all).
    pub fn wait_while<'a, F>(&self, guard: MutexGuard<'a, T>, pred: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.cond
            .wait_while(guard, pred)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Like [`wait_while`](Watch::wait_while), bounded by a real-time
    /// timeout. Returns the guard and whether the wait timed out. Used by
    /// test harnesses; production deadlines go through `Runtime` timers.
    pub fn wait_timeout_while<'a, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
        pred: F,
    ) -> (MutexGuard<'a, T>, bool)
    where
        F: FnMut(&mut T) -> bool,
    {
        let (guard, res) = self
            .cond
            .wait_timeout_while(guard, timeout, pred)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, res.timed_out())
    }

    /// Wake every waiter so it re-checks its predicate.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}
