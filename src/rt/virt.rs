//! A deterministic runtime for tests: timers fire on a virtual clock
//! driven by [`VirtualRuntime::advance`], and spawned units are counted so
//! a test can assert that everything wound down.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::rt::sync::Watch;
use crate::rt::{Runtime, Timer, Work};

pub struct VirtualRuntime {
    base: Instant,
    inner: Arc<Watch<Inner>>,
    units: Arc<Watch<usize>>,
}

struct Inner {
    elapsed: Duration,
    next_seq: u64,
    timers: Vec<Entry>,
}

struct Entry {
    due: Duration,
    seq: u64,
    timer: Timer,
    on_fire: Work,
}

impl VirtualRuntime {
    pub fn new() -> VirtualRuntime {
        VirtualRuntime {
            base: Instant::now(),
            inner: Arc::new(Watch::new(Inner {
                elapsed: Duration::from_secs(0),
                next_seq: 0,
                timers: Vec::new(),
            })),
            units: Arc::new(Watch::new(0)),
        }
    }

    /// Advance the virtual clock, firing every timer that falls due, in
    /// deadline order (arming order breaks ties).
    pub fn advance(&self, d: Duration) {
        let due = {
            let mut inner = self.inner.lock();
            inner.elapsed += d;
            let now = inner.elapsed;

            let mut due: Vec<Entry> = Vec::new();
            let mut i = 0;
            while i < inner.timers.len() {
                if inner.timers[i].due <= now {
                    due.push(inner.timers.remove(i));
                } else {
                    i += 1;
                }
            }
            due.sort_by_key(|e| (e.due, e.seq));
            due
        };

        // Fired outside the lock: callbacks may arm new timers.
        for entry in due {
            if !entry.timer.is_canceled() {
                (entry.on_fire)();
            }
        }
    }

    /// How many spawned units have not yet finished.
    pub fn active_units(&self) -> usize {
        *self.units.lock()
    }

    /// Timers armed and not yet fired. Lets a test wait for another thread
    /// to reach the point where it arms one.
    pub fn pending_timers(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Block (in real time) until every spawned unit has finished, or the
    /// timeout elapses. Returns whether quiescence was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.units.lock();
        let (_guard, timed_out) = self
            .units
            .wait_timeout_while(guard, timeout, |count| *count > 0);
        !timed_out
    }
}

impl Default for VirtualRuntime {
    fn default() -> Self {
        VirtualRuntime::new()
    }
}

impl Runtime for VirtualRuntime {
    fn spawn(&self, name: &'static str, work: Work) {
        *self.units.lock() += 1;
        let units = Arc::clone(&self.units);

        let res = thread::Builder::new().name(name.into()).spawn(move || {
            work();
            *units.lock() -= 1;
            units.notify_all();
        });

        if let Err(err) = res {
            *self.units.lock() -= 1;
            self.units.notify_all();
            tracing::error!("failed to spawn {}: {}", name, err);
        }
    }

    fn now(&self) -> Instant {
        self.base + self.inner.lock().elapsed
    }

    fn timer(&self, delay: Duration, on_fire: Work) -> Timer {
        let timer = Timer::new();
        let mut inner = self.inner.lock();
        let due = inner.elapsed + delay;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.timers.push(Entry {
            due,
            seq,
            timer: timer.clone(),
            on_fire,
        });
        timer
    }
}
