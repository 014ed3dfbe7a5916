//! The scheduling abstraction.
//!
//! The connection coordinator never spawns a thread, arms a timer, or
//! blocks on a condition directly; it goes through [`Runtime`] and the
//! [`sync::Watch`] monitor. Production binds these to real threads and
//! wall-clock timers ([`SystemRuntime`]); tests bind timers to a virtual
//! clock ([`virt::VirtualRuntime`]) so timing-dependent behavior such as
//! deadlines, keepalive pings, and flow-control stalls runs
//! deterministically.

pub mod sync;
pub mod virt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// A unit of work handed to [`Runtime::spawn`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Spawning, clocks, and timers, injectable so the same coordinator logic
/// runs against real concurrency in production and a virtual clock in
/// tests.
pub trait Runtime: Send + Sync + 'static {
    /// Run `work` as an independent concurrent unit.
    fn spawn(&self, name: &'static str, work: Work);

    /// The current time on this runtime's clock.
    fn now(&self) -> Instant;

    /// Arm a timer firing `on_fire` after `delay`, unless canceled first.
    fn timer(&self, delay: Duration, on_fire: Work) -> Timer;
}

/// A cancellable handle to a pending timer.
#[derive(Debug, Clone)]
pub struct Timer {
    canceled: Arc<AtomicBool>,
}

impl Timer {
    pub(crate) fn new() -> Timer {
        Timer {
            canceled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Prevent the timer from firing. Idempotent; a no-op if the timer
    /// already fired.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// [`Runtime`] backed by `std::thread` and the wall clock.
#[derive(Debug, Default)]
pub struct SystemRuntime;

impl SystemRuntime {
    pub fn new() -> SystemRuntime {
        SystemRuntime
    }
}

impl Runtime for SystemRuntime {
    fn spawn(&self, name: &'static str, work: Work) {
        let res = thread::Builder::new().name(name.into()).spawn(work);
        if let Err(err) = res {
            tracing::error!("failed to spawn {}: {}", name, err);
        }
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn timer(&self, delay: Duration, on_fire: Work) -> Timer {
        let timer = Timer::new();
        let handle = timer.clone();

        self.spawn(
            "plait-timer",
            Box::new(move || {
                thread::sleep(delay);
                if !handle.is_canceled() {
                    on_fire();
                }
            }),
        );

        timer
    }
}
