use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Injectable suspension point for the throttle hot path (spec §4.B step 9,
/// §9 "Sleep abstraction": "the hot path must allow a test double for sleep
/// and clock; the design assumes both are injectable").
///
/// Unlike the background flusher (an async `tokio` task that awaits a
/// timeout), the hot path is a plain blocking call — any thread in the host
/// process may call [`crate::Throttle::throttle`] — so the abstraction here
/// is a synchronous trait rather than a future.
pub trait Sleeper: Send + Sync {
    /// Suspends the calling thread for approximately `micros` microseconds.
    fn sleep_us(&self, micros: u64);
}

/// [`Sleeper`] that blocks the calling thread via [`std::thread::sleep`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSleeper;

impl Sleeper for SystemSleeper {
    fn sleep_us(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }
}

/// [`Sleeper`] that records requested durations instead of blocking, for
/// deterministic tests (mirrors the teacher crate's
/// `RecordedSleepSession`/`test-support` pattern, scoped per-instance here
/// instead of process-wide since each test constructs its own [`Throttle`]).
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Default, Clone)]
pub struct RecordingSleeper {
    recorded: Arc<Mutex<Vec<Duration>>>,
}

#[cfg(any(test, feature = "test-support"))]
impl RecordingSleeper {
    /// Constructs a recorder with an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of every duration the hot path asked to sleep for,
    /// in call order.
    #[must_use]
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Returns the number of sleeps recorded so far.
    #[must_use]
    pub fn count(&self) -> usize {
        self.recorded.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Returns the sum of every recorded duration.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .fold(Duration::ZERO, |acc, d| acc.saturating_add(*d))
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Sleeper for RecordingSleeper {
    fn sleep_us(&self, micros: u64) {
        self.recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Duration::from_micros(micros));
    }
}
