use crate::class::Class;
use std::sync::atomic::{AtomicU64, Ordering};

/// A single monotonic counter, incremented or set with atomic
/// read-modify-write. Spec §1 calls the counter infrastructure itself out of
/// scope ("assumed: monotonic counters with atomic increment and set"); this
/// is the crate's minimal concrete implementation of that assumption.
#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn add(&self, delta: u64) {
        self.0.fetch_add(delta, Ordering::Relaxed);
    }

    fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-class call/throttle/time counters, indexed in [`Class::ALL`] order.
#[derive(Debug, Default)]
struct PerClass {
    calls: Counter,
    throttles: Counter,
    time_us: Counter,
}

/// Atomic stats counters backing the field list in spec §6:
/// `capacity_{threshold, timeout, signalled, signal_calls, signals,
/// bytes_written, bytes_read, {ckpt,evict,log,read}_calls,
/// {ckpt,evict,log,read,total}_throttles, {ckpt,evict,log,read,total}_time,
/// fsync_notyet}`.
#[derive(Debug, Default)]
pub struct CapacityStats {
    threshold: Counter,
    timeout: Counter,
    signalled: Counter,
    signal_calls: Counter,
    signals: Counter,
    bytes_written: Counter,
    bytes_read: Counter,
    fsync_notyet: Counter,
    ckpt: PerClass,
    evict: PerClass,
    log: PerClass,
    read: PerClass,
    total_throttles: Counter,
    total_time_us: Counter,
}

impl CapacityStats {
    /// Constructs a fresh, zeroed stats block.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn per_class(&self, class: Class) -> &PerClass {
        match class {
            Class::Ckpt => &self.ckpt,
            Class::Evict => &self.evict,
            Class::Log => &self.log,
            Class::Read => &self.read,
        }
    }

    /// Publishes the derived flush threshold (spec §4.E last step).
    pub fn set_threshold(&self, value: u64) {
        self.threshold.set(value);
    }

    /// Returns the published flush threshold.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold.get()
    }

    /// Records a flusher wakeup caused by the 100ms timeout rather than a
    /// signal (spec §4.C step 1).
    pub fn record_timeout(&self) {
        self.timeout.add(1);
    }

    /// Records that a signal is now in flight (spec §4.D `signal()`).
    pub fn record_signalled(&self) {
        self.signalled.add(1);
    }

    /// Records every call to `signal()`, successful or not (spec §4.D).
    pub fn record_signal_call(&self) {
        self.signal_calls.add(1);
    }

    /// Records an actual condition wake performed by `signal()`.
    pub fn record_signal_woken(&self) {
        self.signals.add(1);
    }

    /// Records bytes passed to a non-READ throttle call.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.add(bytes);
    }

    /// Records bytes passed to a READ throttle call.
    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.add(bytes);
    }

    /// Records a flusher cycle that found nothing to flush (spec §4.C step
    /// 5).
    pub fn record_fsync_notyet(&self) {
        self.fsync_notyet.add(1);
    }

    /// Records a call into `throttle()` for `class` (spec §4.B step 1).
    pub fn record_call(&self, class: Class) {
        self.per_class(class).calls.add(1);
    }

    /// Records that a call against `class` actually slept, along with the
    /// microseconds spent sleeping (spec §4.B step 9).
    pub fn record_class_throttled(&self, class: Class, sleep_us: u64) {
        let slot = self.per_class(class);
        slot.throttles.add(1);
        slot.time_us.add(sleep_us);
    }

    /// Records an aggregate-clock-driven sleep, used instead of the
    /// per-class counters when `res_value == res_total_value` (spec §4.B
    /// step 9).
    pub fn record_total_throttled(&self, sleep_us: u64) {
        self.total_throttles.add(1);
        self.total_time_us.add(sleep_us);
    }

    /// Returns `(calls, throttles, time_us)` for `class`, for tests and
    /// diagnostics.
    #[must_use]
    pub fn class_snapshot(&self, class: Class) -> (u64, u64, u64) {
        let slot = self.per_class(class);
        (slot.calls.get(), slot.throttles.get(), slot.time_us.get())
    }

    /// Returns `(total_throttles, total_time_us)`.
    #[must_use]
    pub fn total_snapshot(&self) -> (u64, u64) {
        (self.total_throttles.get(), self.total_time_us.get())
    }

    /// Returns the cumulative bytes written via non-READ throttle calls.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }

    /// Returns the cumulative bytes passed to READ throttle calls.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    /// Returns the number of flusher cycles that found nothing to flush.
    #[must_use]
    pub fn fsync_notyet(&self) -> u64 {
        self.fsync_notyet.get()
    }

    /// Returns the number of `signal()` calls observed.
    #[must_use]
    pub fn signal_calls(&self) -> u64 {
        self.signal_calls.get()
    }

    /// Returns the number of actual condition wakes `signal()` performed.
    #[must_use]
    pub fn signals(&self) -> u64 {
        self.signals.get()
    }

    /// Returns the number of timeout-driven flusher wakeups.
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeout.get()
    }
}
