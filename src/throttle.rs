use crate::class::Class;
use crate::clock::{NANOS_PER_SEC, ReservationClock, SystemWallClock, WallClock, slot_ns};
use crate::config::CapacityConfig;
use crate::signal::FlushSignal;
use crate::sleep::{Sleeper, SystemSleeper};
use crate::stats::CapacityStats;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Requests larger than this would overflow `bytes * 1_000_000_000` in
/// [`slot_ns`] (spec §4.B precondition, §9 "Open question — overflow").
pub const MAX_THROTTLE_BYTES: u64 = 16 * 1024 * 1024 * 1024;

/// How far back from `now_ns` the steal scan's initial floor sits (spec
/// §4.B step 7: "starting from a threshold of `now_ns - 500 ms`").
const STEAL_SCAN_WINDOW_NS: u64 = 500_000_000;

/// Fraction of a second's worth of a victim's capacity a single steal may
/// claim (spec §GLOSSARY "Steal": "a bounded slice (1/16 s)").
const STEAL_FRACTION: u64 = 16;

/// The hot-path throttle (spec §4.B) plus the connection-scoped state it
/// reads and mutates (spec §3). One instance models one storage-engine
/// connection's throttle state.
///
/// Clones of the same [`Arc<Throttle>`] are meant to be shared across every
/// caller thread; every public method here is safe to call concurrently
/// without external locking (spec §5: "There is no global mutex on the
/// throttle hot path").
pub struct Throttle {
    capacity_total: AtomicU64,
    capacity_ckpt: AtomicU64,
    capacity_evict: AtomicU64,
    capacity_log: AtomicU64,
    capacity_read: AtomicU64,
    reservation_ckpt: ReservationClock,
    reservation_evict: ReservationClock,
    reservation_log: ReservationClock,
    reservation_read: ReservationClock,
    reservation_total: ReservationClock,
    recovering: AtomicBool,
    stats: Arc<CapacityStats>,
    signal: Arc<FlushSignal>,
    clock: Arc<dyn WallClock>,
    sleeper: Arc<dyn Sleeper>,
}

impl Throttle {
    /// Constructs a throttle from a bound configuration, a shared stats
    /// block, and the flush signal it shares with the background flusher.
    /// Uses production clock and sleep implementations.
    #[must_use]
    pub fn new(config: CapacityConfig, stats: Arc<CapacityStats>, signal: Arc<FlushSignal>) -> Self {
        Self::with_clock_and_sleeper(
            config,
            stats,
            signal,
            Arc::new(SystemWallClock::new()),
            Arc::new(SystemSleeper),
        )
    }

    /// Constructs a throttle with injected clock and sleep implementations
    /// (spec §9 "Sleep abstraction"), for deterministic tests.
    #[must_use]
    pub fn with_clock_and_sleeper(
        config: CapacityConfig,
        stats: Arc<CapacityStats>,
        signal: Arc<FlushSignal>,
        clock: Arc<dyn WallClock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let throttle = Self {
            capacity_total: AtomicU64::new(0),
            capacity_ckpt: AtomicU64::new(0),
            capacity_evict: AtomicU64::new(0),
            capacity_log: AtomicU64::new(0),
            capacity_read: AtomicU64::new(0),
            reservation_ckpt: ReservationClock::new(),
            reservation_evict: ReservationClock::new(),
            reservation_log: ReservationClock::new(),
            reservation_read: ReservationClock::new(),
            reservation_total: ReservationClock::new(),
            recovering: AtomicBool::new(false),
            stats,
            signal,
            clock,
            sleeper,
        };
        throttle.configure(config);
        throttle
    }

    /// Applies a newly bound configuration (spec §4.E output). Reservation
    /// clocks are left as-is; only the capacity ceilings change, matching
    /// upstream's reconfigure-by-bounce at the lifecycle level (spec §4.D)
    /// rather than resetting in-flight pacing state here.
    pub fn configure(&self, config: CapacityConfig) {
        self.capacity_total.store(config.total(), Ordering::Relaxed);
        self.capacity_ckpt
            .store(config.capacity(Class::Ckpt), Ordering::Relaxed);
        self.capacity_evict
            .store(config.capacity(Class::Evict), Ordering::Relaxed);
        self.capacity_log
            .store(config.capacity(Class::Log), Ordering::Relaxed);
        self.capacity_read
            .store(config.capacity(Class::Read), Ordering::Relaxed);
        self.signal.set_threshold(config.threshold());
    }

    /// Sets or clears crash-recovery mode (spec §3, §6 "Connection flags:
    /// ... RECOVERING"). While set, `throttle()` is a no-op.
    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::Relaxed);
    }

    /// Returns the stats block this throttle publishes counters to.
    #[must_use]
    pub fn stats(&self) -> &Arc<CapacityStats> {
        &self.stats
    }

    fn capacity_atomic(&self, class: Class) -> &AtomicU64 {
        match class {
            Class::Ckpt => &self.capacity_ckpt,
            Class::Evict => &self.capacity_evict,
            Class::Log => &self.capacity_log,
            Class::Read => &self.capacity_read,
        }
    }

    fn reservation_clock(&self, class: Class) -> &ReservationClock {
        match class {
            Class::Ckpt => &self.reservation_ckpt,
            Class::Evict => &self.reservation_evict,
            Class::Log => &self.reservation_log,
            Class::Read => &self.reservation_read,
        }
    }

    fn capacity(&self, class: Class) -> u64 {
        self.capacity_atomic(class).load(Ordering::Relaxed)
    }

    fn capacity_total(&self) -> u64 {
        self.capacity_total.load(Ordering::Relaxed)
    }

    /// Scans the three classes other than `class` for the best steal victim
    /// (spec §4.B step 7). Returns the victim, its capacity, and its current
    /// reservation value at the moment of the scan, or `None` if every peer
    /// is at or above the `now_ns - 500ms` floor (nothing idle enough to
    /// steal from).
    fn select_steal_victim(&self, class: Class, now_ns: u64) -> Option<(Class, u64, u64)> {
        let mut best_value = now_ns.saturating_sub(STEAL_SCAN_WINDOW_NS);
        let mut best: Option<(Class, u64)> = None;

        for peer in class.peers() {
            let value = self.reservation_clock(peer).load();
            if value < best_value {
                best_value = value;
                best = Some((peer, value));
            }
        }

        best.map(|(victim, value)| (victim, self.capacity(victim), value))
    }

    /// The hot-path throttle operation (spec §4.B). Resolves `class`'s
    /// capacity and reservation clock, reserves time for `bytes`, optionally
    /// steals idle budget from a sibling class, and sleeps until the
    /// reservation catches up to wall-clock time.
    ///
    /// # Panics
    ///
    /// Debug builds assert `bytes < MAX_THROTTLE_BYTES` (spec §4.B
    /// precondition); release builds rely on [`slot_ns`]'s u64 arithmetic
    /// instead of paying for the check on every hot-path call.
    pub fn throttle(&self, class: Class, bytes: u64) {
        debug_assert!(
            bytes < MAX_THROTTLE_BYTES,
            "throttle() called with {bytes} bytes, exceeding the {MAX_THROTTLE_BYTES} byte limit"
        );

        self.stats.record_call(class);

        let capacity = self.capacity(class);
        let capacity_total = self.capacity_total();

        if (capacity == 0 && capacity_total == 0) || self.recovering.load(Ordering::Relaxed) {
            return;
        }

        if class.is_write() {
            self.signal.record_write(bytes);
        } else {
            self.stats.add_bytes_read(bytes);
        }

        let now_ns = self.clock.now_ns();

        let mut res_value = self.reservation_clock(class).reserve(bytes, capacity, now_ns);
        let mut res_total_value = self.reservation_total.reserve(bytes, capacity_total, now_ns);

        let should_attempt_steal =
            res_value > now_ns && res_total_value < now_ns && capacity_total != 0;

        if should_attempt_steal {
            if let Some((victim, victim_capacity, best_res)) =
                self.select_steal_victim(class, now_ns)
            {
                if victim_capacity != 0 {
                    let base = best_res.max(now_ns.saturating_sub(NANOS_PER_SEC));
                    let new_res = base + (NANOS_PER_SEC / STEAL_FRACTION)
                        + slot_ns(bytes, victim_capacity);

                    match self
                        .reservation_clock(victim)
                        .compare_exchange(best_res, new_res)
                    {
                        Ok(_) => {
                            let stolen_bytes = victim_capacity / STEAL_FRACTION;
                            res_value = self
                                .reservation_clock(class)
                                .fetch_sub(slot_ns(stolen_bytes, capacity));
                            tracing::trace!(
                                ?class,
                                ?victim,
                                stolen_bytes,
                                "capacity steal succeeded"
                            );
                        }
                        Err(_) => {
                            self.reservation_clock(class)
                                .fetch_sub(slot_ns(bytes, capacity));
                            self.reservation_total
                                .fetch_sub(slot_ns(bytes, capacity_total));

                            // Retry from step 5 without attempting another
                            // steal (spec §4.B step 7).
                            res_value =
                                self.reservation_clock(class).reserve(bytes, capacity, now_ns);
                            res_total_value = self
                                .reservation_total
                                .reserve(bytes, capacity_total, now_ns);
                            tracing::trace!(?class, ?victim, "capacity steal lost the CAS race");
                        }
                    }
                }
            }
        }

        let wait_ns = res_value.max(res_total_value);
        if wait_ns <= now_ns {
            return;
        }

        let sleep_us = (wait_ns - now_ns) / 1_000;

        if res_value == res_total_value {
            self.stats.record_total_throttled(sleep_us);
        } else {
            self.stats.record_class_throttled(class, sleep_us);
        }

        if sleep_us > 100 {
            self.sleeper.sleep_us(sleep_us);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::NANOS_PER_SEC;
    use crate::sleep::RecordingSleeper;
    use std::time::Duration;

    struct FakeClock(AtomicU64);

    impl FakeClock {
        fn new(start: u64) -> Self {
            Self(AtomicU64::new(start))
        }

        fn set(&self, value: u64) {
            self.0.store(value, Ordering::Relaxed);
        }
    }

    impl WallClock for FakeClock {
        fn now_ns(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    fn harness(config: CapacityConfig, now: u64) -> (Throttle, Arc<FakeClock>, RecordingSleeper) {
        let clock = Arc::new(FakeClock::new(now));
        let sleeper = RecordingSleeper::new();
        let stats = Arc::new(CapacityStats::new());
        let signal = Arc::new(FlushSignal::new(config.threshold(), Arc::clone(&stats)));
        let throttle = Throttle::with_clock_and_sleeper(
            config,
            stats,
            signal,
            clock.clone() as Arc<dyn WallClock>,
            Arc::new(sleeper.clone()),
        );
        (throttle, clock, sleeper)
    }

    // S1: uncapped fast path.
    #[test]
    fn uncapped_fast_path_never_sleeps() {
        let config = CapacityConfig::from_total(0).unwrap();
        let (throttle, _clock, sleeper) = harness(config, 0);

        for _ in 0..100 {
            throttle.throttle(Class::Log, 4096);
        }

        assert_eq!(sleeper.count(), 0);
        assert_eq!(throttle.reservation_clock(Class::Log).load(), 0);
        assert_eq!(throttle.stats().bytes_written(), 409_600);
    }

    // S2: single-class pacing.
    #[test]
    fn single_class_pacing_sleeps_on_second_call() {
        let mut config = CapacityConfig::from_total(0).unwrap();
        config.set_capacity(Class::Log, 1_000_000);
        let (throttle, _clock, sleeper) = harness(config, 0);

        throttle.throttle(Class::Log, 500_000);
        assert_eq!(throttle.reservation_clock(Class::Log).load(), 500_000_000);
        assert_eq!(sleeper.count(), 0);

        throttle.throttle(Class::Log, 500_000);
        assert_eq!(throttle.reservation_clock(Class::Log).load(), NANOS_PER_SEC);
        assert_eq!(sleeper.count(), 1);
        assert_eq!(sleeper.recorded()[0], Duration::from_secs(1));
    }

    #[test]
    fn recovering_connection_is_a_no_op() {
        let mut config = CapacityConfig::from_total(0).unwrap();
        config.set_capacity(Class::Log, 1_000_000);
        let (throttle, _clock, sleeper) = harness(config, 0);
        throttle.set_recovering(true);

        throttle.throttle(Class::Log, 500_000);

        assert_eq!(throttle.reservation_clock(Class::Log).load(), 0);
        assert_eq!(sleeper.count(), 0);
        assert_eq!(throttle.stats().bytes_written(), 0);
    }

    #[test]
    fn read_calls_do_not_touch_capacity_written() {
        let mut config = CapacityConfig::from_total(0).unwrap();
        config.set_capacity(Class::Read, 1_000_000);
        let (throttle, _clock, _sleeper) = harness(config, 0);

        throttle.throttle(Class::Read, 4096);

        assert_eq!(throttle.stats().bytes_written(), 0);
        assert_eq!(throttle.stats().bytes_read(), 4096);
    }

    // S3: steal succeeds and shortens the caller's wait. LOG is backed up
    // (reservation ahead of now) while CKPT sits idle at zero and the
    // aggregate clock has slack (behind now), so the trigger condition in
    // spec §4.B step 7 fires and CKPT is the selected victim.
    #[test]
    fn steal_succeeds_when_victim_is_idle() {
        let config = CapacityConfig::from_total(10_000_000).unwrap();
        let (throttle, clock, _sleeper) = harness(config, 600_000_000);

        let capacity_log = throttle.capacity(Class::Log);
        throttle.reservation_clock(Class::Log).store(700_000_000);
        throttle.reservation_total.store(0);
        clock.set(600_000_000);

        let without_steal_wait = 700_000_000 + slot_ns(50_000, capacity_log);

        throttle.throttle(Class::Log, 50_000);

        let after = throttle.reservation_clock(Class::Log).load();
        assert!(
            after < without_steal_wait,
            "expected steal to shorten the LOG clock: {after} vs {without_steal_wait}"
        );
        // The ckpt clock should have moved, evidence the victim was chosen.
        assert!(throttle.reservation_clock(Class::Ckpt).load() > 0);
    }

    #[test]
    fn steal_is_skipped_when_aggregate_has_no_slack() {
        let config = CapacityConfig::from_total(10_000_000).unwrap();
        let (throttle, clock, _sleeper) = harness(config, 600_000_000);

        throttle.reservation_clock(Class::Log).store(700_000_000);
        // Aggregate clock is almost caught up to now, so after its own
        // reservation res_total_value >= now_ns: the trigger condition in
        // spec §4.B step 7 fails.
        throttle.reservation_total.store(600_000_000);
        clock.set(600_000_000);

        let ckpt_before = throttle.reservation_clock(Class::Ckpt).load();
        throttle.throttle(Class::Log, 50_000);
        assert_eq!(throttle.reservation_clock(Class::Ckpt).load(), ckpt_before);
    }

    // S4: steal contested. Several threads race to steal from the same idle
    // victim class; at most one CAS per contended instant can succeed, so
    // the losers fall back to their own primary/aggregate reservations
    // (spec §4.B step 7 "retries from step 5 without attempting another
    // steal"). This can't pin the exact interleaving the way the
    // single-threaded S3 test above does, so it instead asserts the
    // invariants that must hold under *any* interleaving: every call
    // completes (no CAS-retry loop runs away), every byte is accounted for
    // exactly once (spec §8 quantified invariant 2), and the victim's clock
    // never goes backwards.
    #[test]
    fn steal_contention_across_threads_stays_consistent() {
        use std::sync::Barrier;
        use std::thread;

        let config = CapacityConfig::from_total(10_000_000).unwrap();
        let clock = Arc::new(FakeClock::new(600_000_000));
        let stats = Arc::new(CapacityStats::new());
        let signal = Arc::new(FlushSignal::new(config.threshold(), Arc::clone(&stats)));
        let throttle = Arc::new(Throttle::with_clock_and_sleeper(
            config,
            stats,
            signal,
            clock.clone() as Arc<dyn WallClock>,
            Arc::new(RecordingSleeper::new()),
        ));

        throttle.reservation_clock(Class::Log).store(700_000_000);
        throttle.reservation_total.store(0);

        const THREADS: usize = 8;
        let barrier = Arc::new(Barrier::new(THREADS));
        let ckpt_before = throttle.reservation_clock(Class::Ckpt).load();

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let throttle = Arc::clone(&throttle);
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    barrier.wait();
                    throttle.throttle(Class::Log, 50_000);
                });
            }
        });

        assert_eq!(throttle.stats().bytes_written(), 50_000 * THREADS as u64);
        assert!(throttle.reservation_clock(Class::Ckpt).load() >= ckpt_before);
    }

    #[test]
    fn drift_correction_never_produces_negative_sleep() {
        let config = CapacityConfig::from_total(0).unwrap();
        let mut config = config;
        config.set_capacity(Class::Log, 1_000_000);
        let (throttle, clock, sleeper) = harness(config, 10 * NANOS_PER_SEC);

        clock.set(10 * NANOS_PER_SEC);
        throttle.throttle(Class::Log, 1_000_000);

        // Whatever the limiter scheduled, it must not have asked to sleep
        // for a value computed from a negative (wrapped) duration.
        for sleep in sleeper.recorded() {
            assert!(sleep < Duration::from_secs(3600));
        }
    }
}
