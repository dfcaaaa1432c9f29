use crate::class::Class;
use crate::error::ConfigError;

/// Minimum non-zero `io_capacity.total`, in bytes/sec (spec §4.E). Named
/// after the engine constant `WT_THROTTLE_MIN` this crate's config binder is
/// the Rust-side collaborator for.
pub const MIN_CAPACITY_BYTES_PER_SEC: u64 = 1_048_576;

/// Host-supplied configuration reader (spec §6, "a key-value reader exposing
/// `io_capacity.total : int64`"). Configuration parsing and validation
/// beyond this single key is explicitly out of scope (spec §1); callers plug
/// in whatever config framework they already use and implement this trait as
/// a thin adapter over it.
pub trait ConfigSource {
    /// Returns the configured `io_capacity.total`, or `None` if unset (in
    /// which case the throttle behaves as if `total = 0`, i.e. uncapped).
    fn io_capacity_total(&self) -> Option<i64>;
}

/// A directly-constructed [`ConfigSource`] for callers that already have the
/// value in hand (tests, or hosts that parsed it themselves).
impl ConfigSource for i64 {
    fn io_capacity_total(&self) -> Option<i64> {
        Some(*self)
    }
}

/// Per-class capacities and the derived flush threshold, bound from a single
/// aggregate `total` bytes/sec figure (spec §4.E).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CapacityConfig {
    total: u64,
    ckpt: u64,
    evict: u64,
    log: u64,
    read: u64,
    threshold: u64,
}

impl CapacityConfig {
    /// The uncapped configuration: every class and the aggregate are
    /// uncapped, and the flusher never starts (spec §3 invariant 4).
    #[must_use]
    pub const fn uncapped() -> Self {
        Self {
            total: 0,
            ckpt: 0,
            evict: 0,
            log: 0,
            read: 0,
            threshold: 0,
        }
    }

    /// Binds a `total` bytes/sec figure into per-class capacities and a
    /// flush threshold (spec §4.E).
    ///
    /// `total == 0` means "no aggregate cap": every class is left uncapped
    /// and the flush threshold is zero, so the flusher will not be started.
    /// A non-zero `total` below [`MIN_CAPACITY_BYTES_PER_SEC`] is rejected.
    pub fn from_total(total: u64) -> Result<Self, ConfigError> {
        if total != 0 && total < MIN_CAPACITY_BYTES_PER_SEC {
            return Err(ConfigError::BelowMinimum {
                got: total,
                min: MIN_CAPACITY_BYTES_PER_SEC,
            });
        }

        if total == 0 {
            return Ok(Self::uncapped());
        }

        let ckpt = total * 10 / 100;
        let evict = total * 60 / 100;
        let log = total * 20 / 100;
        let read = total * 60 / 100;
        let threshold = (ckpt + evict + log) * 10 / 100;

        Ok(Self {
            total,
            ckpt,
            evict,
            log,
            read,
            threshold,
        })
    }

    /// Reads `io_capacity.total` from `source` and binds it (spec §4.E,
    /// §6). Returns the uncapped configuration if the source has no value.
    pub fn from_source(source: &impl ConfigSource) -> Result<Self, ConfigError> {
        match source.io_capacity_total() {
            None => Ok(Self::uncapped()),
            Some(total) => Self::from_total(total.max(0) as u64),
        }
    }

    /// Returns the configured aggregate capacity, or 0 if uncapped.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Returns the capacity for `class`, in bytes/sec (0 means uncapped).
    #[must_use]
    pub const fn capacity(&self, class: Class) -> u64 {
        match class {
            Class::Ckpt => self.ckpt,
            Class::Evict => self.evict,
            Class::Log => self.log,
            Class::Read => self.read,
        }
    }

    /// Returns the derived flush threshold (spec §4.E last step).
    #[must_use]
    pub const fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Overrides a single class's capacity independently of `total` (spec
    /// §3: "independently settable; 0 means class uncapped"). The derived
    /// flush threshold is left untouched, since §4.E only recomputes it as
    /// part of binding a new `total`.
    pub fn set_capacity(&mut self, class: Class, bytes_per_sec: u64) {
        match class {
            Class::Ckpt => self.ckpt = bytes_per_sec,
            Class::Evict => self.evict = bytes_per_sec,
            Class::Log => self.log = bytes_per_sec,
            Class::Read => self.read = bytes_per_sec,
        }
    }

    /// Returns `true` if any write class (ckpt, evict, log) is capped, i.e.
    /// the background flusher should run (spec §3 invariant 4, §4.D).
    #[must_use]
    pub const fn needs_flusher(&self) -> bool {
        self.threshold != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_total_is_uncapped() {
        let cfg = CapacityConfig::from_total(0).unwrap();
        assert_eq!(cfg.total(), 0);
        assert_eq!(cfg.capacity(Class::Log), 0);
        assert_eq!(cfg.threshold(), 0);
        assert!(!cfg.needs_flusher());
    }

    #[test]
    fn below_minimum_is_rejected() {
        let err = CapacityConfig::from_total(MIN_CAPACITY_BYTES_PER_SEC - 1).unwrap_err();
        assert_eq!(
            err,
            ConfigError::BelowMinimum {
                got: MIN_CAPACITY_BYTES_PER_SEC - 1,
                min: MIN_CAPACITY_BYTES_PER_SEC,
            }
        );
    }

    #[test]
    fn derives_per_class_percentages() {
        let cfg = CapacityConfig::from_total(10_000_000).unwrap();
        assert_eq!(cfg.capacity(Class::Ckpt), 1_000_000);
        assert_eq!(cfg.capacity(Class::Evict), 6_000_000);
        assert_eq!(cfg.capacity(Class::Log), 2_000_000);
        assert_eq!(cfg.capacity(Class::Read), 6_000_000);
    }

    #[test]
    fn derives_threshold_from_write_classes() {
        let cfg = CapacityConfig::from_total(10_000_000).unwrap();
        // (1_000_000 + 6_000_000 + 2_000_000) * 10 / 100
        assert_eq!(cfg.threshold(), 900_000);
        assert!(cfg.needs_flusher());
    }

    #[test]
    fn from_source_reads_config_source() {
        let cfg = CapacityConfig::from_source(&10_000_000i64).unwrap();
        assert_eq!(cfg.total(), 10_000_000);
    }

    #[test]
    fn from_source_missing_value_is_uncapped() {
        struct Empty;
        impl ConfigSource for Empty {
            fn io_capacity_total(&self) -> Option<i64> {
                None
            }
        }
        let cfg = CapacityConfig::from_source(&Empty).unwrap();
        assert!(!cfg.needs_flusher());
    }

    #[test]
    fn idempotent_reconfigure_same_total() {
        let a = CapacityConfig::from_total(20_000_000).unwrap();
        let b = CapacityConfig::from_total(20_000_000).unwrap();
        assert_eq!(a, b);
    }
}
