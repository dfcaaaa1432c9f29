use std::fmt;

/// One of the four workload tags the throttle paces independently.
///
/// `Class::ALL` fixes the source order (checkpoint, eviction, log, read) used
/// both for tie-breaking in the steal scan (spec §4.B step 7) and for
/// deriving per-class capacities (spec §4.E). Implementers may replace the
/// fixed order with a randomised selection if fairness tests still pass
/// (spec §9, "Open question — steal source ordering"); this crate keeps the
/// frozen order to preserve observable behaviour.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Class {
    /// Checkpoint I/O.
    Ckpt,
    /// Eviction I/O.
    Evict,
    /// Write-ahead log I/O.
    Log,
    /// Read I/O.
    Read,
}

impl Class {
    /// All classes in the fixed source order used for the steal scan.
    pub const ALL: [Class; 4] = [Class::Ckpt, Class::Evict, Class::Log, Class::Read];

    /// Returns `true` for every class except [`Class::Read`].
    ///
    /// Only non-read classes accumulate into `capacity_written` and wake the
    /// background flusher (spec §4.B step 3).
    #[must_use]
    pub const fn is_write(self) -> bool {
        !matches!(self, Class::Read)
    }

    /// Returns the other three classes in source order, for the steal scan.
    #[must_use]
    pub fn peers(self) -> impl Iterator<Item = Class> {
        Class::ALL.into_iter().filter(move |&c| c != self)
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Class::Ckpt => "ckpt",
            Class::Evict => "evict",
            Class::Log => "log",
            Class::Read => "read",
        };
        f.write_str(name)
    }
}
