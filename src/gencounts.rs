//! Generation counters exchanged during handshake to decide who is more
//! up-to-date, plus the small flag set that rides alongside them.

use bitflags::bitflags;

bitflags! {
    /// Flags reported together with the generation counters.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GenFlags: u32 {
        const PRIMARY_LOST_QUORUM = 0b0000_0001;
        const CONNECTED_IND       = 0b0000_0010;
        const CRASHED_PRIMARY     = 0b0000_0100;
        const CONSISTENT          = 0b0000_1000;
    }
}

/// Five generation counters plus their flags (§3: GenCounts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenCounts {
    counters: [u32; 5],
    flags: GenFlags,
}

impl GenCounts {
    pub fn new(counters: [u32; 5], flags: GenFlags) -> Self {
        Self { counters, flags }
    }

    pub fn from_parts(counters: [u32; 5], flags_bits: u32) -> Self {
        Self {
            counters,
            flags: GenFlags::from_bits_truncate(flags_bits),
        }
    }

    pub fn counters(&self) -> &[u32; 5] {
        &self.counters
    }

    pub fn flags(&self) -> GenFlags {
        self.flags
    }

    /// True if `self` is at least as up-to-date as `other` on every counter.
    pub fn dominates(&self, other: &GenCounts) -> bool {
        self.counters
            .iter()
            .zip(other.counters.iter())
            .all(|(a, b)| a >= b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_counters_dominate_each_other() {
        let a = GenCounts::new([1, 2, 3, 4, 5], GenFlags::CONSISTENT);
        let b = a;
        assert!(a.dominates(&b));
        assert!(b.dominates(&a));
    }

    #[test]
    fn a_strictly_newer_counter_dominates() {
        let older = GenCounts::new([1, 2, 3, 4, 5], GenFlags::empty());
        let newer = GenCounts::new([1, 2, 3, 4, 6], GenFlags::empty());
        assert!(newer.dominates(&older));
        assert!(!older.dominates(&newer));
    }
}
