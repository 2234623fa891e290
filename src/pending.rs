//! Pending-write counters (§3): drain targets for state changes and teardown.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Default)]
pub struct PendingCounters {
    ap_pending: AtomicU32,
    rs_pending: AtomicU32,
    unacked: AtomicU32,
}

impl PendingCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ap_pending(&self) -> u32 {
        self.ap_pending.load(Ordering::Acquire)
    }

    pub fn rs_pending(&self) -> u32 {
        self.rs_pending.load(Ordering::Acquire)
    }

    pub fn unacked(&self) -> u32 {
        self.unacked.load(Ordering::Acquire)
    }

    pub fn inc_ap_pending(&self) {
        self.ap_pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrements `ap_pending`, saturating at zero rather than wrapping. A
    /// caller decrementing past zero indicates a bookkeeping bug upstream.
    pub fn dec_ap_pending(&self) {
        let _ = self
            .ap_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    pub fn inc_rs_pending(&self) {
        self.rs_pending.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_rs_pending(&self) {
        let _ = self
            .rs_pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }

    pub fn inc_unacked(&self) {
        self.unacked.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_unacked(&self) {
        let _ = self
            .unacked
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let pc = PendingCounters::new();
        assert_eq!(pc.ap_pending(), 0);
        assert_eq!(pc.rs_pending(), 0);
        assert_eq!(pc.unacked(), 0);
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let pc = PendingCounters::new();
        pc.dec_ap_pending();
        assert_eq!(pc.ap_pending(), 0);
        pc.inc_ap_pending();
        pc.dec_ap_pending();
        assert_eq!(pc.ap_pending(), 0);
    }
}
