//! Epoch Entry (§3): a peer-originated write buffered locally pending disk
//! write and/or ack. Mirrors `Request`'s hash-chain role on the inbound side.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EeStatus: u32 {
        const DISK_WRITTEN = 0b001;
        const ACK_SENT     = 0b010;
        const DISCARDED    = 0b100;
    }
}

#[derive(Debug, Clone)]
pub struct Ee {
    pub block_id: u64,
    pub sector: u64,
    pub len: u32,
    pub seq_num: u32,
    pub status: EeStatus,
}

impl Ee {
    pub fn new(block_id: u64, sector: u64, len: u32, seq_num: u32) -> Self {
        Self {
            block_id,
            sector,
            len,
            seq_num,
            status: EeStatus::empty(),
        }
    }
}

/// Receive-side EE lists (§4.5): the receiver is the only writer of these.
#[derive(Debug, Default)]
pub struct EeLists {
    pub active: Vec<Ee>,
    pub sync: Vec<Ee>,
    pub done: Vec<Ee>,
    pub net: Vec<Ee>,
}

impl EeLists {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn move_to_done(&mut self, block_id: u64) -> Option<Ee> {
        let idx = self.active.iter().position(|ee| ee.block_id == block_id)?;
        let mut ee = self.active.remove(idx);
        ee.status.insert(EeStatus::DISK_WRITTEN);
        self.done.push(ee.clone());
        Some(ee)
    }

    pub fn epoch_is_disk_complete(&self, ids: &[u64]) -> bool {
        ids.iter()
            .all(|id| self.done.iter().any(|ee| ee.block_id == *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn move_to_done_marks_disk_written() {
        let mut lists = EeLists::new();
        lists.active.push(Ee::new(1, 0, 8, 1));
        let done = lists.move_to_done(1).unwrap();
        assert!(done.status.contains(EeStatus::DISK_WRITTEN));
        assert!(lists.active.is_empty());
        assert_eq!(lists.done.len(), 1);
    }

    #[test]
    fn epoch_is_disk_complete_requires_all_ids() {
        let mut lists = EeLists::new();
        lists.active.push(Ee::new(1, 0, 8, 1));
        lists.active.push(Ee::new(2, 8, 8, 2));
        lists.move_to_done(1);
        assert!(!lists.epoch_is_disk_complete(&[1, 2]));
        lists.move_to_done(2);
        assert!(lists.epoch_is_disk_complete(&[1, 2]));
    }
}
