//! The active table: a fixed ring tracking in-flight custody-bearing
//! bundles awaiting acknowledgment.
//!
//! Slot `cid % size` holds the storage id of the bundle labelled with
//! custody id `cid` and the time it was last transmitted. Two monotonic
//! counters bound the live window: `oldest_cid <= current_cid` and
//! `current_cid - oldest_cid <= size` at all times. A custody id wrapping
//! onto an occupied slot is the back-pressure signal handled by the
//! channel's wrap-response policy.

use crate::storage::Sid;

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    sid: Option<Sid>,
    last_retx_secs: u64,
}

#[derive(Debug)]
pub struct ActiveTable {
    slots: Vec<Slot>,
    pub oldest_cid: u32,
    pub current_cid: u32,
}

impl ActiveTable {
    pub fn new(size: usize) -> ActiveTable {
        ActiveTable {
            slots: vec![Slot::default(); size.max(1)],
            oldest_cid: 0,
            current_cid: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn index_of(&self, cid: u32) -> usize {
        cid as usize % self.slots.len()
    }

    /// Number of custody ids in the live window.
    pub fn active(&self) -> u32 {
        self.current_cid - self.oldest_cid
    }

    pub fn in_window(&self, cid: u32) -> bool {
        self.oldest_cid <= cid && cid < self.current_cid
    }

    pub fn sid_at(&self, index: usize) -> Option<Sid> {
        self.slots[index].sid
    }

    pub fn last_retx_at(&self, index: usize) -> u64 {
        self.slots[index].last_retx_secs
    }

    pub fn occupy(&mut self, index: usize, sid: Sid) {
        self.slots[index].sid = Some(sid);
    }

    pub fn touch(&mut self, index: usize, now_secs: u64) {
        self.slots[index].last_retx_secs = now_secs;
    }

    /// Clear a slot, returning the storage id it held.
    pub fn vacate(&mut self, index: usize) -> Option<Sid> {
        self.slots[index].sid.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_accounting() {
        let mut table = ActiveTable::new(4);
        assert_eq!(table.active(), 0);

        for cid in 0..4u32 {
            let index = table.index_of(cid);
            assert!(table.sid_at(index).is_none());
            table.occupy(index, u64::from(cid) + 100);
            table.current_cid += 1;
        }
        assert_eq!(table.active(), 4);
        assert!(table.in_window(0));
        assert!(table.in_window(3));
        assert!(!table.in_window(4));

        // cid 4 maps onto the slot still held by cid 0
        assert_eq!(table.index_of(4), 0);
        assert_eq!(table.sid_at(0), Some(100));
    }

    #[test]
    fn test_vacate_and_reuse() {
        let mut table = ActiveTable::new(2);
        table.occupy(0, 7);
        table.touch(0, 55);
        assert_eq!(table.vacate(0), Some(7));
        assert_eq!(table.vacate(0), None);
        assert_eq!(table.last_retx_at(0), 55);
    }
}
