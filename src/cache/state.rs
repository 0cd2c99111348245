use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

use super::entry::{CacheEntry, EntryFlags, EntryId};
use super::{CacheConfig, EgressBundle};

/// The arena of cache entries and the three indices over it.
///
/// Index maintenance is centralized here so an entry can never be left
/// behind in an index it no longer belongs to: every mutation goes through
/// `schedule_at` / `unschedule` / `unhash` / `remove_entry`.
pub(crate) struct CacheState {
    pub cfg: CacheConfig,

    entries: FxHashMap<EntryId, CacheEntry>,
    next_id: u64,

    /// action time (ms) -> entries due then
    time_index: BTreeMap<u64, Vec<EntryId>>,
    /// destination node -> entries headed there
    dest_index: BTreeMap<u32, Vec<EntryId>>,
    /// salted flow hash -> collision list
    hash_index: BTreeMap<u32, Vec<EntryId>>,

    pub pending: VecDeque<EntryId>,
    egress: VecDeque<EgressBundle>,

    pub ingress_depth_limit: usize,
    pub egress_depth_limit: usize,

    /// Creation sequence for generated custody signal bundles.
    pub dacs_seq: u64,
}

fn unlink(list: &mut Vec<EntryId>, id: EntryId) {
    list.retain(|&other| other != id);
}

impl CacheState {
    pub fn new(cfg: CacheConfig) -> CacheState {
        CacheState {
            cfg,
            entries: FxHashMap::default(),
            next_id: 1,
            time_index: BTreeMap::new(),
            dest_index: BTreeMap::new(),
            hash_index: BTreeMap::new(),
            pending: VecDeque::new(),
            egress: VecDeque::new(),
            ingress_depth_limit: 0,
            egress_depth_limit: 0,
            dacs_seq: 0,
        }
    }

    pub fn set_depth_limits(&mut self, up: bool) {
        let limit = if up { self.cfg.max_subq_depth } else { 0 };
        self.ingress_depth_limit = limit;
        self.egress_depth_limit = limit;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn custody_count(&self) -> usize {
        self.entries.values().filter(|e| e.holds_custody()).count()
    }

    pub fn entry(&self, id: EntryId) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: EntryId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&id)
    }

    /// Allocate an entry and link it into the destination index.
    pub fn alloc(&mut self, mut entry: CacheEntry) -> EntryId {
        let id = EntryId(self.next_id);
        self.next_id += 1;
        if entry.in_dest_index {
            self.dest_index.entry(entry.dest_node).or_default().push(id);
        }
        if let Some(hash) = entry.hash {
            self.hash_index.entry(hash).or_default().push(id);
        }
        entry.time_key = None;
        trace!(%id, dest = entry.dest_node, "cache entry allocated");
        self.entries.insert(id, entry);
        id
    }

    /// Entries hashed to `hash`, in collision-list order.
    pub fn hash_bucket(&self, hash: u32) -> &[EntryId] {
        self.hash_index.get(&hash).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Remove the entry from the hash index (custody signals do this when
    /// they are finalized so nothing more can be appended).
    pub fn unhash(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if let Some(hash) = entry.hash.take() {
            if let Some(bucket) = self.hash_index.get_mut(&hash) {
                unlink(bucket, id);
                if bucket.is_empty() {
                    self.hash_index.remove(&hash);
                }
            }
        }
    }

    /// Put the entry into the action-time index at `when_ms`.
    pub fn schedule_at(&mut self, id: EntryId, when_ms: u64) {
        self.unschedule(id);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.action_time_ms = when_ms;
        entry.time_key = Some(when_ms);
        entry.flags |= EntryFlags::ACTION_TIME_WAIT;
        self.time_index.entry(when_ms).or_default().push(id);
    }

    pub fn unschedule(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.flags -= EntryFlags::ACTION_TIME_WAIT;
        if let Some(key) = entry.time_key.take() {
            if let Some(bucket) = self.time_index.get_mut(&key) {
                unlink(bucket, id);
                if bucket.is_empty() {
                    self.time_index.remove(&key);
                }
            }
        }
    }

    /// Move an entry to the pending list for re-evaluation, updating its
    /// flags along the way.
    pub fn make_pending(&mut self, id: EntryId, set: EntryFlags, clear: EntryFlags) {
        self.unschedule(id);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.flags |= set;
        entry.flags -= clear;
        if !entry.in_pending {
            entry.in_pending = true;
            self.pending.push_back(id);
        }
    }

    /// Drain the action-time index up to `now_ms` into the pending list.
    pub fn collect_due(&mut self, now_ms: u64) {
        let due: Vec<EntryId> = self
            .time_index
            .range(..=now_ms)
            .flat_map(|(_, bucket)| bucket.iter().copied())
            .collect();
        for id in due {
            self.make_pending(id, EntryFlags::empty(), EntryFlags::empty());
        }
    }

    /// Entries whose destination node masks to `dest`, scanning the
    /// destination index upward from `dest`.
    pub fn route_matches(&self, dest: u32, mask: u32) -> Vec<EntryId> {
        let mut matches = Vec::new();
        for (&node, bucket) in self.dest_index.range(dest..) {
            if node & mask != dest {
                break;
            }
            matches.extend(bucket.iter().copied());
        }
        matches
    }

    pub fn egress_open(&self) -> bool {
        self.egress_depth_limit > 0 && self.egress.len() < self.egress_depth_limit
    }

    pub fn ingress_open(&self) -> bool {
        self.ingress_depth_limit > 0
    }

    pub fn push_egress(&mut self, item: EgressBundle) {
        self.egress.push_back(item);
    }

    pub fn take_egress(&mut self) -> Vec<EgressBundle> {
        self.egress.drain(..).collect()
    }

    /// Unlink the entry from every index and drop it, releasing the bundle.
    pub fn remove_entry(&mut self, id: EntryId) {
        self.unschedule(id);
        self.unhash(id);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if entry.in_dest_index {
            entry.in_dest_index = false;
            let dest = entry.dest_node;
            if let Some(bucket) = self.dest_index.get_mut(&dest) {
                unlink(bucket, id);
                if bucket.is_empty() {
                    self.dest_index.remove(&dest);
                }
            }
        }
        if entry.in_pending {
            self.pending.retain(|&other| other != id);
        }
        trace!(%id, "cache entry removed");
        self.entries.remove(&id);
    }

    /// Clone the entry's bundle for an egress handoff.
    pub fn egress_snapshot(&self, id: EntryId) -> Option<Arc<crate::codec::v7::Bundle>> {
        self.entries.get(&id).map(|e| Arc::new(e.bundle.clone()))
    }
}
