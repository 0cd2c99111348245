use crate::codec::v7::Bundle;
use bitflags::bitflags;
use std::fmt::{Display, Formatter};

use super::DeliveryPolicy;

/// Stable arena id of one cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) u64);

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Held; waiting for a route or a retry slot.
    Idle,
    /// An open custody signal accumulating sequence numbers.
    GenerateDacs,
    /// Handed to the convergence-layer egress queue.
    QueuedForEgress,
    /// Transmitted; awaiting the downstream custody acknowledgment.
    AwaitCustodyAck,
    /// Lifetime exceeded; removed on the next evaluation.
    Expired,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u8 {
        /// The entry was recently used; protects it from age-out.
        const ACTIVITY         = 0x01;
        /// This agent holds custody of the bundle.
        const LOCAL_CUSTODY    = 0x02;
        /// The entry sits in the action-time index.
        const ACTION_TIME_WAIT = 0x04;
        /// A downstream queue still holds a reference to the bundle.
        const LOCALLY_QUEUED   = 0x08;
    }
}

/// One retained bundle and its scheduling state.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub bundle: Bundle,
    pub policy: DeliveryPolicy,
    pub state: EntryState,
    pub flags: EntryFlags,
    /// Earliest time (ms) the state machine should look at this entry
    /// again; meaningful while `ACTION_TIME_WAIT` is set.
    pub action_time_ms: u64,
    /// Destination node, the key in the destination index.
    pub dest_node: u32,
    /// Key in the hash index, while indexed there.
    pub hash: Option<u32>,
    /// Key in the action-time index, while indexed there.
    pub time_key: Option<u64>,
    pub in_dest_index: bool,
    pub in_pending: bool,
}

impl CacheEntry {
    pub fn holds_custody(&self) -> bool {
        self.flags.contains(EntryFlags::LOCAL_CUSTODY)
    }
}
