//! The custody/cache subsystem: the storage plane of a v7 service.
//!
//! Retained bundles live in a refcounted arena of [`entry::CacheEntry`]
//! records indexed three ways: by destination node (for route-up sweeps),
//! by action time (for the poll-driven scheduler), and by a salted hash of
//! the bundle's source flow and sequence (for duplicate detection and
//! custody-signal lookup). A per-entry state machine decides when an entry
//! is handed to the convergence-layer egress queue, rescheduled for
//! retransmission, or retired after a downstream agent takes custody.
//!
//! The subsystem is synchronous and self-contained: the host drains
//! [`Cache::take_egress`], pushes inbound traffic through
//! [`Cache::insert`], and drives time with [`Cache::poll`].

mod custody;
mod entry;
mod fsm;
mod state;

pub use entry::{EntryFlags, EntryId, EntryState};

use crate::codec::v7::Bundle;
use crate::eid::Eid;
use crate::time::Clock;
use std::sync::{Arc, Mutex};

use state::CacheState;

/// How hard the agent works to get a bundle delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Best effort: send once and forget.
    None,
    /// Keep the bundle until the local delivery agent accepts it.
    LocalAck,
    /// Full custody transfer: keep and retransmit until a downstream
    /// custodian acknowledges through a custody signal.
    #[default]
    CustodyTracking,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Endpoint this storage service answers as (custody signals originate
    /// here).
    pub self_addr: Eid,
    /// How long a generated custody signal stays open for appending.
    pub dacs_open_ms: u64,
    /// Retry interval for entries that could not be queued for egress.
    pub fast_retry_ms: u64,
    /// How long to await a custody acknowledgment before retransmitting.
    pub retx_interval_ms: u64,
    /// Lifetime of generated custody signal bundles.
    pub dacs_lifetime_ms: u64,
    /// Sequence numbers per custody signal payload.
    pub max_seq_per_payload: usize,
    /// Depth limit of the ingress/egress subqueues while the interface is
    /// up.
    pub max_subq_depth: usize,
}

impl CacheConfig {
    pub fn new(self_addr: Eid) -> CacheConfig {
        CacheConfig {
            self_addr,
            dacs_open_ms: 10_000,
            fast_retry_ms: 3_000,
            retx_interval_ms: 10_000,
            dacs_lifetime_ms: 3_600_000,
            max_seq_per_payload: 16,
            max_subq_depth: 100,
        }
    }
}

/// What became of a bundle pushed into the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stored under a new cache entry.
    Stored(EntryId),
    /// Already held; re-acknowledged instead of stored again.
    Duplicate(EntryId),
    /// Was a custody signal; this many held bundles were released.
    SignalConsumed(usize),
}

/// A bundle handed to the convergence layer. Call [`Cache::recycle`] with
/// the entry id once the transmission attempt is over; that is what lets
/// the entry progress to awaiting its custody acknowledgment.
#[derive(Debug, Clone)]
pub struct EgressBundle {
    pub entry: EntryId,
    pub bundle: Arc<Bundle>,
}

pub struct Cache {
    inner: Mutex<CacheState>,
    clock: Arc<dyn Clock>,
}

impl Cache {
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Cache {
        Cache {
            inner: Mutex::new(CacheState::new(config)),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.inner.lock().expect("cache state poisoned")
    }

    /// Ingress: store a data bundle (taking custody per `policy`) or
    /// consume the custody signal it carries.
    pub fn insert(&self, bundle: Bundle, policy: DeliveryPolicy) -> Disposition {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        if bundle.custody_accept().is_some() {
            let released = custody::consume_remote_dacs(&mut state, &bundle, now);
            fsm::flush_pending(&mut state, now);
            return Disposition::SignalConsumed(released);
        }
        let disposition = custody::store_bundle(&mut state, bundle, policy, now);
        fsm::flush_pending(&mut state, now);
        disposition
    }

    /// Sweep the action-time index up to now and re-evaluate everything
    /// that came due.
    pub fn poll(&self) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        fsm::poll(&mut state, now);
    }

    /// A route toward `dest` (under `mask`) became available: re-evaluate
    /// every held bundle whose destination matches.
    pub fn route_up(&self, dest: u32, mask: u32) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        fsm::route_up(&mut state, dest, mask, now);
    }

    /// Interface state change: open (or close) the ingress/egress
    /// subqueues.
    pub fn intf_state_change(&self, up: bool) {
        let mut state = self.lock();
        state.set_depth_limits(up);
    }

    /// Drain the bundles currently queued for egress.
    pub fn take_egress(&self) -> Vec<EgressBundle> {
        self.lock().take_egress()
    }

    /// The convergence layer is done with an egress reference. The entry
    /// re-enters the state machine: custody-tracked entries start awaiting
    /// their acknowledgment, everything else goes back to idle with a
    /// retry slot.
    pub fn recycle(&self, entry: EntryId) {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        fsm::recycle(&mut state, entry, now);
        fsm::flush_pending(&mut state, now);
    }

    /// Number of held entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of entries this agent still holds custody of.
    pub fn custody_count(&self) -> usize {
        self.lock().custody_count()
    }
}
