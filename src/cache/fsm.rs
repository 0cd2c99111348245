//! The per-entry state machine and the events that drive it: the pending
//! list, the action-time poll, route-up sweeps, and the recycle event a
//! downstream queue fires when it lets go of a bundle reference.

use tracing::{debug, trace};

use super::custody::finalize_dacs;
use super::entry::{EntryFlags, EntryId, EntryState};
use super::state::CacheState;
use super::{DeliveryPolicy, EgressBundle};

/// Re-evaluate one entry. Runs with the entry already off the pending
/// list; every exit either re-indexes the entry somewhere or removes it.
pub(crate) fn execute(state: &mut CacheState, id: EntryId, now_ms: u64) {
    let Some(entry) = state.entry(id) else {
        return;
    };
    match entry.state {
        EntryState::Idle => run_idle(state, id, now_ms),
        EntryState::GenerateDacs => run_generate_dacs(state, id, now_ms),
        // waiting for the recycle event; nothing to evaluate
        EntryState::QueuedForEgress => {}
        EntryState::AwaitCustodyAck => run_await_ack(state, id, now_ms),
        EntryState::Expired => {
            debug!(%id, "expired entry removed");
            state.remove_entry(id);
        }
    }
}

/// Mark an entry expired; the next evaluation removes it.
fn expire(state: &mut CacheState, id: EntryId) {
    if let Some(entry) = state.entry_mut(id) {
        entry.state = EntryState::Expired;
    }
    state.make_pending(id, EntryFlags::empty(), EntryFlags::empty());
}

fn run_idle(state: &mut CacheState, id: EntryId, now_ms: u64) {
    let Some(entry) = state.entry(id) else {
        return;
    };
    if entry.bundle.is_expired(now_ms) {
        debug!(%id, "held bundle expired");
        expire(state, id);
        return;
    }
    if entry.flags.contains(EntryFlags::LOCALLY_QUEUED) {
        // a downstream queue still references the bundle; the recycle
        // event will bring the entry back here
        return;
    }
    if state.egress_open() {
        let Some(bundle) = state.egress_snapshot(id) else {
            return;
        };
        state.push_egress(EgressBundle { entry: id, bundle });
        if let Some(entry) = state.entry_mut(id) {
            entry.flags |= EntryFlags::LOCALLY_QUEUED;
            entry.state = EntryState::QueuedForEgress;
        }
        trace!(%id, "queued for egress");
    } else {
        // no egress capacity; try again shortly
        let retry = state.cfg.fast_retry_ms;
        state.schedule_at(id, now_ms + retry);
    }
}

fn run_generate_dacs(state: &mut CacheState, id: EntryId, now_ms: u64) {
    let Some(entry) = state.entry(id) else {
        return;
    };
    let open_expired = now_ms >= entry.action_time_ms;
    if open_expired {
        debug!(%id, "custody signal open window closed");
        finalize_dacs(state, id);
        run_idle(state, id, now_ms);
    } else {
        let when = entry.action_time_ms;
        state.schedule_at(id, when);
    }
}

fn run_await_ack(state: &mut CacheState, id: EntryId, now_ms: u64) {
    let Some(entry) = state.entry(id) else {
        return;
    };
    if !entry.flags.contains(EntryFlags::LOCAL_CUSTODY) {
        // a downstream custodian confirmed acceptance
        debug!(%id, "custody transferred, retiring entry");
        state.remove_entry(id);
        return;
    }
    if entry.bundle.is_expired(now_ms) {
        debug!(%id, "gave up on custody acknowledgment, bundle expired");
        expire(state, id);
        return;
    }
    if now_ms >= entry.action_time_ms {
        // acknowledgment overdue: back to idle for a retransmission
        if let Some(entry) = state.entry_mut(id) {
            entry.state = EntryState::Idle;
        }
        run_idle(state, id, now_ms);
    } else {
        let when = entry.action_time_ms;
        state.schedule_at(id, when);
    }
}

/// Drain the pending list through the state machine while the ingress
/// subqueue accepts work.
pub(crate) fn flush_pending(state: &mut CacheState, now_ms: u64) {
    while state.ingress_open() {
        let Some(id) = state.pending.pop_front() else {
            break;
        };
        if let Some(entry) = state.entry_mut(id) {
            entry.in_pending = false;
        }
        execute(state, id, now_ms);
    }
}

/// Action-time sweep: everything due by `now_ms` is re-evaluated.
pub(crate) fn poll(state: &mut CacheState, now_ms: u64) {
    state.collect_due(now_ms);
    flush_pending(state, now_ms);
}

/// A route toward `dest` came up: re-evaluate every entry whose
/// destination node masks to it.
pub(crate) fn route_up(state: &mut CacheState, dest: u32, mask: u32, now_ms: u64) {
    for id in state.route_matches(dest, mask) {
        state.make_pending(id, EntryFlags::empty(), EntryFlags::empty());
    }
    flush_pending(state, now_ms);
}

/// A downstream queue released its bundle reference. Custody-tracked
/// entries begin awaiting their acknowledgment; anything else goes back to
/// idle with a retry slot.
pub(crate) fn recycle(state: &mut CacheState, id: EntryId, now_ms: u64) {
    let (was_queued, tracks_custody, holds_custody) = {
        let Some(entry) = state.entry_mut(id) else {
            return;
        };
        entry.flags -= EntryFlags::LOCALLY_QUEUED;
        (
            entry.state == EntryState::QueuedForEgress,
            entry.policy == DeliveryPolicy::CustodyTracking,
            entry.flags.contains(EntryFlags::LOCAL_CUSTODY),
        )
    };

    if !was_queued {
        state.make_pending(id, EntryFlags::empty(), EntryFlags::empty());
        return;
    }
    if tracks_custody {
        if !holds_custody {
            // the acknowledgment arrived while the bundle sat in the queue
            debug!(%id, "custody transferred, retiring entry");
            state.remove_entry(id);
            return;
        }
        if let Some(entry) = state.entry_mut(id) {
            entry.state = EntryState::AwaitCustodyAck;
        }
        let when = now_ms + state.cfg.retx_interval_ms;
        state.schedule_at(id, when);
        trace!(%id, "awaiting custody acknowledgment");
    } else {
        // no acknowledgment to wait for: idle until the retry slot
        if let Some(entry) = state.entry_mut(id) {
            entry.state = EntryState::Idle;
            entry.flags -= EntryFlags::ACTIVITY;
        }
        let retry = state.cfg.fast_retry_ms;
        state.schedule_at(id, now_ms + retry);
        trace!(%id, "transmission handed off, idling for retry");
    }
}
