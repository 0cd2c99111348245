//! Custody transfer over the cache: duplicate detection, custody signal
//! generation toward the previous custodian, and ingress of the signals
//! other agents send back.

use crate::codec::v7::{
    Bundle, ControlFlags, CreationTimestamp, CrcType, CustodyAcceptRecord, CustodyTrackingBlock,
    Payload, PrimaryBlock,
};
use crate::eid::Eid;
use crc::{Crc, CRC_32_ISCSI};
use tracing::{debug, trace};

use super::entry::{CacheEntry, EntryFlags, EntryId, EntryState};
use super::state::CacheState;
use super::{DeliveryPolicy, Disposition};

/// Two salts keep the two lookup families apart in one hash index:
/// bundles are found by (flow, sequence), open custody signals by
/// (flow, previous custodian).
const HASH_SALT_DACS: u32 = 0x3126_c0cf;
const HASH_SALT_BUNDLE: u32 = 0x7739_ae76;

const HASH: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn bundle_hash(flow: Eid, sequence: u64) -> u32 {
    let mut digest = HASH.digest();
    digest.update(&flow.node.to_le_bytes());
    digest.update(&flow.service.to_le_bytes());
    digest.update(&sequence.to_le_bytes());
    digest.update(&HASH_SALT_BUNDLE.to_le_bytes());
    digest.finalize()
}

fn dacs_hash(flow: Eid, custodian: Eid) -> u32 {
    let mut digest = HASH.digest();
    digest.update(&flow.node.to_le_bytes());
    digest.update(&flow.service.to_le_bytes());
    digest.update(&custodian.node.to_le_bytes());
    digest.update(&custodian.service.to_le_bytes());
    digest.update(&HASH_SALT_DACS.to_le_bytes());
    digest.finalize()
}

/// Find a held data bundle by its source flow and sequence. Marks the
/// entry active: a hit means the entry is still relevant.
fn find_bundle(state: &mut CacheState, flow: Eid, sequence: u64) -> Option<EntryId> {
    let hash = bundle_hash(flow, sequence);
    let id = state.hash_bucket(hash).iter().copied().find(|&id| {
        state.entry(id).is_some_and(|entry| {
            entry.state != EntryState::GenerateDacs
                && entry.bundle.primary.source == flow
                && entry.bundle.primary.creation.sequence == sequence
        })
    })?;
    if let Some(entry) = state.entry_mut(id) {
        entry.flags |= EntryFlags::ACTIVITY;
    }
    Some(id)
}

/// Find the open custody signal toward `custodian` for `flow`.
fn find_open_dacs(state: &CacheState, flow: Eid, custodian: Eid) -> Option<EntryId> {
    let hash = dacs_hash(flow, custodian);
    state.hash_bucket(hash).iter().copied().find(|&id| {
        state.entry(id).is_some_and(|entry| {
            entry.state == EntryState::GenerateDacs
                && matches!(
                    &entry.bundle.payload,
                    Payload::CustodyAccept(rec) if rec.flow_source == flow
                )
                && entry.bundle.primary.dest == custodian
        })
    })
}

/// Open a custody signal bundle toward `custodian`. It stays appendable
/// until its action time passes or it fills up.
fn open_dacs(state: &mut CacheState, flow: Eid, custodian: Eid, now_ms: u64) -> EntryId {
    let bundle = Bundle {
        primary: PrimaryBlock {
            flags: ControlFlags::ADMIN_RECORD | ControlFlags::MUST_NOT_FRAGMENT,
            crc_type: CrcType::Crc16,
            dest: custodian,
            source: state.cfg.self_addr,
            report_to: state.cfg.self_addr,
            creation: CreationTimestamp {
                time_ms: now_ms,
                sequence: state.dacs_seq,
            },
            lifetime_ms: state.cfg.dacs_lifetime_ms,
        },
        custody: None,
        payload: Payload::CustodyAccept(CustodyAcceptRecord {
            flow_source: flow,
            sequences: Vec::new(),
        }),
    };
    state.dacs_seq += 1;

    let id = state.alloc(CacheEntry {
        bundle,
        policy: DeliveryPolicy::LocalAck,
        state: EntryState::GenerateDacs,
        flags: EntryFlags::LOCAL_CUSTODY | EntryFlags::ACTIVITY,
        action_time_ms: 0,
        dest_node: custodian.node,
        hash: Some(dacs_hash(flow, custodian)),
        time_key: None,
        in_dest_index: false,
        in_pending: false,
    });
    state.schedule_at(id, now_ms + state.cfg.dacs_open_ms);
    debug!(%custodian, %flow, "opened custody signal");
    id
}

/// Append one accepted sequence number to the open signal for
/// (`flow`, `custodian`), opening one if needed. A full signal is
/// finalized and queued immediately.
fn ack_custody(state: &mut CacheState, flow: Eid, custodian: Eid, sequence: u64, now_ms: u64) {
    let id = find_open_dacs(state, flow, custodian)
        .unwrap_or_else(|| open_dacs(state, flow, custodian, now_ms));

    let max = state.cfg.max_seq_per_payload;
    let Some(entry) = state.entry_mut(id) else {
        return;
    };
    let Payload::CustodyAccept(record) = &mut entry.bundle.payload else {
        return;
    };
    // duplicates happen when retransmits cross an unseen acknowledgment
    if !record.sequences.contains(&sequence) && record.sequences.len() < max {
        record.sequences.push(sequence);
    }
    let full = record.sequences.len() >= max;
    if full {
        finalize_dacs(state, id);
        state.make_pending(id, EntryFlags::empty(), EntryFlags::ACTION_TIME_WAIT);
    }
    trace!(%custodian, sequence, full, "custody acknowledged");
}

/// Close a custody signal for appending; from here on it is a normal
/// outbound bundle.
pub(crate) fn finalize_dacs(state: &mut CacheState, id: EntryId) {
    state.unhash(id);
    if let Some(entry) = state.entry_mut(id) {
        entry.state = EntryState::Idle;
    }
}

/// Store a data bundle, taking custody per `policy`. Duplicates are
/// re-acknowledged (the prior signal may have been lost) but not stored
/// again.
pub(crate) fn store_bundle(
    state: &mut CacheState,
    mut bundle: Bundle,
    policy: DeliveryPolicy,
    now_ms: u64,
) -> Disposition {
    let flow = bundle.primary.source;
    let sequence = bundle.primary.creation.sequence;
    let dest_node = bundle.primary.dest.node;

    if let Some(existing) = find_bundle(state, flow, sequence) {
        debug!(%flow, sequence, "duplicate bundle, re-acknowledging");
        if policy == DeliveryPolicy::CustodyTracking {
            if let Some(custody) = &bundle.custody {
                ack_custody(state, flow, custody.current_custodian, sequence, now_ms);
            }
        }
        return Disposition::Duplicate(existing);
    }

    let mut entry_policy = policy;
    if policy == DeliveryPolicy::CustodyTracking {
        let is_local = dest_node == state.cfg.self_addr.node;
        match &mut bundle.custody {
            Some(custody) => {
                // acknowledge toward the previous custodian, then take over
                ack_custody(state, flow, custody.current_custodian, sequence, now_ms);
                if is_local {
                    // last stop: only the local delivery agent has to accept
                    entry_policy = DeliveryPolicy::LocalAck;
                }
                custody.current_custodian = state.cfg.self_addr;
            }
            None if !is_local => {
                // first custodian of a locally generated bundle
                bundle.custody = Some(CustodyTrackingBlock {
                    current_custodian: state.cfg.self_addr,
                });
            }
            None => {}
        }
    }

    let id = state.alloc(CacheEntry {
        bundle,
        policy: entry_policy,
        state: EntryState::Idle,
        flags: EntryFlags::LOCAL_CUSTODY | EntryFlags::ACTIVITY,
        action_time_ms: 0,
        dest_node,
        hash: Some(bundle_hash(flow, sequence)),
        time_key: None,
        in_dest_index: true,
        in_pending: false,
    });
    state.make_pending(id, EntryFlags::empty(), EntryFlags::empty());
    Disposition::Stored(id)
}

/// Ingress of a custody signal from a downstream agent: every sequence it
/// names releases local custody of the matching held bundle.
pub(crate) fn consume_remote_dacs(state: &mut CacheState, bundle: &Bundle, _now_ms: u64) -> usize {
    let Some(record) = bundle.custody_accept() else {
        return 0;
    };
    let mut released = 0;
    for &sequence in &record.sequences {
        if let Some(id) = find_bundle(state, record.flow_source, sequence) {
            debug!(flow = %record.flow_source, sequence, "custody acknowledgment received");
            state.make_pending(id, EntryFlags::empty(), EntryFlags::LOCAL_CUSTODY);
            released += 1;
        }
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;

    #[test]
    fn test_hash_salts_disambiguate() {
        let flow = Eid::new(1, 1);
        // same tuple bytes, different salt family
        assert_ne!(bundle_hash(flow, 2), dacs_hash(flow, Eid::new(0, 2)));
    }

    #[test]
    fn test_open_dacs_sequence_numbers_advance() {
        let mut state = CacheState::new(CacheConfig::new(Eid::new(9, 64)));
        let a = open_dacs(&mut state, Eid::new(1, 1), Eid::new(2, 64), 1000);
        let b = open_dacs(&mut state, Eid::new(1, 1), Eid::new(3, 64), 1000);
        let seq_a = state.entry(a).unwrap().bundle.primary.creation.sequence;
        let seq_b = state.entry(b).unwrap().bundle.primary.creation.sequence;
        assert_eq!((seq_a, seq_b), (0, 1));
    }

    #[test]
    fn test_ack_custody_deduplicates_and_finalizes_when_full() {
        let mut cfg = CacheConfig::new(Eid::new(9, 64));
        cfg.max_seq_per_payload = 3;
        let mut state = CacheState::new(cfg);
        let flow = Eid::new(1, 1);
        let custodian = Eid::new(2, 64);

        ack_custody(&mut state, flow, custodian, 10, 1000);
        ack_custody(&mut state, flow, custodian, 10, 1000);
        ack_custody(&mut state, flow, custodian, 11, 1000);
        let id = find_open_dacs(&state, flow, custodian).unwrap();
        let Payload::CustodyAccept(rec) = &state.entry(id).unwrap().bundle.payload else {
            panic!("custody signal expected");
        };
        assert_eq!(rec.sequences, vec![10, 11]);

        ack_custody(&mut state, flow, custodian, 12, 1000);
        // full: finalized, no longer appendable
        assert_eq!(find_open_dacs(&state, flow, custodian), None);
        assert_eq!(state.entry(id).unwrap().state, EntryState::Idle);
    }
}
