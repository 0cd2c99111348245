use std::sync::atomic::{AtomicU64, Ordering};

/// Latched channel statistics. All counters are monotonic except `active`,
/// which is the live custody id window width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Records currently in the data store.
    pub bundles: u64,
    /// Records currently in the payload store.
    pub payloads: u64,
    /// Records currently in the custody signal store.
    pub records: u64,
    pub generated: u64,
    pub transmitted: u64,
    pub retransmitted: u64,
    pub received: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub expired: u64,
    pub lost: u64,
    pub active: u64,
}

/// Per-counter atomics so concurrent engine calls never tear an update.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub generated: AtomicU64,
    pub transmitted: AtomicU64,
    pub retransmitted: AtomicU64,
    pub received: AtomicU64,
    pub delivered: AtomicU64,
    pub acknowledged: AtomicU64,
    pub expired: AtomicU64,
    pub lost: AtomicU64,
    pub active: AtomicU64,
}

impl Counters {
    pub fn latch(&self, bundles: u64, payloads: u64, records: u64) -> ChannelStats {
        ChannelStats {
            bundles,
            payloads,
            records,
            generated: self.generated.load(Ordering::Relaxed),
            transmitted: self.transmitted.load(Ordering::Relaxed),
            retransmitted: self.retransmitted.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }
}

/// Increment a counter by one.
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn add(counter: &AtomicU64, amount: u64) {
    counter.fetch_add(amount, Ordering::Relaxed);
}

pub(crate) fn set(counter: &AtomicU64, value: u64) {
    counter.store(value, Ordering::Relaxed);
}
