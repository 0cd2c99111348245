//! The pluggable storage plane the engine stores bundles through.
//!
//! A store is a durable FIFO of byte records. `dequeue` removes a record
//! from the queue but the record stays addressable through its storage id
//! until `relinquish` - that is what lets the engine hold custody-bearing
//! bundles for retransmission after they were first loaded.
//!
//! Timeout semantics are uniform across operations: [`Timeout::Poll`] never
//! blocks, [`Timeout::Block`] waits indefinitely, [`Timeout::After`] waits
//! up to the given duration. An exhausted dequeue timeout is not an error;
//! it reports "nothing there" as `Ok(None)`.

use crate::error::{BpError, BpResult};
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[cfg(test)]
use mockall::automock;

/// Storage id: addresses one record while it has not been relinquished.
pub type Sid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block.
    Poll,
    /// Wait indefinitely.
    Block,
    /// Wait at most this long.
    After(Duration),
}

impl Timeout {
    pub fn from_secs(secs: u64) -> Timeout {
        Timeout::After(Duration::from_secs(secs))
    }
}

/// One durable FIFO byte-queue. Dropping the handle releases the queue and
/// discards its contents.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleStore: Send + Sync {
    /// Atomically append `header ‖ body` as one record.
    async fn enqueue(&self, header: &[u8], body: &[u8], timeout: Timeout) -> BpResult<()>;

    /// Remove the head record from the queue. The returned storage id stays
    /// valid for `retrieve` until the record is relinquished.
    async fn dequeue(&self, timeout: Timeout) -> BpResult<Option<(Bytes, Sid)>>;

    /// Random-access read of a not-yet-relinquished record.
    async fn retrieve(&self, sid: Sid) -> BpResult<Bytes>;

    /// Release a record; its storage id becomes invalid.
    fn relinquish(&self, sid: Sid);

    /// Number of records currently queued (statistics only).
    fn count(&self) -> u64;
}

/// Allocates stores; a channel asks for three (data, payload, signals).
pub trait StorageService: Send + Sync {
    fn create(&self) -> BpResult<Arc<dyn BundleStore>>;
}

/// In-memory storage service: the reference implementation and the test
/// double of choice.
#[derive(Debug, Clone)]
pub struct MemoryStorageService {
    pub max_records: usize,
}

impl Default for MemoryStorageService {
    fn default() -> Self {
        MemoryStorageService { max_records: 1024 }
    }
}

impl StorageService for MemoryStorageService {
    fn create(&self) -> BpResult<Arc<dyn BundleStore>> {
        Ok(Arc::new(MemoryStore::new(self.max_records)))
    }
}

struct MemoryStoreInner {
    queue: VecDeque<Sid>,
    records: FxHashMap<Sid, Bytes>,
    next_sid: Sid,
}

pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl MemoryStore {
    pub fn new(capacity: usize) -> MemoryStore {
        MemoryStore {
            inner: Mutex::new(MemoryStoreInner {
                queue: VecDeque::new(),
                records: FxHashMap::default(),
                // storage id 0 is reserved as "vacant" by convention
                next_sid: 1,
            }),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().expect("memory store poisoned")
    }
}

/// Run one bounded wait step of a poll loop. Returns false when the caller
/// should give up.
async fn wait_step(notify: &Notify, timeout: Timeout, deadline: Option<tokio::time::Instant>) -> bool {
    match (timeout, deadline) {
        (Timeout::Poll, _) => false,
        (Timeout::Block, _) => {
            notify.notified().await;
            true
        }
        (Timeout::After(_), Some(deadline)) => {
            tokio::time::timeout_at(deadline, notify.notified()).await.is_ok()
        }
        (Timeout::After(_), None) => false,
    }
}

fn deadline_of(timeout: Timeout) -> Option<tokio::time::Instant> {
    match timeout {
        Timeout::After(d) => Some(tokio::time::Instant::now() + d),
        _ => None,
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn enqueue(&self, header: &[u8], body: &[u8], timeout: Timeout) -> BpResult<()> {
        let deadline = deadline_of(timeout);
        loop {
            {
                let mut inner = self.lock();
                if inner.records.len() < self.capacity {
                    let sid = inner.next_sid;
                    inner.next_sid += 1;
                    let mut record = Vec::with_capacity(header.len() + body.len());
                    record.extend_from_slice(header);
                    record.extend_from_slice(body);
                    inner.records.insert(sid, Bytes::from(record));
                    inner.queue.push_back(sid);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            if !wait_step(&self.writable, timeout, deadline).await {
                return Err(BpError::Timeout);
            }
        }
    }

    async fn dequeue(&self, timeout: Timeout) -> BpResult<Option<(Bytes, Sid)>> {
        let deadline = deadline_of(timeout);
        loop {
            {
                let mut inner = self.lock();
                if let Some(sid) = inner.queue.pop_front() {
                    let record = inner
                        .records
                        .get(&sid)
                        .cloned()
                        .ok_or(BpError::FailedStore("dequeued record vanished"))?;
                    return Ok(Some((record, sid)));
                }
            }
            if !wait_step(&self.readable, timeout, deadline).await {
                return Ok(None);
            }
        }
    }

    async fn retrieve(&self, sid: Sid) -> BpResult<Bytes> {
        self.lock()
            .records
            .get(&sid)
            .cloned()
            .ok_or(BpError::FailedStore("unknown storage id"))
    }

    fn relinquish(&self, sid: Sid) {
        let removed = self.lock().records.remove(&sid);
        if removed.is_some() {
            self.writable.notify_one();
        }
    }

    fn count(&self) -> u64 {
        self.lock().queue.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(capacity: usize) -> MemoryStore {
        MemoryStore::new(capacity)
    }

    #[tokio::test]
    async fn test_fifo_order_and_record_layout() {
        let store = store(8);
        store.enqueue(b"h1", b"b1", Timeout::Poll).await.unwrap();
        store.enqueue(b"h2", b"b2", Timeout::Poll).await.unwrap();
        assert_eq!(store.count(), 2);

        let (first, _) = store.dequeue(Timeout::Poll).await.unwrap().unwrap();
        assert_eq!(&first[..], b"h1b1");
        let (second, _) = store.dequeue(Timeout::Poll).await.unwrap().unwrap();
        assert_eq!(&second[..], b"h2b2");
        assert_eq!(store.dequeue(Timeout::Poll).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_records_survive_dequeue_until_relinquished() {
        let store = store(8);
        store.enqueue(b"keep", b"!", Timeout::Poll).await.unwrap();
        let (_, sid) = store.dequeue(Timeout::Poll).await.unwrap().unwrap();
        assert_eq!(store.count(), 0);

        assert_eq!(&store.retrieve(sid).await.unwrap()[..], b"keep!");
        store.relinquish(sid);
        assert_eq!(
            store.retrieve(sid).await,
            Err(BpError::FailedStore("unknown storage id"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_dequeue_times_out() {
        let store = store(8);
        let result = store
            .dequeue(Timeout::After(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_blocks_until_space() {
        let store = Arc::new(store(1));
        store.enqueue(b"a", b"", Timeout::Poll).await.unwrap();
        assert_eq!(
            store.enqueue(b"b", b"", Timeout::Poll).await,
            Err(BpError::Timeout)
        );

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .enqueue(b"b", b"", Timeout::After(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (_, sid) = store.dequeue(Timeout::Poll).await.unwrap().unwrap();
        store.relinquish(sid);
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let store = Arc::new(store(8));
        let reader = {
            let store = store.clone();
            tokio::spawn(async move { store.dequeue(Timeout::Block).await })
        };
        tokio::task::yield_now().await;

        store.enqueue(b"x", b"y", Timeout::Poll).await.unwrap();
        let (record, _) = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(&record[..], b"xy");
    }
}
