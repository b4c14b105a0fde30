//! Partitioned in-process log with committed offsets.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::debug;

use super::{ChannelError, CommitHandle, Delivery, MessageChannel, Subscription, partition_for};

#[derive(Debug, Clone)]
struct Record {
    key: String,
    payload: Vec<u8>,
}

#[derive(Debug)]
struct Partition {
    log: Mutex<Vec<Record>>,
    committed: AtomicU64,
    /// Current log length, watched by subscriptions waiting for new records.
    len_tx: watch::Sender<u64>,
}

impl Partition {
    fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            log: Mutex::new(Vec::new()),
            committed: AtomicU64::new(0),
            len_tx,
        }
    }

    fn append(&self, record: Record) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.push(record);
        // published under the lock so the watched length never goes backwards
        self.len_tx.send_replace(log.len() as u64);
    }

    fn get(&self, offset: u64) -> Option<Record> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.get(offset as usize).cloned()
    }

    fn len(&self) -> u64 {
        *self.len_tx.borrow()
    }
}

/// In-memory [`MessageChannel`] with an outage switch.
#[derive(Debug)]
pub struct InMemoryChannel {
    partitions: Vec<Arc<Partition>>,
    online: AtomicBool,
}

impl InMemoryChannel {
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: (0..partitions.max(1))
                .map(|_| Arc::new(Partition::new()))
                .collect(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate a broker outage: publishes fail while offline.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Messages published but not yet committed, across all partitions.
    pub fn lag(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.len().saturating_sub(p.committed.load(Ordering::SeqCst)))
            .sum()
    }

    /// Total messages ever published.
    pub fn published(&self) -> u64 {
        self.partitions.iter().map(|p| p.len()).sum()
    }

    fn partition(&self, index: usize) -> Result<&Arc<Partition>, ChannelError> {
        self.partitions
            .get(index)
            .ok_or(ChannelError::UnknownPartition(index))
    }
}

#[async_trait]
impl MessageChannel for InMemoryChannel {
    fn partitions(&self) -> usize {
        self.partitions.len()
    }

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("broker offline".to_string()));
        }
        let index = partition_for(key, self.partitions.len());
        self.partition(index)?.append(Record {
            key: key.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, partition: usize) -> Result<Box<dyn Subscription>, ChannelError> {
        let log = Arc::clone(self.partition(partition)?);
        let cursor = log.committed.load(Ordering::SeqCst);
        debug!(partition, cursor, "subscribed");
        Ok(Box::new(MemorySubscription {
            index: partition,
            cursor,
            len_rx: log.len_tx.subscribe(),
            log,
        }))
    }

    async fn commit(&self, handle: CommitHandle) -> Result<(), ChannelError> {
        let log = self.partition(handle.partition)?;
        log.committed.fetch_max(handle.offset + 1, Ordering::SeqCst);
        Ok(())
    }
}

struct MemorySubscription {
    index: usize,
    cursor: u64,
    log: Arc<Partition>,
    len_rx: watch::Receiver<u64>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Delivery, ChannelError> {
        loop {
            let len = *self.len_rx.borrow_and_update();
            if self.cursor < len {
                let record = self
                    .log
                    .get(self.cursor)
                    .ok_or(ChannelError::UnknownPartition(self.index))?;
                let handle = CommitHandle {
                    partition: self.index,
                    offset: self.cursor,
                };
                self.cursor += 1;
                return Ok(Delivery {
                    key: record.key,
                    payload: record.payload,
                    handle,
                });
            }
            self.len_rx
                .changed()
                .await
                .map_err(|_| ChannelError::Closed)?;
        }
    }
}
