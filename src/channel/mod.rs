//! Message channel interface between the emitter and the ledger consumer.
//!
//! Events are published under a partition key (the account id). Every key
//! maps to exactly one partition, which is what keeps one account's events
//! in order. Delivery is at-least-once: a subscription resumes from the last
//! committed offset, so anything delivered but not committed comes back.

use async_trait::async_trait;
use std::hash::{DefaultHasher, Hash, Hasher};
use thiserror::Error;

mod memory;
pub use memory::InMemoryChannel;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("channel closed")]
    Closed,

    #[error("unknown partition {0}")]
    UnknownPartition(usize),
}

impl ChannelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Unavailable(_))
    }
}

/// Position of a delivered message, handed back to [`MessageChannel::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitHandle {
    pub partition: usize,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub key: String,
    pub payload: Vec<u8>,
    pub handle: CommitHandle,
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    fn partitions(&self) -> usize;

    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Open a subscription starting at the partition's committed offset.
    async fn subscribe(&self, partition: usize) -> Result<Box<dyn Subscription>, ChannelError>;

    /// Mark everything up to and including `handle` as consumed.
    async fn commit(&self, handle: CommitHandle) -> Result<(), ChannelError>;
}

/// Lazy, unbounded stream of deliveries from one partition.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. Cancel-safe: dropping the future loses nothing.
    async fn next(&mut self) -> Result<Delivery, ChannelError>;
}

/// Stable mapping of a partition key onto `partitions` buckets.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}
