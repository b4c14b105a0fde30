//! Drains the message channel into the ledger store.
//!
//! One worker per partition processes deliveries sequentially, so the ledger
//! sees an account's events in publish order. A delivery is committed only
//! after its ledger insert is confirmed (or it was dead-lettered); a worker
//! that stops mid-delivery leaves it uncommitted for redelivery.

use chrono::{DateTime, Utc};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{ConsumeError, SchemaError};
use crate::channel::{ChannelError, CommitHandle, Delivery, MessageChannel};
use crate::model::{LedgerEntry, TransactionEvent};
use crate::retry::RetryPolicy;
use crate::store::{InsertOutcome, LedgerStore, StoreError, with_timeout};

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    /// The ledger already had an entry with this idempotency key.
    Duplicate,
    DeadLettered,
}

/// A payload removed from the main path because it failed schema validation.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub key: String,
    pub payload: Vec<u8>,
    pub reason: String,
    pub handle: CommitHandle,
    pub at: DateTime<Utc>,
}

/// Side channel collecting poison messages.
#[derive(Debug, Default)]
pub struct DeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl DeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, delivery: &Delivery, reason: &SchemaError) {
        error!(
            key = %delivery.key,
            partition = delivery.handle.partition,
            offset = delivery.handle.offset,
            reason = %reason,
            "event dead-lettered"
        );
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter {
                key: delivery.key.clone(),
                payload: delivery.payload.clone(),
                reason: reason.to_string(),
                handle: delivery.handle,
                at: Utc::now(),
            });
    }

    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct LedgerConsumer {
    channel: Arc<dyn MessageChannel>,
    ledger: Arc<dyn LedgerStore>,
    dead_letters: Arc<DeadLetters>,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl LedgerConsumer {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        ledger: Arc<dyn LedgerStore>,
        dead_letters: Arc<DeadLetters>,
        retry: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            ledger,
            dead_letters,
            retry,
            store_timeout,
        }
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetters> {
        &self.dead_letters
    }

    /// Start one worker per channel partition.
    pub fn spawn(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<Result<(), ConsumeError>>> {
        (0..self.channel.partitions())
            .map(|partition| {
                let consumer = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { consumer.run_partition(partition, shutdown).await })
            })
            .collect()
    }

    /// Consume one partition until `shutdown` fires.
    ///
    /// Transient channel and store failures never end the worker: inserts and
    /// commits are retried with backoff, and a failed subscription is dropped
    /// and reopened at the committed offset. Only shutdown or a permanent
    /// error returns.
    pub async fn run_partition(
        &self,
        partition: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConsumeError> {
        info!(partition, "ledger consumer started");
        let mut resubscribes = 0;

        'subscribe: loop {
            let subscribed = self
                .persist(partition, "subscribe", &mut shutdown, ChannelError::is_transient, || {
                    self.channel.subscribe(partition)
                })
                .await?;
            let Some(mut subscription) = subscribed else {
                break;
            };

            loop {
                let stopping = *shutdown.borrow();
                if stopping {
                    break 'subscribe;
                }

                let next = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break 'subscribe,
                    next = subscription.next() => next,
                };
                let delivery = match next {
                    Ok(delivery) => {
                        resubscribes = 0;
                        delivery
                    }
                    Err(e) if e.is_transient() => {
                        resubscribes += 1;
                        let delay = self.retry.backoff(resubscribes);
                        warn!(
                            partition,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "subscription failed, resubscribing"
                        );
                        if !pause(delay, &mut shutdown).await {
                            break 'subscribe;
                        }
                        continue 'subscribe;
                    }
                    Err(e) => return Err(e.into()),
                };

                let handle = delivery.handle;
                let applied = self
                    .persist(partition, "ledger insert", &mut shutdown, StoreError::is_transient, || {
                        self.apply(&delivery)
                    })
                    .await?;
                // shutdown during backoff; leave uncommitted for redelivery
                let Some(applied) = applied else {
                    break 'subscribe;
                };

                let committed = self
                    .persist(partition, "commit", &mut shutdown, ChannelError::is_transient, || {
                        self.channel.commit(handle)
                    })
                    .await?;
                if committed.is_none() {
                    break 'subscribe;
                }
                debug!(partition, offset = handle.offset, ?applied, "delivery committed");
            }
        }

        info!(partition, "ledger consumer stopped");
        Ok(())
    }

    /// Run `op` until it succeeds, fails permanently, or `shutdown` fires.
    ///
    /// The ledger path never gives up on a transient failure, so the policy's
    /// `max_attempts` is ignored here and only its backoff is used. Returns
    /// `Ok(None)` on shutdown.
    async fn persist<T, E, F, Fut>(
        &self,
        partition: usize,
        what: &str,
        shutdown: &mut watch::Receiver<bool>,
        is_transient: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<Option<T>, E>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if is_transient(&e) => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        partition,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{what} failed, retrying"
                    );
                    if !pause(delay, shutdown).await {
                        return Ok(None);
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    error!(partition, attempt, error = %e, "{what} failed permanently");
                    return Err(e);
                }
            }
        }
    }

    /// Single attempt at turning a delivery into a ledger entry.
    pub async fn apply(&self, delivery: &Delivery) -> Result<Applied, StoreError> {
        let event = match TransactionEvent::decode(&delivery.payload) {
            Ok(event) => event,
            Err(reason) => {
                self.dead_letters.record(delivery, &reason);
                return Ok(Applied::DeadLettered);
            }
        };

        let key = event.idempotency_key;
        if with_timeout(self.store_timeout, self.ledger.contains(key)).await? {
            debug!(key = %key, "duplicate delivery discarded");
            return Ok(Applied::Duplicate);
        }

        let entry = LedgerEntry::new(event);
        let account = entry.account_id();
        match with_timeout(self.store_timeout, self.ledger.insert_if_absent(entry)).await? {
            InsertOutcome::Inserted => {
                info!(account = %account, key = %key, "ledger entry appended");
                Ok(Applied::Inserted)
            }
            InsertOutcome::Duplicate => {
                debug!(key = %key, "duplicate delivery discarded");
                Ok(Applied::Duplicate)
            }
        }
    }
}

/// Sleep for `delay`; false if shutdown was signalled first.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::channel::InMemoryChannel;
    use crate::model::{Account, TxKind};
    use crate::channel::Subscription;
    use crate::store::InMemoryLedgerStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Channel that rejects the first few commits and subscription reads.
    struct FlakyChannel {
        inner: Arc<InMemoryChannel>,
        commit_failures: AtomicUsize,
        next_failures: Arc<AtomicUsize>,
    }

    impl FlakyChannel {
        fn new(inner: Arc<InMemoryChannel>, commit_failures: usize, next_failures: usize) -> Self {
            Self {
                inner,
                commit_failures: AtomicUsize::new(commit_failures),
                next_failures: Arc::new(AtomicUsize::new(next_failures)),
            }
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    struct FlakySubscription {
        inner: Box<dyn Subscription>,
        failures: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Subscription for FlakySubscription {
        async fn next(&mut self) -> Result<Delivery, ChannelError> {
            if take_failure(&self.failures) {
                return Err(ChannelError::Unavailable("read rejected".to_string()));
            }
            self.inner.next().await
        }
    }

    #[async_trait]
    impl MessageChannel for FlakyChannel {
        fn partitions(&self) -> usize {
            self.inner.partitions()
        }

        async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
            self.inner.publish(key, payload).await
        }

        async fn subscribe(&self, partition: usize) -> Result<Box<dyn Subscription>, ChannelError> {
            Ok(Box::new(FlakySubscription {
                inner: self.inner.subscribe(partition).await?,
                failures: Arc::clone(&self.next_failures),
            }))
        }

        async fn commit(&self, handle: CommitHandle) -> Result<(), ChannelError> {
            if take_failure(&self.commit_failures) {
                return Err(ChannelError::Unavailable("commit rejected".to_string()));
            }
            self.inner.commit(handle).await
        }
    }

    struct Fixture {
        channel: Arc<InMemoryChannel>,
        ledger: Arc<InMemoryLedgerStore>,
        consumer: Arc<LedgerConsumer>,
    }

    fn fixture() -> Fixture {
        let channel = Arc::new(InMemoryChannel::new(2));
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let consumer = Arc::new(LedgerConsumer::new(
            channel.clone(),
            ledger.clone(),
            Arc::new(DeadLetters::new()),
            RetryPolicy::unbounded(1, 5),
            Duration::from_secs(1),
        ));
        Fixture {
            channel,
            ledger,
            consumer,
        }
    }

    fn event(account: &Account) -> TransactionEvent {
        let mut account = account.clone();
        account.version += 1;
        TransactionEvent::accepted(&account, TxKind::Deposit, Amount::from_scaled(10))
    }

    async fn publish(channel: &InMemoryChannel, event: &TransactionEvent) {
        channel
            .publish(&event.account_id.to_string(), event.encode().unwrap())
            .await
            .unwrap();
    }

    async fn wait_for_lag_zero(channel: &InMemoryChannel) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while channel.lag() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel drained");
    }

    fn delivery(payload: Vec<u8>) -> Delivery {
        Delivery {
            key: "k".to_string(),
            payload,
            handle: CommitHandle {
                partition: 0,
                offset: 0,
            },
        }
    }

    #[tokio::test]
    async fn apply_inserts_once() {
        let f = fixture();
        let alice = Account::new("alice", Amount::ZERO);
        let d = delivery(event(&alice).encode().unwrap());

        assert_eq!(f.consumer.apply(&d).await.unwrap(), Applied::Inserted);
        assert_eq!(f.consumer.apply(&d).await.unwrap(), Applied::Duplicate);
        assert_eq!(f.ledger.len(), 1);
    }

    #[tokio::test]
    async fn apply_dead_letters_malformed_payload() {
        let f = fixture();
        let d = delivery(b"{not an event".to_vec());

        assert_eq!(f.consumer.apply(&d).await.unwrap(), Applied::DeadLettered);
        assert!(f.ledger.is_empty());
        let letters = f.consumer.dead_letters().snapshot();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, b"{not an event");
    }

    #[tokio::test]
    async fn apply_surfaces_store_failure() {
        let f = fixture();
        f.ledger.set_online(false);
        let alice = Account::new("alice", Amount::ZERO);
        let d = delivery(event(&alice).encode().unwrap());

        assert!(matches!(
            f.consumer.apply(&d).await,
            Err(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn redelivered_event_yields_one_entry() {
        let f = fixture();
        let alice = Account::new("alice", Amount::ZERO);
        let e = event(&alice);
        for _ in 0..5 {
            publish(&f.channel, &e).await;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = f.consumer.spawn(shutdown_rx);
        wait_for_lag_zero(&f.channel).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }

        let entries = f.ledger.query_by_account(alice.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key(), e.idempotency_key);
    }

    #[tokio::test]
    async fn poison_message_does_not_stall_partition() {
        let f = fixture();
        let alice = Account::new("alice", Amount::ZERO);
        let key = alice.id.to_string();
        f.channel.publish(&key, b"garbage".to_vec()).await.unwrap();
        let good = event(&alice);
        publish(&f.channel, &good).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = f.consumer.spawn(shutdown_rx);
        wait_for_lag_zero(&f.channel).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }

        assert_eq!(f.consumer.dead_letters().len(), 1);
        assert_eq!(f.ledger.query_by_account(alice.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_failures_are_retried_without_commit() {
        let f = fixture();
        let alice = Account::new("alice", Amount::ZERO);
        publish(&f.channel, &event(&alice)).await;
        f.ledger.fail_next(3);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = f.consumer.spawn(shutdown_rx);
        wait_for_lag_zero(&f.channel).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }

        assert_eq!(f.ledger.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_during_outage_leaves_event_uncommitted() {
        let f = fixture();
        let alice = Account::new("alice", Amount::ZERO);
        publish(&f.channel, &event(&alice)).await;
        f.ledger.set_online(false);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = f.consumer.spawn(shutdown_rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }
        assert_eq!(f.channel.lag(), 1);

        // a fresh worker picks the event up again once the store is back
        f.ledger.set_online(true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = f.consumer.spawn(shutdown_rx);
        wait_for_lag_zero(&f.channel).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }
        assert_eq!(f.ledger.len(), 1);
    }

    async fn drain_through(channel: FlakyChannel, inner: &InMemoryChannel) -> usize {
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let consumer = Arc::new(LedgerConsumer::new(
            Arc::new(channel),
            ledger.clone(),
            Arc::new(DeadLetters::new()),
            RetryPolicy::unbounded(1, 5),
            Duration::from_secs(1),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = consumer.spawn(shutdown_rx);
        wait_for_lag_zero(inner).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }
        ledger.len()
    }

    #[tokio::test]
    async fn failed_commit_is_retried_and_partition_keeps_draining() {
        let inner = Arc::new(InMemoryChannel::new(1));
        let alice = Account::new("alice", Amount::ZERO);
        for _ in 0..3 {
            publish(&inner, &event(&alice)).await;
        }

        let channel = FlakyChannel::new(inner.clone(), 1, 0);
        assert_eq!(drain_through(channel, &inner).await, 3);
    }

    #[tokio::test]
    async fn failed_read_resubscribes_at_committed_offset() {
        let inner = Arc::new(InMemoryChannel::new(1));
        let alice = Account::new("alice", Amount::ZERO);
        for _ in 0..3 {
            publish(&inner, &event(&alice)).await;
        }

        let channel = FlakyChannel::new(inner.clone(), 0, 2);
        assert_eq!(drain_through(channel, &inner).await, 3);
    }

    #[tokio::test]
    async fn bounded_policy_does_not_stop_the_worker() {
        let channel = Arc::new(InMemoryChannel::new(1));
        let ledger = Arc::new(InMemoryLedgerStore::new());
        let consumer = Arc::new(LedgerConsumer::new(
            channel.clone(),
            ledger.clone(),
            Arc::new(DeadLetters::new()),
            RetryPolicy::bounded(2, 1, 5),
            Duration::from_secs(1),
        ));
        let alice = Account::new("alice", Amount::ZERO);
        publish(&channel, &event(&alice)).await;
        publish(&channel, &event(&alice)).await;
        ledger.fail_next(5);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let workers = consumer.spawn(shutdown_rx);
        wait_for_lag_zero(&channel).await;
        shutdown_tx.send(true).unwrap();
        for worker in workers {
            worker.await.unwrap().unwrap();
        }
        assert_eq!(ledger.len(), 2);
    }
}
