//! Local staging area for events that could not be published.
//!
//! Events are kept per account in acceptance order. When a path is given the
//! whole outbox is rewritten to disk (write to a temp file, then rename) on
//! every change, synced before the rename, and reloaded by [`Outbox::open`] after a restart.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

use super::OutboxError;
use crate::model::{AccountId, IdempotencyKey, TransactionEvent};

type Pending = BTreeMap<AccountId, VecDeque<TransactionEvent>>;

#[derive(Debug)]
pub struct Outbox {
    pending: Mutex<Pending>,
    path: Option<PathBuf>,
}

impl Outbox {
    /// Outbox that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            pending: Mutex::new(Pending::new()),
            path: None,
        }
    }

    /// Open a file-backed outbox, loading events left over from a previous run.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
        let path = path.as_ref().to_path_buf();
        let mut pending = Pending::new();

        if path.exists() {
            let events: Vec<TransactionEvent> = serde_json::from_slice(&fs::read(&path)?)?;
            if !events.is_empty() {
                info!(path = %path.display(), count = events.len(), "recovered outbox events");
            }
            for event in events {
                pending.entry(event.account_id).or_default().push_back(event);
            }
        }

        Ok(Self {
            pending: Mutex::new(pending),
            path: Some(path),
        })
    }

    /// Queue `event` behind any events already pending for its account.
    ///
    /// The event is kept in memory even if persisting the file fails.
    pub fn push(&self, event: TransactionEvent) -> Result<(), OutboxError> {
        let mut pending = self.lock();
        pending.entry(event.account_id).or_default().push_back(event);
        self.persist(&pending)
    }

    pub fn has_pending(&self, account: &AccountId) -> bool {
        self.lock().get(account).is_some_and(|q| !q.is_empty())
    }

    /// Oldest pending event for `account`.
    pub fn front(&self, account: &AccountId) -> Option<TransactionEvent> {
        self.lock().get(account).and_then(|q| q.front().cloned())
    }

    /// Drop the oldest event for `account` once it has been published.
    ///
    /// Does nothing unless `key` is still at the front of the queue.
    pub fn remove_front(&self, account: &AccountId, key: &IdempotencyKey) -> Result<(), OutboxError> {
        let mut pending = self.lock();
        let Some(queue) = pending.get_mut(account) else {
            return Ok(());
        };
        if queue.front().is_none_or(|e| e.idempotency_key != *key) {
            return Ok(());
        }
        queue.pop_front();
        if queue.is_empty() {
            pending.remove(account);
        }
        self.persist(&pending)
    }

    /// Accounts with at least one pending event.
    pub fn accounts(&self) -> Vec<AccountId> {
        self.lock().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, pending: &Pending) -> Result<(), OutboxError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let events: Vec<&TransactionEvent> = pending.values().flatten().collect();
        let tmp = path.with_extension("tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec(&events)?)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Amount;
    use crate::model::{Account, TxKind};

    fn event(account: &Account, sequence: u64) -> TransactionEvent {
        let mut account = account.clone();
        account.version = sequence;
        TransactionEvent::accepted(&account, TxKind::Deposit, Amount::from_scaled(1))
    }

    #[test]
    fn keeps_per_account_order() {
        let outbox = Outbox::in_memory();
        let alice = Account::new("alice", Amount::ZERO);
        let first = event(&alice, 1);
        let second = event(&alice, 2);
        outbox.push(first.clone()).unwrap();
        outbox.push(second.clone()).unwrap();

        assert!(outbox.has_pending(&alice.id));
        assert_eq!(outbox.front(&alice.id), Some(first.clone()));

        outbox.remove_front(&alice.id, &first.idempotency_key).unwrap();
        assert_eq!(outbox.front(&alice.id), Some(second.clone()));

        outbox.remove_front(&alice.id, &second.idempotency_key).unwrap();
        assert!(!outbox.has_pending(&alice.id));
        assert!(outbox.accounts().is_empty());
    }

    #[test]
    fn remove_front_ignores_other_keys() {
        let outbox = Outbox::in_memory();
        let alice = Account::new("alice", Amount::ZERO);
        let first = event(&alice, 1);
        let second = event(&alice, 2);
        outbox.push(first.clone()).unwrap();
        outbox.push(second.clone()).unwrap();

        outbox.remove_front(&alice.id, &second.idempotency_key).unwrap();
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.front(&alice.id), Some(first));
    }

    #[test]
    fn accounts_are_independent() {
        let outbox = Outbox::in_memory();
        let alice = Account::new("alice", Amount::ZERO);
        let bob = Account::new("bob", Amount::ZERO);
        outbox.push(event(&alice, 1)).unwrap();

        assert!(outbox.has_pending(&alice.id));
        assert!(!outbox.has_pending(&bob.id));
        assert_eq!(outbox.accounts(), vec![alice.id]);
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        let alice = Account::new("alice", Amount::ZERO);
        let first = event(&alice, 1);
        let second = event(&alice, 2);

        {
            let outbox = Outbox::open(&path).unwrap();
            outbox.push(first.clone()).unwrap();
            outbox.push(second.clone()).unwrap();
            outbox.remove_front(&alice.id, &first.idempotency_key).unwrap();
        }

        let reopened = Outbox::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.front(&alice.id), Some(second));
    }

    #[test]
    fn persisted_file_replaces_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        let alice = Account::new("alice", Amount::ZERO);
        let pending = event(&alice, 1);

        let outbox = Outbox::open(&path).unwrap();
        outbox.push(pending.clone()).unwrap();

        assert!(!path.with_extension("tmp").exists());
        let on_disk: Vec<TransactionEvent> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, vec![pending]);
    }

    #[test]
    fn open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outbox.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(Outbox::open(&path), Err(OutboxError::Corrupt(_))));
    }
}
