//! In-process stores used by the replay binary and by tests.

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{BalanceStore, CasOutcome, InsertOutcome, LedgerStore, StoreError};
use crate::Amount;
use crate::model::{Account, AccountId, IdempotencyKey, LedgerEntry};

/// Availability switch plus a budget of injected transient failures.
#[derive(Debug)]
struct Faults {
    name: &'static str,
    online: AtomicBool,
    failures: AtomicUsize,
}

impl Faults {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            online: AtomicBool::new(true),
            failures: AtomicUsize::new(0),
        }
    }

    fn check(&self) -> Result<(), StoreError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} offline", self.name)));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("{} failed", self.name)));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Balance store backed by a mutex-guarded map; the compare-and-set runs under the lock.
#[derive(Debug)]
pub struct InMemoryBalanceStore {
    accounts: Mutex<HashMap<AccountId, Account>>,
    faults: Faults,
}

impl InMemoryBalanceStore {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            faults: Faults::new("balance store"),
        }
    }

    /// Take the store offline (or bring it back).
    pub fn set_online(&self, online: bool) {
        self.faults.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.faults.failures.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.accounts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryBalanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalanceStore for InMemoryBalanceStore {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.faults.check()?;
        Ok(lock(&self.accounts).get(&id).cloned())
    }

    async fn compare_and_set_balance(
        &self,
        id: AccountId,
        expected: Amount,
        new: Amount,
    ) -> Result<CasOutcome, StoreError> {
        self.faults.check()?;
        let mut accounts = lock(&self.accounts);
        let Some(account) = accounts.get_mut(&id) else {
            return Ok(CasOutcome::Missing);
        };

        if account.balance != expected {
            return Ok(CasOutcome::Stale(account.clone()));
        }

        // keep updated_at strictly increasing even if the clock stalls
        let now = Utc::now();
        let floor = account.updated_at + TimeDelta::microseconds(1);
        account.balance = new;
        account.version += 1;
        account.updated_at = now.max(floor);

        Ok(CasOutcome::Applied(account.clone()))
    }

    async fn create_account(&self, account: Account) -> Result<Account, StoreError> {
        self.faults.check()?;
        let mut accounts = lock(&self.accounts);
        if accounts.contains_key(&account.id) {
            return Err(StoreError::Duplicate(account.id));
        }
        accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.faults.check()
    }
}

#[derive(Debug, Default)]
struct LedgerTables {
    entries: HashMap<IdempotencyKey, LedgerEntry>,
    by_account: HashMap<AccountId, Vec<IdempotencyKey>>,
}

/// Append-only ledger keyed by idempotency key.
#[derive(Debug)]
pub struct InMemoryLedgerStore {
    tables: Mutex<LedgerTables>,
    faults: Faults,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LedgerTables::default()),
            faults: Faults::new("ledger store"),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.faults.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with `StoreError::Unavailable`.
    pub fn fail_next(&self, count: usize) {
        self.faults.failures.store(count, Ordering::SeqCst);
    }

    /// Total number of entries across all accounts.
    pub fn len(&self) -> usize {
        lock(&self.tables).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn contains(&self, key: IdempotencyKey) -> Result<bool, StoreError> {
        self.faults.check()?;
        Ok(lock(&self.tables).entries.contains_key(&key))
    }

    async fn insert_if_absent(&self, entry: LedgerEntry) -> Result<InsertOutcome, StoreError> {
        self.faults.check()?;
        let mut tables = lock(&self.tables);
        let key = entry.key();
        if tables.entries.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables
            .by_account
            .entry(entry.account_id())
            .or_default()
            .push(key);
        tables.entries.insert(key, entry);
        Ok(InsertOutcome::Inserted)
    }

    async fn query_by_account(&self, id: AccountId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.faults.check()?;
        let tables = lock(&self.tables);
        let mut entries: Vec<LedgerEntry> = tables
            .by_account
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|key| tables.entries.get(key).cloned())
            .collect();
        entries.sort_by_key(|e| (e.event.accepted_at, e.event.sequence));
        Ok(entries)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.faults.check()
    }
}
