//! Balance store and ledger store interfaces.
//!
//! The engine only talks to the stores through these traits so that the
//! backing databases can be swapped (or faked in tests) without touching
//! the transaction logic.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Account, AccountId, IdempotencyKey, LedgerEntry};
use crate::Amount;

mod memory;
pub use memory::{InMemoryBalanceStore, InMemoryLedgerStore};

/// Infrastructure failures reported by a store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("account {0} already exists")]
    Duplicate(AccountId),
}

impl StoreError {
    /// Failures worth retrying; a retry of a timed-out write may observe its own effect.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }
}

/// Result of a conditional balance update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The balance matched and was replaced; carries the updated row.
    Applied(Account),
    /// The balance changed since it was read; carries the current row.
    Stale(Account),
    Missing,
}

/// Result of an idempotent ledger append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An entry with the same idempotency key already exists.
    Duplicate,
}

/// Mutable, strongly consistent store holding one row per account.
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// Atomically replace the balance if it still equals `expected`.
    ///
    /// On success the store bumps the account version and moves `updated_at`
    /// strictly forward.
    async fn compare_and_set_balance(
        &self,
        id: AccountId,
        expected: Amount,
        new: Amount,
    ) -> Result<CasOutcome, StoreError>;

    async fn create_account(&self, account: Account) -> Result<Account, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Append-only store of ledger entries keyed by idempotency key.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn contains(&self, key: IdempotencyKey) -> Result<bool, StoreError>;

    async fn insert_if_absent(&self, entry: LedgerEntry) -> Result<InsertOutcome, StoreError>;

    /// Entries for one account, ordered by acceptance time (then sequence).
    async fn query_by_account(&self, id: AccountId) -> Result<Vec<LedgerEntry>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Bound a single store call by `limit`.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| StoreError::Timeout(limit))?
}
