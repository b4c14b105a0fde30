//! Core domain types for the ledger service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::Amount;
use crate::engine::SchemaError;

/// Opaque account identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    pub fn new() -> Self {
        AccountId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(AccountId)
    }
}

/// Identity of one logical transaction, generated when the mutation is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub fn new() -> Self {
        IdempotencyKey(Uuid::new_v4())
    }
}

impl Default for IdempotencyKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IdempotencyKey {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(IdempotencyKey)
    }
}

/// Direction of a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    /// Credit funds to the account.
    Deposit,
    /// Debit funds from the account.
    Withdraw,
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxKind::Deposit => f.write_str("deposit"),
            TxKind::Withdraw => f.write_str("withdraw"),
        }
    }
}

/// Balance-of-record row for one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub balance: Amount,
    /// Number of accepted mutations; bumped by every successful compare-and-set.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// Strictly increasing per account, doubles as the acceptance time of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    pub fn new(name: impl Into<String>, balance: Amount) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::new(),
            name: name.into(),
            balance,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An accepted balance mutation in flight between the balance store and the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    pub idempotency_key: IdempotencyKey,
    pub account_id: AccountId,
    pub kind: TxKind,
    pub amount: Amount,
    pub resulting_balance: Amount,
    /// Account version produced by this mutation.
    pub sequence: u64,
    pub accepted_at: DateTime<Utc>,
}

impl TransactionEvent {
    /// Describe a mutation that has just been applied, producing `account`.
    pub fn accepted(account: &Account, kind: TxKind, amount: Amount) -> Self {
        Self {
            idempotency_key: IdempotencyKey::new(),
            account_id: account.id,
            kind,
            amount,
            resulting_balance: account.balance,
            sequence: account.version,
            accepted_at: account.updated_at,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a wire payload and check the invariants every accepted event holds.
    pub fn decode(payload: &[u8]) -> Result<Self, SchemaError> {
        let event: Self = serde_json::from_slice(payload)?;
        if !event.amount.is_positive() {
            return Err(SchemaError::NonPositiveAmount(event.amount));
        }
        if event.resulting_balance.is_negative() {
            return Err(SchemaError::NegativeBalance(event.resulting_balance));
        }
        Ok(event)
    }
}

/// Durable, immutable copy of a [`TransactionEvent`] in the ledger store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    #[serde(flatten)]
    pub event: TransactionEvent,
    pub ingested_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(event: TransactionEvent) -> Self {
        Self {
            event,
            ingested_at: Utc::now(),
        }
    }

    pub fn key(&self) -> IdempotencyKey {
        self.event.idempotency_key
    }

    pub fn account_id(&self) -> AccountId {
        self.event.account_id
    }
}

/// Whether the event for a mutation reached the channel synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    Published,
    /// Parked in the outbox; the sweeper will publish it later.
    Deferred,
    /// Could not be encoded. The balance change stands but no ledger entry
    /// will follow.
    Dropped,
}

/// Synchronous answer to a confirmed deposit or withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReceipt {
    pub account_id: AccountId,
    pub new_balance: Amount,
    pub idempotency_key: IdempotencyKey,
    pub emission: Emission,
}
