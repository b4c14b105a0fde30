//! Error types for transaction processing.

use thiserror::Error;

use crate::Amount;
use crate::channel::ChannelError;
use crate::model::AccountId;
use crate::store::StoreError;

/// Top-level error returned by the synchronous [`Engine`](super::Engine) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("account rejected: {0}")]
    Account(#[from] AccountError),

    #[error("transaction rejected: {0}")]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error during account creation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Business-rule rejection of a deposit or withdrawal. Nothing was mutated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("insufficient funds for account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        balance: Amount,
        requested: Amount,
    },

    #[error("applying {amount} to account {account} would overflow its balance")]
    Overflow { account: AccountId, amount: Amount },
}

/// Schema violation in a consumed event payload.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event amount must be positive, got {0}")]
    NonPositiveAmount(Amount),

    #[error("event resulting balance is negative: {0}")]
    NegativeBalance(Amount),
}

/// Error from the outbox staging area.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("outbox i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("outbox file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Failure to hand an event to the channel synchronously.
#[derive(Debug, Error)]
pub enum EmitError {
    /// Publishing failed after the immediate retries; the event is in the outbox.
    #[error("channel unavailable for account {account}: {source}")]
    ChannelUnavailable {
        account: AccountId,
        source: ChannelError,
    },

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Failure while draining the channel into the ledger store.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
