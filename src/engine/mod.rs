//! Transaction processing engine.
//!
//! The engine validates deposits and withdrawals against the balance store,
//! applies them with a compare-and-set, and hands an event describing each
//! accepted mutation to the [`Emitter`]. The [`LedgerConsumer`] drains those
//! events into the ledger store on its own schedule, so ledger history may
//! lag the balance of record; the balance returned by [`Engine::mutate`] is
//! the consistency signal, never the ledger.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::Amount;
use crate::config::Config;
use crate::model::{
    Account, AccountId, Emission, LedgerEntry, MutationReceipt, TransactionEvent, TxKind,
};
use crate::retry::{RetryPolicy, retry};
use crate::store::{BalanceStore, CasOutcome, LedgerStore, StoreError, with_timeout};

mod consumer;
pub use consumer::{Applied, DeadLetter, DeadLetters, LedgerConsumer};

mod emitter;
pub use emitter::Emitter;

mod error;
pub use error::{
    AccountError, ConsumeError, EmitError, EngineError, MutationError, OutboxError, SchemaError,
};

mod outbox;
pub use outbox::Outbox;

mod validate;

/// Store reachability as seen by [`Engine::health_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub balance_store: bool,
    pub ledger_store: bool,
    /// Events waiting in the outbox for the channel to come back.
    pub pending_emissions: usize,
}

impl Health {
    pub fn is_ok(&self) -> bool {
        self.balance_store && self.ledger_store
    }
}

/// The transaction service.
///
/// Stores and emitter are injected so that tests can substitute in-memory fakes.
pub struct Engine {
    balances: Arc<dyn BalanceStore>,
    ledger: Arc<dyn LedgerStore>,
    emitter: Arc<Emitter>,
    store_retry: RetryPolicy,
    store_timeout: Duration,
}

/// Public API
impl Engine {
    pub fn new(
        balances: Arc<dyn BalanceStore>,
        ledger: Arc<dyn LedgerStore>,
        emitter: Arc<Emitter>,
        config: &Config,
    ) -> Self {
        Self {
            balances,
            ledger,
            emitter,
            store_retry: config.store_retry.clone(),
            store_timeout: config.store_timeout(),
        }
    }

    pub fn emitter(&self) -> &Arc<Emitter> {
        &self.emitter
    }

    /// Open a new account with `initial` balance.
    pub async fn create_account(&self, name: &str, initial: Amount) -> Result<Account, EngineError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AccountError::InvalidInput("name is required".to_string()).into());
        }
        if initial.is_negative() {
            return Err(AccountError::InvalidInput(format!(
                "initial balance must not be negative, got {initial}"
            ))
            .into());
        }

        let account = Account::new(name, initial);
        let created = with_timeout(self.store_timeout, self.balances.create_account(account)).await?;
        info!(account = %created.id, name = %created.name, balance = %created.balance, "account created");
        Ok(created)
    }

    pub async fn deposit(&self, id: AccountId, amount: Amount) -> Result<MutationReceipt, EngineError> {
        self.mutate(id, TxKind::Deposit, amount).await
    }

    pub async fn withdraw(&self, id: AccountId, amount: Amount) -> Result<MutationReceipt, EngineError> {
        self.mutate(id, TxKind::Withdraw, amount).await
    }

    /// Validate and apply one deposit or withdrawal, then emit its event.
    ///
    /// The returned balance is durable once this returns `Ok`, whether or not
    /// the event has reached the channel yet.
    pub async fn mutate(
        &self,
        id: AccountId,
        kind: TxKind,
        amount: Amount,
    ) -> Result<MutationReceipt, EngineError> {
        let result = self.apply_mutation(id, kind, amount).await;
        let account = match result {
            Ok(account) => account,
            Err(e) => {
                Self::log_skipped(id, kind, amount, &e);
                return Err(e);
            }
        };

        let event = TransactionEvent::accepted(&account, kind, amount);
        let idempotency_key = event.idempotency_key;
        let emission = match self.emitter.emit(event).await {
            Ok(emission) => emission,
            Err(e) => {
                // the balance mutation stands either way
                let emission = emission_after(&e);
                warn!(account = %id, key = %idempotency_key, error = %e, ?emission, "event not published");
                emission
            }
        };

        info!(
            account = %id,
            key = %idempotency_key,
            amount = %amount,
            balance = %account.balance,
            ?emission,
            "{kind} applied"
        );

        Ok(MutationReceipt {
            account_id: id,
            new_balance: account.balance,
            idempotency_key,
            emission,
        })
    }

    /// Current balance-of-record row.
    pub async fn account(&self, id: AccountId) -> Result<Account, EngineError> {
        self.load(id)
            .await?
            .ok_or_else(|| MutationError::NotFound(id).into())
    }

    /// Ledger history for `id`, ordered by acceptance time.
    ///
    /// Eventually consistent: entries trail the balance store by the
    /// consumer's processing delay.
    pub async fn ledger(&self, id: AccountId) -> Result<Vec<LedgerEntry>, EngineError> {
        let timeout = self.store_timeout;
        let entries = retry(&self.store_retry, "query ledger", StoreError::is_transient, || {
            with_timeout(timeout, self.ledger.query_by_account(id))
        })
        .await?;
        Ok(entries)
    }

    pub async fn health_check(&self) -> Health {
        let timeout = self.store_timeout;
        Health {
            balance_store: with_timeout(timeout, self.balances.ping()).await.is_ok(),
            ledger_store: with_timeout(timeout, self.ledger.ping()).await.is_ok(),
            pending_emissions: self.emitter.outbox().len(),
        }
    }

    /// Wait for both stores to answer, retrying up to the policy's bound.
    pub async fn wait_ready(&self, policy: &RetryPolicy) -> Result<(), StoreError> {
        let timeout = self.store_timeout;
        retry(policy, "balance store readiness", StoreError::is_transient, || {
            with_timeout(timeout, self.balances.ping())
        })
        .await?;
        retry(policy, "ledger store readiness", StoreError::is_transient, || {
            with_timeout(timeout, self.ledger.ping())
        })
        .await?;
        info!("stores ready");
        Ok(())
    }
}

/// Private API
impl Engine {
    fn log_skipped(id: AccountId, kind: TxKind, amount: Amount, error: &EngineError) {
        match error {
            EngineError::Store(e) => {
                warn!(account = %id, amount = %amount, error = %e, "{kind} failed");
            }
            _ => {
                info!(account = %id, amount = %amount, reason = %error, "{kind} skipped");
            }
        }
    }

    async fn load(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let timeout = self.store_timeout;
        retry(&self.store_retry, "load account", StoreError::is_transient, || {
            with_timeout(timeout, self.balances.get_account(id))
        })
        .await
    }

    /// Read, validate and compare-and-set until the update lands on the
    /// balance it was validated against.
    ///
    /// A stale compare-and-set means another mutation won the race; the store
    /// hands back the current row and validation runs again against it. Only
    /// definite `Unavailable` failures of the compare-and-set are retried; a
    /// timed-out write may already have been applied and is surfaced instead.
    async fn apply_mutation(
        &self,
        id: AccountId,
        kind: TxKind,
        amount: Amount,
    ) -> Result<Account, EngineError> {
        let timeout = self.store_timeout;
        let mut current = self.load(id).await?.ok_or(MutationError::NotFound(id))?;
        let mut conflicts = 0u32;

        loop {
            let expected = current.balance;
            let new = validate::next_balance(&current, kind, amount)?;

            let outcome = retry(
                &self.store_retry,
                "compare-and-set balance",
                |e: &StoreError| matches!(e, StoreError::Unavailable(_)),
                || with_timeout(timeout, self.balances.compare_and_set_balance(id, expected, new)),
            )
            .await?;

            match outcome {
                CasOutcome::Applied(account) => {
                    if conflicts > 0 {
                        debug!(account = %id, conflicts, "mutation applied after conflicts");
                    }
                    return Ok(account);
                }
                CasOutcome::Stale(latest) => {
                    conflicts += 1;
                    current = latest;
                    tokio::task::yield_now().await;
                }
                CasOutcome::Missing => return Err(MutationError::NotFound(id).into()),
            }
        }
    }
}

/// Where an event ended up when [`Emitter::emit`] failed.
fn emission_after(error: &EmitError) -> Emission {
    match error {
        // nothing holds an event that cannot be encoded
        EmitError::Encode(_) => Emission::Dropped,
        // the event is queued in the outbox, even if persisting it failed
        EmitError::ChannelUnavailable { .. } | EmitError::Outbox(_) => Emission::Deferred,
    }
}
