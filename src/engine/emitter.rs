//! Publishes accepted transaction events onto the message channel.
//!
//! Publishing is retried a bounded number of times. An event that still
//! cannot be published goes to the [`Outbox`], and the sweeper keeps trying
//! until the channel takes it. Events for an account that already has
//! something in the outbox are queued behind it rather than overtaking it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::EmitError;
use super::outbox::Outbox;
use crate::channel::{ChannelError, MessageChannel};
use crate::model::{Emission, TransactionEvent};
use crate::retry::{RetryPolicy, retry};

pub struct Emitter {
    channel: Arc<dyn MessageChannel>,
    outbox: Arc<Outbox>,
    retry: RetryPolicy,
}

impl Emitter {
    pub fn new(channel: Arc<dyn MessageChannel>, outbox: Arc<Outbox>, retry: RetryPolicy) -> Self {
        Self {
            channel,
            outbox,
            retry,
        }
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Publish `event` keyed by its account.
    ///
    /// Returns `Ok(Emission::Deferred)` when the event was queued behind older
    /// outbox entries, and `Err(EmitError::ChannelUnavailable)` when it was
    /// parked in the outbox after the retries ran out. Either way the event
    /// is not lost.
    pub async fn emit(&self, event: TransactionEvent) -> Result<Emission, EmitError> {
        if self.outbox.has_pending(&event.account_id) {
            debug!(
                account = %event.account_id,
                key = %event.idempotency_key,
                "account has queued events, deferring behind them"
            );
            self.outbox.push(event)?;
            return Ok(Emission::Deferred);
        }

        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    account = %event.account_id,
                    key = %event.idempotency_key,
                    error = %e,
                    "event could not be encoded, dropped"
                );
                return Err(e.into());
            }
        };
        let key = event.account_id.to_string();
        let key = key.as_str();
        let published = retry(&self.retry, "publish", ChannelError::is_transient, || {
            self.channel.publish(key, payload.clone())
        })
        .await;

        match published {
            Ok(()) => Ok(Emission::Published),
            Err(source) => {
                warn!(
                    account = %event.account_id,
                    key = %event.idempotency_key,
                    error = %source,
                    "publish failed, parking event in outbox"
                );
                let account = event.account_id;
                self.outbox.push(event)?;
                Err(EmitError::ChannelUnavailable { account, source })
            }
        }
    }

    /// Try once to publish everything in the outbox, oldest first per account.
    ///
    /// An account is skipped for this round at its first failed publish so
    /// that its later events never overtake the failed one.
    pub async fn sweep(&self) -> Result<usize, EmitError> {
        let mut published = 0;

        for account in self.outbox.accounts() {
            while let Some(event) = self.outbox.front(&account) {
                let payload = event.encode()?;
                match self.channel.publish(&account.to_string(), payload).await {
                    Ok(()) => {
                        self.outbox
                            .remove_front(&account, &event.idempotency_key)?;
                        published += 1;
                    }
                    Err(e) => {
                        debug!(account = %account, error = %e, "outbox publish failed, will retry");
                        break;
                    }
                }
            }
        }

        if published > 0 {
            info!(published, remaining = self.outbox.len(), "outbox swept");
        }
        Ok(published)
    }

    /// Sweep the outbox every `interval` until `shutdown` fires, then sweep once more.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "outbox sweeper started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.sweep().await {
                error!(error = %e, "outbox sweep failed");
            }
        }

        if let Err(e) = self.sweep().await {
            error!(error = %e, "final outbox sweep failed");
        }
        info!(remaining = self.outbox.len(), "outbox sweeper stopped");
    }
}
