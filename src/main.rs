use std::collections::BTreeMap;
use std::env;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use txs_ledger::channel::InMemoryChannel;
use txs_ledger::csv::{Request, read_requests, write_accounts};
use txs_ledger::engine::{DeadLetters, Emitter, LedgerConsumer, Outbox};
use txs_ledger::store::{InMemoryBalanceStore, InMemoryLedgerStore};
use txs_ledger::{AccountId, Amount, Config, Engine, TxKind};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse().unwrap()))
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let path = args
        .next()
        .expect("usage: txs-ledger <requests.csv> [config.yaml]");

    let config = match args.next().map(Config::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    };

    let outbox = match &config.outbox_path {
        Some(outbox_path) => Outbox::open(outbox_path),
        None => Ok(Outbox::in_memory()),
    };
    let outbox = match outbox {
        Ok(outbox) => Arc::new(outbox),
        Err(e) => {
            error!("{e}");
            process::exit(2);
        }
    };

    let channel = Arc::new(InMemoryChannel::new(config.partitions));
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let emitter = Arc::new(Emitter::new(
        channel.clone(),
        outbox,
        config.emit_retry.clone(),
    ));
    let engine = Engine::new(
        Arc::new(InMemoryBalanceStore::new()),
        ledger.clone(),
        emitter.clone(),
        &config,
    );

    if let Err(e) = engine.wait_ready(&config.startup_retry).await {
        error!(error = %e, "stores did not become ready");
        process::exit(1);
    }

    let consumer = Arc::new(LedgerConsumer::new(
        channel.clone(),
        ledger,
        Arc::new(DeadLetters::new()),
        config.consumer_retry.clone(),
        config.store_timeout(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = consumer.spawn(shutdown_rx.clone());
    let sweeper = {
        let emitter = emitter.clone();
        let interval = config.sweep_interval();
        tokio::spawn(async move { emitter.run_sweeper(interval, shutdown_rx).await })
    };

    let requests = match read_requests(path.clone()) {
        Ok(requests) => requests,
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    };
    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    let (tx_sender, tx_receiver) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        for result in requests {
            match result {
                Ok(request) => {
                    if tx_sender.send(request).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    // account names in the input map to generated ids
    let mut accounts = BTreeMap::new();
    let mut stream = ReceiverStream::new(tx_receiver);
    while let Some(request) = stream.next().await {
        apply(&engine, &mut accounts, request).await;
    }

    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while channel.lag() > 0 || !emitter.outbox().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            lag = channel.lag(),
            pending = emitter.outbox().len(),
            "ledger not fully drained before shutdown"
        );
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "ledger consumer failed"),
            Err(e) => error!(error = %e, "ledger consumer panicked"),
        }
    }
    let _ = sweeper.await;

    if !consumer.dead_letters().is_empty() {
        warn!(count = consumer.dead_letters().len(), "events were dead-lettered");
    }

    let mut report = Vec::with_capacity(accounts.len());
    for (name, id) in &accounts {
        let balance = match engine.account(*id).await {
            Ok(account) => account.balance,
            Err(e) => {
                error!(account = %name, error = %e, "failed to load account");
                continue;
            }
        };
        let entries = match engine.ledger(*id).await {
            Ok(entries) => entries.len(),
            Err(e) => {
                error!(account = %name, error = %e, "failed to load ledger");
                continue;
            }
        };
        report.push((name.as_str(), balance, entries));
    }

    if let Err(e) = write_accounts(report) {
        error!(error = %e, "failed to write report");
        process::exit(1);
    }
}

/// Apply one request; rejections are logged and never stop the run.
async fn apply(engine: &Engine, accounts: &mut BTreeMap<String, AccountId>, request: Request) {
    match request {
        Request::Open { account, balance } => {
            if accounts.contains_key(&account) {
                warn!(account, "account already open");
                return;
            }
            match engine.create_account(&account, balance).await {
                Ok(created) => {
                    accounts.insert(account, created.id);
                }
                Err(e) => warn!(account, "{e}"),
            }
        }
        Request::Deposit { account, amount } => {
            mutate(engine, accounts, &account, TxKind::Deposit, amount).await;
        }
        Request::Withdraw { account, amount } => {
            mutate(engine, accounts, &account, TxKind::Withdraw, amount).await;
        }
    }
}

async fn mutate(
    engine: &Engine,
    accounts: &BTreeMap<String, AccountId>,
    name: &str,
    kind: TxKind,
    amount: Amount,
) {
    let Some(id) = accounts.get(name) else {
        warn!(account = name, "{kind} for unknown account");
        return;
    };
    // the engine logs rejections itself
    let _ = engine.mutate(*id, kind, amount).await;
}
