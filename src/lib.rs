pub mod amount;
pub mod channel;
pub mod config;
pub mod csv;
pub mod engine;
pub mod model;
pub mod retry;
pub mod store;

pub use amount::Amount;
pub use config::Config;
pub use engine::Engine;
pub use model::{Account, AccountId, IdempotencyKey, LedgerEntry, TransactionEvent, TxKind};
