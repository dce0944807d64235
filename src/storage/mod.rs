//! Storage and persistence layer
//!
//! - Single-file JSON database
//! - Data models

mod file_system;
mod models;

pub use file_system::Storage;
pub use models::{
    amount, AccountRecord, NewAccount, NewTransaction, NewWallet, TransactionRecord, TxKind,
    TxState, TxStatus, WalletRecord,
};
