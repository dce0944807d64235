//! GLIN Wallet Core: key management and transfers for Substrate chains
//!
//! This crate holds the security core of a GLIN wallet. Recovery phrases
//! are encrypted at rest under a password, signing keys only live in memory
//! while a wallet is unlocked, and transfers are tracked from submission to
//! finalization.
//!
//! # Architecture
//!
//! - **Crypto**: BIP39 phrases, Argon2id + XChaCha20-Poly1305 vaults, sr25519 keyring, SS58 addresses
//! - **Chain**: WebSocket JSON-RPC client for a Substrate node with shared connection state
//! - **Storage**: JSON-file store for wallets, accounts and transaction history
//! - **Wallet**: `WalletManager`, the single entry point that ties it together
//!
//! # Example
//!
//! ```ignore
//! use glin_wallet_core::{WalletConfig, WalletManager};
//!
//! let manager = WalletManager::new(WalletConfig::from_env())?;
//! manager.init().await?;
//!
//! let created = manager.create_wallet("Savings", "correct horse", None).await?;
//! println!("Write this down: {}", created.mnemonic.as_str());
//!
//! let receipt = manager
//!     .send_transaction("5FHneW46xGXgs5mUiveU4sbTyGBzmstUspZC92UhjJM694ty", 1_000, "correct horse")
//!     .await?;
//! ```

// Public modules
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod wallet;

// Re-exports for convenience
pub use chain::{
    format_balance, AccountBalance, BlockHeader, ChainClient, ChainInfo, SubscriptionHandle, TransferEvent,
    TransferReceipt, TransferWatch,
};
pub use config::{validate_rpc_url, CallIndex, NetworkId, WalletConfig};
pub use crypto::{KdfParams, KeyPair, KeyringService, MnemonicEngine, Signature, VaultCipher, WordCount};
pub use error::{ChainError, CryptoError, StorageError, WalletError};
pub use storage::{AccountRecord, Storage, TransactionRecord, TxKind, TxState, TxStatus, WalletRecord};
pub use wallet::{CreatedWallet, WalletManager};
