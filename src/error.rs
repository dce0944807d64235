use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Invalid mnemonic phrase")]
    InvalidMnemonic,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("No wallet unlocked")]
    NoWalletUnlocked,

    #[error("Wallet not found: {0}")]
    WalletNotFound(u64),

    #[error("Invalid wallet name: {0}")]
    InvalidName(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Cannot send to yourself")]
    SelfTransfer,

    #[error("Insufficient balance: available {available}, required {required} (including fees)")]
    InsufficientBalance { available: u128, required: u128 },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid mnemonic phrase")]
    InvalidMnemonic,

    /// Wrong password, corrupted data and tampering all collapse into this.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Keyring not initialized. Call init() first.")]
    NotInitialized,

    #[error("Account is locked")]
    AccountLocked,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Chain errors are `Clone` so a single failed connection attempt can be
/// delivered to every caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("Not connected to chain. Call connect() first.")]
    NotConnected,

    #[error("Failed to connect to node: {0}")]
    ConnectionFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid response from node: {0}")]
    InvalidResponse(String),

    #[error("Transaction failed: {0}")]
    TransferFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Subscription closed")]
    SubscriptionClosed,
}

impl ChainError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    pub fn transfer_failed(msg: impl Into<String>) -> Self {
        Self::TransferFailed(msg.into())
    }

    /// The request may or may not have reached the node. A submitted
    /// transfer that ends this way can still be included.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Timeout(_) | Self::SubscriptionClosed
        )
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Wallet not found: {0}")]
    WalletNotFound(u64),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(u64),

    #[error("Invalid transaction state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Store lock poisoned")]
    Poisoned,
}
