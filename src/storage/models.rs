//! Data models for wallet storage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::vault::{EncryptedPayload, KdfParams};

/// `u128` amounts as decimal strings
pub mod amount {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }

    pub mod option {
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&v.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| raw.parse().map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: u64,
    pub name: String,
    pub encrypted_seed: String,
    pub nonce: String,
    pub salt: String,
    pub kdf: KdfParams,
    pub address: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub is_active: bool,
}

impl WalletRecord {
    pub fn encrypted_payload(&self) -> EncryptedPayload {
        EncryptedPayload {
            ciphertext: self.encrypted_seed.clone(),
            nonce: self.nonce.clone(),
            salt: self.salt.clone(),
        }
    }
}

/// Fields supplied by the caller when a wallet is created
#[derive(Debug, Clone)]
pub struct NewWallet {
    pub name: String,
    pub encrypted: EncryptedPayload,
    pub kdf: KdfParams,
    pub address: String,
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: u64,
    pub wallet_id: u64,
    pub index: u32,
    pub name: String,
    pub derivation_path: String,
    pub address: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub wallet_id: u64,
    pub index: u32,
    pub name: String,
    pub derivation_path: String,
    pub address: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Send,
    Receive,
    Faucet,
}

/// Coarse transaction status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Success,
    Failed,
}

/// Lifecycle of a transaction record. Only moves forward; `Finalized` and
/// `Failed` are final.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TxState {
    Unsubmitted,
    Submitted {
        hash: String,
    },
    InBlock {
        hash: String,
        block_hash: String,
    },
    Finalized {
        hash: String,
        block_hash: String,
        block_number: Option<u64>,
    },
    Failed {
        hash: Option<String>,
        reason: String,
    },
}

impl TxState {
    pub fn status(&self) -> TxStatus {
        match self {
            TxState::Unsubmitted | TxState::Submitted { .. } | TxState::InBlock { .. } => TxStatus::Pending,
            TxState::Finalized { .. } => TxStatus::Success,
            TxState::Failed { .. } => TxStatus::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Finalized { .. } | TxState::Failed { .. })
    }

    pub fn hash(&self) -> Option<&str> {
        match self {
            TxState::Unsubmitted => None,
            TxState::Submitted { hash }
            | TxState::InBlock { hash, .. }
            | TxState::Finalized { hash, .. } => Some(hash),
            TxState::Failed { hash, .. } => hash.as_deref(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TxState::Unsubmitted => "unsubmitted",
            TxState::Submitted { .. } => "submitted",
            TxState::InBlock { .. } => "in_block",
            TxState::Finalized { .. } => "finalized",
            TxState::Failed { .. } => "failed",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            TxState::Unsubmitted => 0,
            TxState::Submitted { .. } => 1,
            TxState::InBlock { .. } => 2,
            TxState::Finalized { .. } | TxState::Failed { .. } => 3,
        }
    }

    /// A block re-inclusion (`InBlock -> InBlock`) is the only sideways move
    pub fn can_transition_to(&self, next: &TxState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (TxState::InBlock { .. }, TxState::InBlock { .. }) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: u64,
    pub from: String,
    pub to: String,
    #[serde(with = "amount")]
    pub amount: u128,
    #[serde(with = "amount::option", default)]
    pub fee: Option<u128>,
    #[serde(flatten)]
    pub state: TxState,
    pub timestamp: DateTime<Utc>,
    pub kind: TxKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TransactionRecord {
    pub fn status(&self) -> TxStatus {
        self.state.status()
    }

    pub fn hash(&self) -> Option<&str> {
        self.state.hash()
    }
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub from: String,
    pub to: String,
    pub amount: u128,
    pub fee: Option<u128>,
    pub kind: TxKind,
}
