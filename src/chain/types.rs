//! Chain-facing data types

use serde::{Deserialize, Serialize};

use crate::storage::amount;

/// Balance of an account, in base units
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    #[serde(with = "amount")]
    pub free: u128,
    #[serde(with = "amount")]
    pub reserved: u128,
    #[serde(with = "amount")]
    pub frozen: u128,
    #[serde(with = "amount")]
    pub flags: u128,
}

impl AccountBalance {
    /// Free balance minus the frozen part
    pub fn transferable(&self) -> u128 {
        self.free.saturating_sub(self.frozen)
    }
}

/// Static information about the connected chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainInfo {
    pub name: String,
    pub token_symbol: String,
    pub token_decimals: u8,
    pub ss58_format: u16,
    pub genesis_hash: String,
    pub spec_version: u32,
    pub transaction_version: u32,
}

/// Block header summary delivered by new-head subscriptions
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
}

/// Progress of a submitted transfer.
///
/// A watch stream yields `Submitted` first and ends with exactly one of
/// `Finalized` or `Failed`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Submitted { tx_hash: String },
    InBlock { block_hash: String },
    Finalized { block_hash: String, block_number: Option<u64> },
    Failed { reason: String },
}

impl TransferEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferEvent::Finalized { .. } | TransferEvent::Failed { .. })
    }
}

/// Result of a finalized transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub block_hash: String,
    pub block_number: Option<u64>,
}

/// Render a base-unit amount with thousands grouping and up to four
/// fractional digits, e.g. `1,234.5 tGLIN`. Whole amounts of a million or
/// more switch to the `M` unit.
pub fn format_balance(raw: u128, decimals: u8, symbol: &str) -> String {
    let divisor = 10u128.checked_pow(u32::from(decimals)).unwrap_or(u128::MAX);
    let whole = raw / divisor;
    let fraction = raw % divisor;

    if whole >= 1_000_000 {
        let millions = whole / 1_000_000;
        let rest = (whole % 1_000_000) / 100;
        return format!("{}.{:04} M{}", millions, rest, symbol);
    }

    let mut fraction_str = format!("{:0width$}", fraction, width = usize::from(decimals));
    fraction_str.truncate(4);
    let fraction_str = fraction_str.trim_end_matches('0');

    let whole_str = group_thousands(whole);
    if fraction_str.is_empty() {
        format!("{} {}", whole_str, symbol)
    } else {
        format!("{}.{} {}", whole_str, fraction_str, symbol)
    }
}

fn group_thousands(value: u128) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
