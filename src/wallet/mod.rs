//! Wallet orchestration: the unlocked session and the operations on it

mod manager;
mod poller;
mod session;

pub use manager::{CreatedWallet, WalletManager};
pub use poller::{BalancePoller, BalanceSender};
