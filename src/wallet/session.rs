use std::fmt;

use super::poller::BalancePoller;
use crate::crypto::KeyPair;
use crate::storage::WalletRecord;

/// In-memory state of the unlocked wallet.
///
/// Holds the root keypair only; the recovery phrase is decrypted on demand
/// and never kept here. Dropping the session stops its balance poller and
/// zeroizes the secret key.
pub(crate) struct UnlockedSession {
    pub wallet: WalletRecord,
    pub keypair: KeyPair,
    poller: Option<BalancePoller>,
}

impl UnlockedSession {
    pub fn new(wallet: WalletRecord, keypair: KeyPair) -> Self {
        Self {
            wallet,
            keypair,
            poller: None,
        }
    }

    pub fn attach_poller(&mut self, poller: BalancePoller) {
        self.poller = Some(poller);
    }

    pub fn wallet_id(&self) -> u64 {
        self.wallet.id
    }
}

impl fmt::Debug for UnlockedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedSession")
            .field("wallet_id", &self.wallet.id)
            .field("address", &self.wallet.address)
            .field("polling", &self.poller.is_some())
            .finish_non_exhaustive()
    }
}
