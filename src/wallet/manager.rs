/// Wallet Manager - Orchestration Layer
///
/// Owns the single unlocked-wallet session and coordinates mnemonic
/// handling, vault encryption, key derivation, storage and the chain client.
/// Every operation that reads or replaces the session holds one async mutex
/// for its whole critical section. Node round trips made on behalf of a
/// transfer happen outside that mutex, so locking never waits on the node.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use zeroize::Zeroizing;

use super::poller::{BalancePoller, BalanceSender};
use super::session::UnlockedSession;
use crate::chain::{
    AccountBalance, ChainClient, NodeConnector, SubstrateConnector, TransferEvent, TransferReceipt,
    TransferWatch,
};
use crate::config::WalletConfig;
use crate::crypto::keyring::account_derivation_path;
use crate::crypto::{ss58, KeyringService, MnemonicEngine, Signature, VaultCipher, WordCount};
use crate::error::{ChainError, CryptoError, StorageError, WalletError};
use crate::storage::{
    AccountRecord, NewAccount, NewTransaction, NewWallet, Storage, TransactionRecord, TxKind, TxState,
    WalletRecord,
};

const MAIN_ACCOUNT_NAME: &str = "Main Account";
const HISTORY_LIMIT: usize = 50;

/// A newly created wallet together with its recovery phrase. The phrase is
/// handed out once, here.
pub struct CreatedWallet {
    pub wallet: WalletRecord,
    pub mnemonic: Zeroizing<String>,
}

impl fmt::Debug for CreatedWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedWallet")
            .field("wallet", &self.wallet)
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

pub struct WalletManager {
    config: WalletConfig,
    storage: Arc<Storage>,
    cipher: VaultCipher,
    keyring: KeyringService,
    chain: Arc<ChainClient>,
    session: Mutex<Option<UnlockedSession>>,
    balance_tx: BalanceSender,
}

impl WalletManager {
    // ============================================================================
    // Constructor
    // ============================================================================

    /// Manager talking to a Substrate node over WebSocket
    pub fn new(config: WalletConfig) -> Result<Self, WalletError> {
        let connector = Arc::new(SubstrateConnector::new(config.transfer_call, config.ss58_prefix));
        Self::new_with_connector(config, connector)
    }

    /// Manager with a custom node connector (for testing)
    pub fn new_with_connector(
        config: WalletConfig,
        connector: Arc<dyn NodeConnector>,
    ) -> Result<Self, WalletError> {
        let storage = Arc::new(Storage::new_with_base_dir(config.data_dir.clone())?);
        let cipher = VaultCipher::new(config.kdf);
        let keyring = KeyringService::new(config.ss58_prefix, cipher.clone());
        let chain = Arc::new(
            ChainClient::new(config.rpc_url.clone(), connector).with_request_timeout(config.request_timeout),
        );
        let (balance_tx, _) = watch::channel(None);

        Ok(Self {
            config,
            storage,
            cipher,
            keyring,
            chain,
            session: Mutex::new(None),
            balance_tx: Arc::new(balance_tx),
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn chain(&self) -> &Arc<ChainClient> {
        &self.chain
    }

    /// Initialize the keyring and connect to the node. A node that cannot be
    /// reached is logged, not fatal. Every chain operation calls `connect()`
    /// first, which reopens a lost session.
    pub async fn init(&self) -> Result<(), WalletError> {
        self.keyring.init()?;

        if let Err(e) = self.chain.connect().await {
            log::warn!("Node at {} unavailable: {}", self.chain.endpoint(), e);
        }

        if let Some(active) = self.storage.get_active_wallet()? {
            log::info!("Active wallet {} ('{}') restored, locked", active.id, active.name);
        }
        Ok(())
    }

    // ============================================================================
    // Wallet lifecycle
    // ============================================================================

    /// Create a wallet, make it the active one and unlock it. A fresh
    /// 12-word phrase is generated when `mnemonic` is `None`.
    pub async fn create_wallet(
        &self,
        name: &str,
        password: &str,
        mnemonic: Option<&str>,
    ) -> Result<CreatedWallet, WalletError> {
        let name = validate_name(name)?;
        if password.is_empty() {
            return Err(WalletError::InvalidPassword);
        }

        let phrase = match mnemonic {
            Some(phrase) => MnemonicEngine::normalize(phrase),
            None => MnemonicEngine::generate(WordCount::Twelve)?,
        };
        if !MnemonicEngine::validate(&phrase) {
            return Err(WalletError::InvalidMnemonic);
        }

        let mut session = self.session.lock().await;

        let keypair = self.keyring.create_from_mnemonic(&phrase, &name)?;
        let encrypted = self.cipher.encrypt(phrase.as_bytes(), password)?;

        // the main account is the root key itself, so its path is empty
        let (record, _) = self.storage.create_wallet_with_main_account(
            NewWallet {
                name,
                encrypted,
                kdf: *self.cipher.params(),
                address: keypair.address().to_string(),
                public_key: keypair.public_key_hex(),
            },
            NewAccount {
                wallet_id: 0,
                index: 0,
                name: MAIN_ACCOUNT_NAME.to_string(),
                derivation_path: String::new(),
                address: keypair.address().to_string(),
                public_key: keypair.public_key_hex(),
            },
        )?;
        log::info!("Created wallet {} ({})", record.id, ss58::short(&record.address));

        self.replace_session(&mut session, Some(UnlockedSession::new(record.clone(), keypair)));

        Ok(CreatedWallet {
            wallet: record,
            mnemonic: phrase,
        })
    }

    /// Create a wallet from an existing recovery phrase
    pub async fn import_wallet(
        &self,
        name: &str,
        mnemonic: &str,
        password: &str,
    ) -> Result<WalletRecord, WalletError> {
        if !MnemonicEngine::validate(mnemonic) {
            return Err(WalletError::InvalidMnemonic);
        }
        let created = self.create_wallet(name, password, Some(mnemonic)).await?;
        Ok(created.wallet)
    }

    /// Unlock `wallet_id`, locking any other wallet first. Returns `false`
    /// for a wrong password.
    pub async fn unlock_wallet(&self, wallet_id: u64, password: &str) -> Result<bool, WalletError> {
        let mut session = self.session.lock().await;

        let wallet = self
            .storage
            .get_wallet(wallet_id)?
            .ok_or(WalletError::WalletNotFound(wallet_id))?;

        let Some(phrase) = self.decrypt_phrase(&wallet, password)? else {
            log::warn!("Unlock of wallet {} rejected", wallet_id);
            return Ok(false);
        };
        let keypair = self.keyring.create_from_mnemonic(&phrase, &wallet.name)?;
        drop(phrase);
        if keypair.public_key_hex() != wallet.public_key {
            return Err(WalletError::Internal(format!(
                "wallet {} key does not match its stored public key",
                wallet_id
            )));
        }

        self.storage.touch_wallet(wallet_id)?;
        self.storage.set_active_wallet(wallet_id)?;
        let wallet = self
            .storage
            .get_wallet(wallet_id)?
            .ok_or(WalletError::WalletNotFound(wallet_id))?;

        log::info!("Unlocked wallet {} ({})", wallet_id, ss58::short(&wallet.address));
        self.replace_session(&mut session, Some(UnlockedSession::new(wallet, keypair)));
        Ok(true)
    }

    /// Drop the in-memory signer. Always succeeds.
    pub async fn lock_wallet(&self) {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.as_ref() {
            log::info!("Locking wallet {}", previous.wallet_id());
        }
        self.replace_session(&mut session, None);
    }

    /// Delete a wallet and its accounts after checking the password.
    /// Transaction history is kept.
    pub async fn delete_wallet(&self, wallet_id: u64, password: &str) -> Result<bool, WalletError> {
        let mut session = self.session.lock().await;

        let wallet = self
            .storage
            .get_wallet(wallet_id)?
            .ok_or(WalletError::WalletNotFound(wallet_id))?;
        if self.decrypt_phrase(&wallet, password)?.is_none() {
            return Ok(false);
        }

        self.storage.delete_wallet(wallet_id)?;
        if session.as_ref().map(UnlockedSession::wallet_id) == Some(wallet_id) {
            self.replace_session(&mut session, None);
        }
        log::info!("Wallet {} deleted", wallet_id);
        Ok(true)
    }

    /// Recovery phrase of the current wallet, `None` for a wrong password
    pub async fn export_seed_phrase(&self, password: &str) -> Result<Option<Zeroizing<String>>, WalletError> {
        let wallet = self
            .current_wallet()
            .await?
            .ok_or(WalletError::NoWalletUnlocked)?;
        self.decrypt_phrase(&wallet, password)
    }

    // ============================================================================
    // Queries
    // ============================================================================

    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>, WalletError> {
        Ok(self.storage.list_wallets()?)
    }

    /// The unlocked wallet, or else the active one (locked)
    pub async fn current_wallet(&self) -> Result<Option<WalletRecord>, WalletError> {
        if let Some(session) = self.session.lock().await.as_ref() {
            return Ok(Some(session.wallet.clone()));
        }
        Ok(self.storage.get_active_wallet()?)
    }

    pub async fn is_unlocked(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Balance of `address`, or of the current wallet
    pub async fn get_balance(&self, address: Option<&str>) -> Result<AccountBalance, WalletError> {
        let address = self.resolve_address(address).await?;
        self.chain.connect().await?;
        Ok(self.chain.get_balance(&address).await?)
    }

    /// Fee for sending `amount` from the current wallet to `to`
    pub async fn estimate_fee(&self, to: &str, amount: u128) -> Result<u128, WalletError> {
        let from = self.resolve_address(None).await?;
        validate_address(to)?;
        self.chain.connect().await?;
        Ok(self.chain.estimate_fee(&from, to, amount).await?)
    }

    /// The 50 most recent transactions of `address`, or of the current wallet
    pub async fn transaction_history(
        &self,
        address: Option<&str>,
    ) -> Result<Vec<TransactionRecord>, WalletError> {
        let address = self.resolve_address(address).await?;
        Ok(self.storage.get_recent_transactions(&address, HISTORY_LIMIT)?)
    }

    /// Accounts of the current wallet
    pub async fn accounts(&self) -> Result<Vec<AccountRecord>, WalletError> {
        let wallet = self
            .current_wallet()
            .await?
            .ok_or(WalletError::NoWalletUnlocked)?;
        Ok(self.storage.wallet_accounts(wallet.id)?)
    }

    /// Latest polled balance of the unlocked wallet; `None` while locked
    pub fn balance_watch(&self) -> watch::Receiver<Option<AccountBalance>> {
        self.balance_tx.subscribe()
    }

    // ============================================================================
    // Keys
    // ============================================================================

    /// Derive the next account of the unlocked wallet
    pub async fn derive_account(
        &self,
        password: &str,
        name: Option<&str>,
    ) -> Result<AccountRecord, WalletError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(WalletError::NoWalletUnlocked)?;
        let wallet = &session.wallet;

        let phrase = self
            .decrypt_phrase(wallet, password)?
            .ok_or(WalletError::InvalidPassword)?;

        let index = self
            .storage
            .wallet_accounts(wallet.id)?
            .iter()
            .map(|a| a.index + 1)
            .max()
            .unwrap_or(1);
        let name = match name {
            Some(name) => Some(validate_name(name)?),
            None => None,
        };
        let pair = self.keyring.derive_account(&phrase, index, name.as_deref())?;

        let account = self.storage.add_account(NewAccount {
            wallet_id: wallet.id,
            index,
            name: pair.label().to_string(),
            derivation_path: account_derivation_path(index),
            address: pair.address().to_string(),
            public_key: pair.public_key_hex(),
        })?;
        log::info!("Derived account {} of wallet {}", index, wallet.id);
        Ok(account)
    }

    /// Sign an arbitrary message with the unlocked wallet's key
    pub async fn sign_message(&self, message: &[u8]) -> Result<Signature, WalletError> {
        let session = self.session.lock().await;
        let session = session.as_ref().ok_or(WalletError::NoWalletUnlocked)?;
        Ok(self.keyring.sign(&session.keypair, message)?)
    }

    /// Check a signature made by `address`
    pub fn verify_message(&self, message: &[u8], signature: &[u8], address: &str) -> bool {
        self.keyring.verify(message, signature, address)
    }

    // ============================================================================
    // Transfers
    // ============================================================================

    /// Send `amount` base units from the unlocked wallet to `to`.
    ///
    /// The password is re-checked on every call and the signer re-derived
    /// from the decrypted phrase. Balance and fee are read from the node
    /// without holding the session, which is checked again before the record
    /// is stored. The record then follows the chain's status updates, even if
    /// the wallet is locked while the transfer is outstanding.
    pub async fn send_transaction(
        &self,
        to: &str,
        amount: u128,
        password: &str,
    ) -> Result<TransferReceipt, WalletError> {
        let (wallet, signer) = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(WalletError::NoWalletUnlocked)?;
            let wallet = session.wallet.clone();

            let dest = validate_address(to)?;
            if amount == 0 {
                return Err(WalletError::InvalidAmount("amount must be positive".to_string()));
            }
            if &dest == session.keypair.public_key() {
                return Err(WalletError::SelfTransfer);
            }

            let phrase = self
                .decrypt_phrase(&wallet, password)?
                .ok_or(WalletError::InvalidPassword)?;
            let signer = self.keyring.create_from_mnemonic(&phrase, &wallet.name)?;
            drop(phrase);
            if signer.public_key() != session.keypair.public_key() {
                return Err(WalletError::Internal("re-derived signer does not match wallet".to_string()));
            }
            (wallet, signer)
        };

        self.chain.connect().await?;
        let balance = self.chain.get_balance(&wallet.address).await?;
        let fee = self.chain.estimate_fee(&wallet.address, to, amount).await?;
        let required = amount
            .checked_add(fee)
            .ok_or_else(|| WalletError::InvalidAmount("amount overflows".to_string()))?;
        if required > balance.free {
            log::warn!(
                "Rejected transfer from {}: insufficient balance",
                ss58::short(&wallet.address)
            );
            return Err(WalletError::InsufficientBalance {
                available: balance.free,
                required,
            });
        }

        let record = {
            let session = self.session.lock().await;
            if session.as_ref().map(UnlockedSession::wallet_id) != Some(wallet.id) {
                log::warn!("Wallet {} was locked before its transfer was stored", wallet.id);
                return Err(WalletError::NoWalletUnlocked);
            }
            self.storage.insert_transaction(NewTransaction {
                from: wallet.address.clone(),
                to: to.to_string(),
                amount,
                fee: Some(fee),
                kind: TxKind::Send,
            })?
        };

        let watch = match self.chain.submit_transfer(&signer, to, amount).await {
            Ok(watch) => watch,
            Err(e) if e.is_indeterminate() => {
                log::warn!("Submission of transaction {} unconfirmed: {}", record.id, e);
                return Err(e.into());
            }
            Err(e) => {
                mark_failed(&self.storage, record.id, None, &e.to_string())?;
                return Err(e.into());
            }
        };

        track_transfer(self.storage.clone(), record.id, watch).await
    }

    // ============================================================================
    // Helpers
    // ============================================================================

    /// Decrypt the phrase of `wallet`. A wrong password gives `Ok(None)`.
    fn decrypt_phrase(
        &self,
        wallet: &WalletRecord,
        password: &str,
    ) -> Result<Option<Zeroizing<String>>, WalletError> {
        let cipher = VaultCipher::new(wallet.kdf);
        match cipher.decrypt_string(&wallet.encrypted_payload(), password) {
            Ok(phrase) => Ok(Some(phrase)),
            Err(CryptoError::DecryptionFailed) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_address(&self, address: Option<&str>) -> Result<String, WalletError> {
        match address {
            Some(address) => {
                validate_address(address)?;
                Ok(address.to_string())
            }
            None => self
                .current_wallet()
                .await?
                .map(|w| w.address)
                .ok_or(WalletError::NoWalletUnlocked),
        }
    }

    /// Swap the session, stopping the old poller and starting a new one
    fn replace_session(&self, slot: &mut Option<UnlockedSession>, next: Option<UnlockedSession>) {
        // dropping the previous session stops its poller
        *slot = None;
        self.balance_tx.send_replace(None);

        if let Some(mut session) = next {
            let poller = BalancePoller::start(
                self.chain.clone(),
                session.wallet.address.clone(),
                self.config.balance_poll_interval,
                self.balance_tx.clone(),
            );
            session.attach_poller(poller);
            *slot = Some(session);
        }
    }
}

/// Follow a submitted transfer and mirror each event into its record.
/// Depends only on the store, not on the session.
async fn track_transfer(
    storage: Arc<Storage>,
    record_id: u64,
    mut watch: TransferWatch,
) -> Result<TransferReceipt, WalletError> {
    let mut tx_hash: Option<String> = None;
    let mut store_error: Option<StorageError> = None;

    let mut on_status = |event: &TransferEvent| {
        let next = match event {
            TransferEvent::Submitted { tx_hash: hash } => {
                tx_hash = Some(hash.clone());
                TxState::Submitted { hash: hash.clone() }
            }
            TransferEvent::InBlock { block_hash } => TxState::InBlock {
                hash: tx_hash.clone().unwrap_or_default(),
                block_hash: block_hash.clone(),
            },
            TransferEvent::Finalized {
                block_hash,
                block_number,
            } => TxState::Finalized {
                hash: tx_hash.clone().unwrap_or_default(),
                block_hash: block_hash.clone(),
                block_number: *block_number,
            },
            TransferEvent::Failed { reason } => TxState::Failed {
                hash: tx_hash.clone(),
                reason: reason.clone(),
            },
        };
        if let Err(e) = storage.update_transaction_state(record_id, next) {
            log::error!("Could not update transaction {}: {}", record_id, e);
            store_error.get_or_insert(e);
        }
    };

    let result = watch.wait_finalized(&mut on_status).await;

    match result {
        Ok(receipt) => {
            log::info!("Transaction {} finalized in {}", receipt.tx_hash, receipt.block_hash);
            match store_error {
                Some(e) => Err(e.into()),
                None => Ok(receipt),
            }
        }
        Err(ChainError::TransferFailed(reason)) => {
            log::error!("Transaction record {} failed: {}", record_id, reason);
            mark_failed(&storage, record_id, watch.tx_hash().map(str::to_string), &reason)?;
            Err(ChainError::TransferFailed(reason).into())
        }
        // the extrinsic may still land, so the record keeps its last state
        Err(e) => {
            log::warn!("Lost track of transaction record {}: {}", record_id, e);
            Err(e.into())
        }
    }
}

/// Mark a record failed unless it already reached a final state
fn mark_failed(
    storage: &Storage,
    record_id: u64,
    hash: Option<String>,
    reason: &str,
) -> Result<(), StorageError> {
    let current = storage
        .get_transaction(record_id)?
        .ok_or(StorageError::TransactionNotFound(record_id))?;
    if current.state.is_terminal() {
        return Ok(());
    }
    storage.update_transaction_state(
        record_id,
        TxState::Failed {
            hash,
            reason: reason.to_string(),
        },
    )?;
    Ok(())
}

fn validate_name(name: &str) -> Result<String, WalletError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(WalletError::InvalidName("name cannot be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

fn validate_address(address: &str) -> Result<[u8; 32], WalletError> {
    ss58::decode_public_key(address).map_err(|e| WalletError::InvalidAddress(e.to_string()))
}
