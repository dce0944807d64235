use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::models::{
    AccountRecord, NewAccount, NewTransaction, NewWallet, TransactionRecord, TxState, WalletRecord,
};
use crate::error::StorageError;

const DB_FILE: &str = "wallet_db.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Database {
    next_wallet_id: u64,
    next_account_id: u64,
    next_transaction_id: u64,
    wallets: Vec<WalletRecord>,
    accounts: Vec<AccountRecord>,
    transactions: Vec<TransactionRecord>,
}

impl Database {
    fn allocate(counter: &mut u64) -> u64 {
        *counter += 1;
        *counter
    }

    fn wallet_mut(&mut self, id: u64) -> Result<&mut WalletRecord, StorageError> {
        self.wallets
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or(StorageError::WalletNotFound(id))
    }

    fn insert_wallet(&mut self, new: NewWallet) -> WalletRecord {
        let now = Utc::now();
        let record = WalletRecord {
            id: Self::allocate(&mut self.next_wallet_id),
            name: new.name,
            encrypted_seed: new.encrypted.ciphertext,
            nonce: new.encrypted.nonce,
            salt: new.encrypted.salt,
            kdf: new.kdf,
            address: new.address,
            public_key: new.public_key,
            created_at: now,
            last_used: now,
            is_active: false,
        };
        self.wallets.push(record.clone());
        record
    }

    fn insert_account(&mut self, new: NewAccount) -> Result<AccountRecord, StorageError> {
        if !self.wallets.iter().any(|w| w.id == new.wallet_id) {
            return Err(StorageError::WalletNotFound(new.wallet_id));
        }
        let record = AccountRecord {
            id: Self::allocate(&mut self.next_account_id),
            wallet_id: new.wallet_id,
            index: new.index,
            name: new.name,
            derivation_path: new.derivation_path,
            address: new.address,
            public_key: new.public_key,
            created_at: Utc::now(),
        };
        self.accounts.push(record.clone());
        Ok(record)
    }

    fn activate(&mut self, id: u64) {
        for wallet in self.wallets.iter_mut() {
            wallet.is_active = wallet.id == id;
        }
    }
}

/// JSON-file persistence for wallets, accounts and transaction history.
///
/// Every write replaces the whole file through a temp file and a rename, and
/// the in-memory copy only changes once that succeeded.
pub struct Storage {
    base_path: PathBuf,
    db: Mutex<Database>,
}

impl Storage {
    /// Open storage in the default base directory ("./wallets")
    pub fn new() -> Result<Self, StorageError> {
        Self::new_with_base_dir(PathBuf::from("./wallets"))
    }

    /// Open storage with a custom base directory
    pub fn new_with_base_dir(base_path: PathBuf) -> Result<Self, StorageError> {
        let path = base_path.join(DB_FILE);
        let db = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Database::default()
        };
        log::debug!("Opened wallet store at {:?}", path);
        Ok(Self {
            base_path,
            db: Mutex::new(db),
        })
    }

    /// Get the base directory path for wallet storage
    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>, StorageError> {
        self.db.lock().map_err(|_| StorageError::Poisoned)
    }

    fn read<T>(&self, f: impl FnOnce(&Database) -> T) -> Result<T, StorageError> {
        let db = self.lock()?;
        Ok(f(&db))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Database) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let mut db = self.lock()?;
        let mut next = db.clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *db = next;
        Ok(out)
    }

    fn persist(&self, db: &Database) -> Result<(), StorageError> {
        fs::create_dir_all(&self.base_path)?;
        let path = self.base_path.join(DB_FILE);
        let tmp = self.base_path.join(format!("{}.tmp", DB_FILE));

        let json = serde_json::to_string_pretty(db)?;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wallets
    // ------------------------------------------------------------------

    pub fn create_wallet(&self, new: NewWallet) -> Result<WalletRecord, StorageError> {
        self.write(|db| {
            let record = db.insert_wallet(new);
            log::info!("Stored wallet {} ('{}')", record.id, record.name);
            Ok(record)
        })
    }

    /// Store a wallet together with its first account and make it the only
    /// active wallet, all in one file write. `account.wallet_id` is replaced
    /// by the id of the new wallet.
    pub fn create_wallet_with_main_account(
        &self,
        new: NewWallet,
        account: NewAccount,
    ) -> Result<(WalletRecord, AccountRecord), StorageError> {
        self.write(|db| {
            let mut wallet = db.insert_wallet(new);
            db.activate(wallet.id);
            wallet.is_active = true;
            let account = db.insert_account(NewAccount {
                wallet_id: wallet.id,
                ..account
            })?;
            log::info!("Stored wallet {} ('{}') with its main account", wallet.id, wallet.name);
            Ok((wallet, account))
        })
    }

    pub fn get_wallet(&self, id: u64) -> Result<Option<WalletRecord>, StorageError> {
        self.read(|db| db.wallets.iter().find(|w| w.id == id).cloned())
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletRecord>, StorageError> {
        self.read(|db| db.wallets.clone())
    }

    pub fn get_active_wallet(&self) -> Result<Option<WalletRecord>, StorageError> {
        self.read(|db| db.wallets.iter().find(|w| w.is_active).cloned())
    }

    /// Make `id` the only active wallet
    pub fn set_active_wallet(&self, id: u64) -> Result<(), StorageError> {
        self.write(|db| {
            if !db.wallets.iter().any(|w| w.id == id) {
                return Err(StorageError::WalletNotFound(id));
            }
            db.activate(id);
            Ok(())
        })
    }

    pub fn touch_wallet(&self, id: u64) -> Result<(), StorageError> {
        self.write(|db| {
            db.wallet_mut(id)?.last_used = Utc::now();
            Ok(())
        })
    }

    /// Remove a wallet and its accounts. Transaction history is kept.
    pub fn delete_wallet(&self, id: u64) -> Result<(), StorageError> {
        self.write(|db| {
            let before = db.wallets.len();
            db.wallets.retain(|w| w.id != id);
            if db.wallets.len() == before {
                return Err(StorageError::WalletNotFound(id));
            }
            db.accounts.retain(|a| a.wallet_id != id);
            log::warn!("Deleted wallet {} and its accounts", id);
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub fn add_account(&self, new: NewAccount) -> Result<AccountRecord, StorageError> {
        self.write(|db| db.insert_account(new))
    }

    /// Accounts of a wallet ordered by derivation index
    pub fn wallet_accounts(&self, wallet_id: u64) -> Result<Vec<AccountRecord>, StorageError> {
        self.read(|db| {
            let mut accounts: Vec<_> = db
                .accounts
                .iter()
                .filter(|a| a.wallet_id == wallet_id)
                .cloned()
                .collect();
            accounts.sort_by_key(|a| a.index);
            accounts
        })
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Record a transaction in the `Unsubmitted` state
    pub fn insert_transaction(&self, new: NewTransaction) -> Result<TransactionRecord, StorageError> {
        self.write(|db| {
            let record = TransactionRecord {
                id: Database::allocate(&mut db.next_transaction_id),
                from: new.from,
                to: new.to,
                amount: new.amount,
                fee: new.fee,
                state: TxState::Unsubmitted,
                timestamp: Utc::now(),
                kind: new.kind,
                error_message: None,
            };
            db.transactions.push(record.clone());
            Ok(record)
        })
    }

    /// Move a transaction forward. Backward moves and moves out of a final
    /// state fail with `InvalidTransition`.
    pub fn update_transaction_state(
        &self,
        id: u64,
        state: TxState,
    ) -> Result<TransactionRecord, StorageError> {
        self.write(|db| {
            let record = db
                .transactions
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(StorageError::TransactionNotFound(id))?;

            if !record.state.can_transition_to(&state) {
                return Err(StorageError::InvalidTransition {
                    from: record.state.name().to_string(),
                    to: state.name().to_string(),
                });
            }

            if let TxState::Failed { reason, .. } = &state {
                record.error_message = Some(reason.clone());
            }
            log::debug!("Transaction {}: {} -> {}", id, record.state.name(), state.name());
            record.state = state;
            Ok(record.clone())
        })
    }

    pub fn get_transaction(&self, id: u64) -> Result<Option<TransactionRecord>, StorageError> {
        self.read(|db| db.transactions.iter().find(|t| t.id == id).cloned())
    }

    /// Latest transactions sent from or to `address`, newest first
    pub fn get_recent_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StorageError> {
        self.read(|db| {
            let mut matching: Vec<_> = db
                .transactions
                .iter()
                .filter(|t| t.from == address || t.to == address)
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
            matching.truncate(limit);
            matching
        })
    }
}
