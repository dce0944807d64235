//! Signing keypairs derived from recovery phrases
//!
//! Keys are sr25519 (Schnorr over Ristretto25519). The root key of a wallet
//! is the Substrate mini secret of its phrase, and further accounts come from
//! hard derivation along `//0//{index}`, matching `subkey inspect`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use schnorrkel::derive::ChainCode;
use schnorrkel::{ExpansionMode, Keypair, MiniSecretKey, PublicKey, Signature as SrSignature};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::mnemonic::MnemonicEngine;
use super::ss58;
use super::vault::{EncryptedPayload, VaultCipher};
use crate::error::CryptoError;

/// Signing context shared with Substrate runtimes
pub const SIGNING_CONTEXT: &[u8] = b"substrate";
const SELF_TEST_SEED: [u8; 32] = [7u8; 32];

type Blake2b256 = Blake2b<U32>;

/// Path segment used for the derived accounts of a wallet
pub fn account_derivation_path(index: u32) -> String {
    format!("//0//{}", index)
}

/// Chain code of a junction from its SCALE encoding: zero padded, or
/// blake2-256 hashed when longer than 32 bytes
fn junction_chain_code(encoded: &[u8]) -> [u8; 32] {
    let mut code = [0u8; 32];
    if encoded.len() > 32 {
        code.copy_from_slice(&Blake2b256::digest(encoded));
    } else {
        code[..encoded.len()].copy_from_slice(encoded);
    }
    code
}

/// Chain code of a numeric junction (a SCALE `u64`)
fn index_chain_code(index: u64) -> [u8; 32] {
    junction_chain_code(&index.to_le_bytes())
}

fn derive_hard(parent: &MiniSecretKey, chain_code: [u8; 32]) -> MiniSecretKey {
    parent
        .expand(ExpansionMode::Ed25519)
        .hard_derive_mini_secret_key(Some(ChainCode(chain_code)), b"")
        .0
}

fn mini_secret(bytes: &[u8]) -> Result<MiniSecretKey, CryptoError> {
    MiniSecretKey::from_bytes(bytes).map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// 64-byte sr25519 signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

/// Serializable form of a locked keypair
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairJson {
    pub address: String,
    pub label: String,
    pub public_key: String,
    pub encoded: EncryptedPayload,
}

/// Public view of an account
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountDetails {
    pub address: String,
    pub label: String,
    pub public_key: String,
}

/// Secret half of a pair. schnorrkel zeroizes both keys on drop.
struct SecretHalf {
    mini: MiniSecretKey,
    keypair: Keypair,
}

impl SecretHalf {
    fn new(mini: MiniSecretKey) -> Self {
        let keypair = mini.expand_to_keypair(ExpansionMode::Ed25519);
        Self { mini, keypair }
    }
}

/// An sr25519 keypair with its SS58 address.
///
/// While locked the secret half is absent and signing fails with
/// [`CryptoError::AccountLocked`].
pub struct KeyPair {
    label: String,
    address: String,
    public_key: [u8; 32],
    secret: Option<SecretHalf>,
    locked: Option<EncryptedPayload>,
}

impl KeyPair {
    fn from_mini(mini: MiniSecretKey, label: String, prefix: u16) -> Self {
        let secret = SecretHalf::new(mini);
        let public_key = secret.keypair.public.to_bytes();
        Self {
            label,
            address: ss58::encode(&public_key, prefix),
            public_key,
            secret: Some(secret),
            locked: None,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn public_key(&self) -> &[u8; 32] {
        &self.public_key
    }

    pub fn public_key_hex(&self) -> String {
        format!("0x{}", hex::encode(self.public_key))
    }

    pub fn is_locked(&self) -> bool {
        self.secret.is_none()
    }

    pub(crate) fn signing_keypair(&self) -> Result<&Keypair, CryptoError> {
        self.secret
            .as_ref()
            .map(|secret| &secret.keypair)
            .ok_or(CryptoError::AccountLocked)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("label", &self.label)
            .field("address", &self.address)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

pub struct KeyringService {
    ss58_prefix: u16,
    cipher: VaultCipher,
    initialized: AtomicBool,
}

impl KeyringService {
    pub fn new(ss58_prefix: u16, cipher: VaultCipher) -> Self {
        Self {
            ss58_prefix,
            cipher,
            initialized: AtomicBool::new(false),
        }
    }

    /// Check the signature backend once. Repeated calls are no-ops.
    pub fn init(&self) -> Result<(), CryptoError> {
        if self.is_initialized() {
            return Ok(());
        }

        let check = KeyPair::from_mini(mini_secret(&SELF_TEST_SEED)?, "self-test".to_string(), self.ss58_prefix);
        let message = b"keyring self-test";
        let signature = check.signing_keypair()?.sign_simple(SIGNING_CONTEXT, message);
        PublicKey::from_bytes(&check.public_key)
            .and_then(|key| key.verify_simple(SIGNING_CONTEXT, message, &signature))
            .map_err(|e| CryptoError::KeyDerivation(format!("signature self-test failed: {}", e)))?;

        self.initialized.store(true, Ordering::SeqCst);
        log::debug!("Keyring initialized (ss58 prefix {})", self.ss58_prefix);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn ss58_prefix(&self) -> u16 {
        self.ss58_prefix
    }

    fn ensure_init(&self) -> Result<(), CryptoError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(CryptoError::NotInitialized)
        }
    }

    fn root_secret(phrase: &str) -> Result<MiniSecretKey, CryptoError> {
        let bytes = MnemonicEngine::to_mini_secret(phrase, None)?;
        mini_secret(bytes.as_slice())
    }

    /// Root keypair of a phrase
    pub fn create_from_mnemonic(&self, phrase: &str, label: &str) -> Result<KeyPair, CryptoError> {
        self.ensure_init()?;
        let root = Self::root_secret(phrase)?;
        Ok(KeyPair::from_mini(root, label.to_string(), self.ss58_prefix))
    }

    pub fn create_from_seed(&self, seed: &[u8; 32], label: &str) -> Result<KeyPair, CryptoError> {
        self.ensure_init()?;
        Ok(KeyPair::from_mini(mini_secret(seed)?, label.to_string(), self.ss58_prefix))
    }

    /// Keypair at `//0//{index}` below the phrase root
    pub fn derive_account(
        &self,
        phrase: &str,
        index: u32,
        label: Option<&str>,
    ) -> Result<KeyPair, CryptoError> {
        self.ensure_init()?;
        let root = Self::root_secret(phrase)?;
        let purpose = derive_hard(&root, index_chain_code(0));
        let secret = derive_hard(&purpose, index_chain_code(u64::from(index)));

        let label = label
            .map(str::to_string)
            .unwrap_or_else(|| format!("Account {}", index + 1));
        Ok(KeyPair::from_mini(secret, label, self.ss58_prefix))
    }

    /// Encrypt the secret under `password` and drop it from the pair
    pub fn lock_account(&self, pair: &mut KeyPair, password: &str) -> Result<KeyPairJson, CryptoError> {
        self.ensure_init()?;
        let encoded = match (&pair.secret, &pair.locked) {
            (Some(secret), _) => {
                let bytes = Zeroizing::new(secret.mini.to_bytes());
                self.cipher.encrypt(bytes.as_slice(), password)?
            }
            (None, Some(existing)) => existing.clone(),
            (None, None) => return Err(CryptoError::AccountLocked),
        };

        pair.secret = None;
        pair.locked = Some(encoded.clone());

        Ok(KeyPairJson {
            address: pair.address.clone(),
            label: pair.label.clone(),
            public_key: pair.public_key_hex(),
            encoded,
        })
    }

    /// Restore the secret of a locked pair
    pub fn unlock_account(&self, pair: &mut KeyPair, password: &str) -> Result<(), CryptoError> {
        self.ensure_init()?;
        if !pair.is_locked() {
            return Ok(());
        }
        let encoded = pair.locked.as_ref().ok_or(CryptoError::AccountLocked)?;
        let bytes = self.cipher.decrypt(encoded, password)?;
        let mini = mini_secret(&bytes).map_err(|_| CryptoError::DecryptionFailed)?;

        let secret = SecretHalf::new(mini);
        if secret.keypair.public.to_bytes() != pair.public_key {
            return Err(CryptoError::DecryptionFailed);
        }
        pair.secret = Some(secret);
        Ok(())
    }

    /// Rebuild a locked pair from its JSON form
    pub fn from_json(&self, json: &KeyPairJson) -> Result<KeyPair, CryptoError> {
        self.ensure_init()?;
        let public_key = ss58::decode_public_key(&json.address)?;
        Ok(KeyPair {
            label: json.label.clone(),
            address: ss58::encode(&public_key, self.ss58_prefix),
            public_key,
            secret: None,
            locked: Some(json.encoded.clone()),
        })
    }

    pub fn sign(&self, pair: &KeyPair, message: &[u8]) -> Result<Signature, CryptoError> {
        self.ensure_init()?;
        let signature = pair.signing_keypair()?.sign_simple(SIGNING_CONTEXT, message);
        Ok(Signature(signature.to_bytes()))
    }

    /// Check `signature` over `message` against `address`. Malformed input
    /// yields `false`.
    pub fn verify(&self, message: &[u8], signature: &[u8], address: &str) -> bool {
        let Ok(public_key) = ss58::decode_public_key(address) else {
            return false;
        };
        let Ok(signature) = SrSignature::from_bytes(signature) else {
            return false;
        };
        PublicKey::from_bytes(&public_key)
            .map(|key| key.verify_simple(SIGNING_CONTEXT, message, &signature).is_ok())
            .unwrap_or(false)
    }

    pub fn account_details(&self, pair: &KeyPair) -> AccountDetails {
        AccountDetails {
            address: pair.address.clone(),
            label: pair.label.clone(),
            public_key: pair.public_key_hex(),
        }
    }
}
