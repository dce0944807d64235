//! Key material: recovery phrases, vault encryption, signing keys and
//! SS58 addresses.

pub mod keyring;
pub mod mnemonic;
pub mod ss58;
pub mod vault;

pub use keyring::{AccountDetails, KeyPair, KeyPairJson, KeyringService, Signature};
pub use mnemonic::{MnemonicEngine, WordCount};
pub use vault::{DerivedKey, EncryptedPayload, KdfParams, Vault, VaultCipher};
