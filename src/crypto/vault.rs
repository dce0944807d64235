//! Password-based vault encryption
//!
//! Keys are stretched with Argon2id (tunable cost) and payloads sealed with
//! XChaCha20-Poly1305. Every `encrypt` call draws a fresh 24-byte nonce and
//! 32-byte salt from the OS RNG. Decryption failures of any kind surface as
//! the single [`CryptoError::DecryptionFailed`].

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const SALT_LEN: usize = 32;

const PASSWORD_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

type Blake2b128 = Blake2b<U16>;

/// Argon2id cost parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536, // 64 MiB
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests
    pub fn insecure_fast() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn argon2(&self) -> Result<Argon2<'static>, CryptoError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|e| CryptoError::KeyDerivation(format!("invalid Argon2 parameters: {}", e)))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

/// 256-bit key stretched from a password. Zeroized on drop, never printed.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

/// Output of [`VaultCipher::encrypt`], all fields base64
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    #[serde(rename = "encrypted")]
    pub ciphertext: String,
    pub nonce: String,
    pub salt: String,
}

/// Self-contained encrypted blob plus a checksum over its plaintext
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub vault: String,
    pub checksum: String,
}

#[derive(Clone, Debug, Default)]
pub struct VaultCipher {
    params: KdfParams,
}

impl VaultCipher {
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Stretch `password` with Argon2id. A random salt is drawn when none is
    /// given; the salt actually used is returned alongside the key.
    pub fn derive_key(
        &self,
        password: &str,
        salt: Option<&[u8]>,
    ) -> Result<(DerivedKey, Vec<u8>), CryptoError> {
        let salt = match salt {
            Some(salt) => salt.to_vec(),
            None => random_bytes::<SALT_LEN>().to_vec(),
        };
        let mut key = [0u8; KEY_LEN];
        self.params
            .argon2()?
            .hash_password_into(password.as_bytes(), &salt, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok((DerivedKey(key), salt))
    }

    pub fn encrypt(&self, plaintext: &[u8], password: &str) -> Result<EncryptedPayload, CryptoError> {
        let salt = random_bytes::<SALT_LEN>();
        let nonce = random_bytes::<NONCE_LEN>();
        let (key, _) = self.derive_key(password, Some(&salt))?;

        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encoding("encryption failed".to_string()))?;

        Ok(EncryptedPayload {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce),
            salt: BASE64.encode(salt),
        })
    }

    pub fn decrypt(
        &self,
        payload: &EncryptedPayload,
        password: &str,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let ciphertext = decode_field(&payload.ciphertext)?;
        let nonce = decode_field(&payload.nonce)?;
        let salt = decode_field(&payload.salt)?;
        if nonce.len() != NONCE_LEN || salt.len() != SALT_LEN {
            return Err(CryptoError::DecryptionFailed);
        }

        let (key, _) = self
            .derive_key(password, Some(&salt))
            .map_err(|_| CryptoError::DecryptionFailed)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        cipher
            .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
            .map(Zeroizing::new)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Decrypt and require valid UTF-8
    pub fn decrypt_string(
        &self,
        payload: &EncryptedPayload,
        password: &str,
    ) -> Result<Zeroizing<String>, CryptoError> {
        let mut bytes = self.decrypt(payload, password)?;
        let text = String::from_utf8(std::mem::take(&mut *bytes))
            .map_err(|e| {
                let mut raw = e.into_bytes();
                raw.zeroize();
                CryptoError::DecryptionFailed
            })?;
        Ok(Zeroizing::new(text))
    }

    /// One-way password fingerprint (Argon2id PHC string)
    pub fn hash_password(&self, password: &str) -> Result<String, CryptoError> {
        let salt = SaltString::encode_b64(&random_bytes::<16>())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        self.params
            .argon2()?
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
    }

    pub fn verify_password(&self, password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        // parameters embedded in the PHC string take precedence
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    /// Serialize `data` to JSON, encrypt it and checksum the plaintext
    pub fn create_vault<T: Serialize>(&self, data: &T, password: &str) -> Result<Vault, CryptoError> {
        let json = Zeroizing::new(
            serde_json::to_vec(data).map_err(|e| CryptoError::Encoding(e.to_string()))?,
        );
        let encrypted = self.encrypt(&json, password)?;
        let vault = serde_json::to_string(&encrypted).map_err(|e| CryptoError::Encoding(e.to_string()))?;

        Ok(Vault {
            vault,
            checksum: BASE64.encode(checksum(&json)),
        })
    }

    /// Open a vault produced by [`create_vault`](Self::create_vault). A
    /// checksum mismatch is treated exactly like a wrong password.
    pub fn open_vault<T: DeserializeOwned>(
        &self,
        vault: &Vault,
        password: &str,
    ) -> Result<T, CryptoError> {
        let payload: EncryptedPayload =
            serde_json::from_str(&vault.vault).map_err(|_| CryptoError::DecryptionFailed)?;
        let json = self.decrypt(&payload, password)?;

        let expected = decode_field(&vault.checksum)?;
        let actual = checksum(&json);
        if !bool::from(actual.as_slice().ct_eq(expected.as_slice())) {
            log::warn!("Vault checksum mismatch");
            return Err(CryptoError::DecryptionFailed);
        }

        serde_json::from_slice(&json).map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Random password drawn from letters, digits and `!@#$%^&*`
    pub fn generate_password(length: usize) -> Zeroizing<String> {
        let mut rng = OsRng;
        Zeroizing::new(
            (0..length)
                .map(|_| PASSWORD_CHARSET[rng.gen_range(0..PASSWORD_CHARSET.len())] as char)
                .collect(),
        )
    }
}

fn checksum(data: &[u8]) -> Vec<u8> {
    Blake2b128::digest(data).to_vec()
}

fn decode_field(field: &str) -> Result<Vec<u8>, CryptoError> {
    BASE64.decode(field).map_err(|_| CryptoError::DecryptionFailed)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn cipher() -> VaultCipher {
        VaultCipher::new(KdfParams::insecure_fast())
    }

    #[test]
    fn roundtrip() {
        let cipher = cipher();
        for message in ["", "bottom drive obey lake", "ünïcødé ✓"] {
            let payload = cipher.encrypt(message.as_bytes(), "pw12345678").unwrap();
            let plain = cipher.decrypt_string(&payload, "pw12345678").unwrap();
            assert_eq!(plain.as_str(), message);
        }
    }

    #[test]
    fn wrong_password_fails() {
        let cipher = cipher();
        let payload = cipher.encrypt(b"secret", "pw12345678").unwrap();
        assert_eq!(
            cipher.decrypt(&payload, "wrong").unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn tampering_is_indistinguishable_from_wrong_password() {
        let cipher = cipher();
        let payload = cipher.encrypt(b"secret", "pw").unwrap();

        let mut raw = BASE64.decode(&payload.ciphertext).unwrap();
        raw[0] ^= 0xff;
        let tampered = EncryptedPayload {
            ciphertext: BASE64.encode(raw),
            ..payload.clone()
        };
        assert_eq!(cipher.decrypt(&tampered, "pw").unwrap_err(), CryptoError::DecryptionFailed);

        let bad_nonce = EncryptedPayload {
            nonce: "not base64!".to_string(),
            ..payload.clone()
        };
        assert_eq!(cipher.decrypt(&bad_nonce, "pw").unwrap_err(), CryptoError::DecryptionFailed);

        let short_salt = EncryptedPayload {
            salt: BASE64.encode([0u8; 4]),
            ..payload
        };
        assert_eq!(cipher.decrypt(&short_salt, "pw").unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn every_encryption_uses_fresh_randomness() {
        let cipher = cipher();
        let mut nonces = HashSet::new();
        let mut salts = HashSet::new();
        for _ in 0..16 {
            let payload = cipher.encrypt(b"same", "same").unwrap();
            assert!(nonces.insert(payload.nonce));
            assert!(salts.insert(payload.salt));
        }
    }

    #[test]
    fn derive_key_is_deterministic_for_same_salt() {
        let cipher = cipher();
        let (k1, salt) = cipher.derive_key("pw", None).unwrap();
        assert_eq!(salt.len(), SALT_LEN);
        let (k2, _) = cipher.derive_key("pw", Some(&salt)).unwrap();
        let (k3, _) = cipher.derive_key("other", Some(&salt)).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        assert_ne!(k1.as_bytes(), k3.as_bytes());
    }

    #[test]
    fn invalid_kdf_params_are_rejected() {
        let cipher = VaultCipher::new(KdfParams {
            iterations: 0,
            ..KdfParams::insecure_fast()
        });
        assert!(matches!(cipher.derive_key("pw", None), Err(CryptoError::KeyDerivation(_))));
    }

    #[test]
    fn password_hash_verification() {
        let cipher = cipher();
        let hash = cipher.hash_password("pw12345678").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(cipher.verify_password("pw12345678", &hash));
        assert!(!cipher.verify_password("wrong", &hash));
        assert!(!cipher.verify_password("pw12345678", "garbage"));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Backup {
        name: String,
        phrase: String,
    }

    #[test]
    fn vault_roundtrip_and_integrity() {
        let cipher = cipher();
        let backup = Backup {
            name: "W1".to_string(),
            phrase: "bottom drive obey".to_string(),
        };
        let vault = cipher.create_vault(&backup, "pw").unwrap();
        let opened: Backup = cipher.open_vault(&vault, "pw").unwrap();
        assert_eq!(opened, backup);

        assert!(cipher.open_vault::<Backup>(&vault, "wrong").is_err());

        let forged = Vault {
            checksum: BASE64.encode([0u8; 16]),
            ..vault
        };
        assert_eq!(
            cipher.open_vault::<Backup>(&forged, "pw").unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn generated_passwords_use_charset() {
        let password = VaultCipher::generate_password(24);
        assert_eq!(password.len(), 24);
        assert!(password.bytes().all(|b| PASSWORD_CHARSET.contains(&b)));
        assert_ne!(*password, *VaultCipher::generate_password(24));
    }
}
