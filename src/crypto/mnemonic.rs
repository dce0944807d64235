//! BIP39 recovery phrases
//!
//! Generation uses OS entropy, validation checks word count, wordlist
//! membership and the checksum. Two seed forms are exposed: the standard
//! 64-byte BIP39 seed and the 32-byte Substrate "mini secret" that the
//! keyring derives signing keys from.

use bip39::{Language, Mnemonic};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use zeroize::{Zeroize, Zeroizing};

use crate::error::CryptoError;

const PBKDF2_ROUNDS: u32 = 2048;

/// Supported phrase lengths for generation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WordCount {
    #[default]
    Twelve,
    TwentyFour,
}

impl WordCount {
    fn entropy_len(self) -> usize {
        match self {
            WordCount::Twelve => 16,
            WordCount::TwentyFour => 32,
        }
    }

    pub fn words(self) -> usize {
        match self {
            WordCount::Twelve => 12,
            WordCount::TwentyFour => 24,
        }
    }
}

pub struct MnemonicEngine;

impl MnemonicEngine {
    /// Generate a new random phrase
    pub fn generate(count: WordCount) -> Result<Zeroizing<String>, CryptoError> {
        let mut entropy = [0u8; 32];
        let entropy = &mut entropy[..count.entropy_len()];
        OsRng.fill_bytes(entropy);

        let result = Mnemonic::from_entropy_in(Language::English, entropy)
            .map(|m| Zeroizing::new(m.to_string()))
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()));

        entropy.zeroize();
        result
    }

    /// Lower-case, trim and collapse whitespace
    pub fn normalize(phrase: &str) -> Zeroizing<String> {
        let words: Vec<String> = phrase
            .split_whitespace()
            .map(|w| w.to_lowercase())
            .collect();
        Zeroizing::new(words.join(" "))
    }

    /// Check word count, wordlist membership and checksum
    pub fn validate(phrase: &str) -> bool {
        Self::parse(phrase).is_ok()
    }

    /// Standard 64-byte BIP39 seed
    pub fn to_seed(
        phrase: &str,
        passphrase: Option<&str>,
    ) -> Result<Zeroizing<[u8; 64]>, CryptoError> {
        let mnemonic = Self::parse(phrase)?;
        Ok(Zeroizing::new(mnemonic.to_seed(passphrase.unwrap_or(""))))
    }

    /// Substrate mini secret: PBKDF2-HMAC-SHA512 over the phrase entropy
    pub fn to_mini_secret(
        phrase: &str,
        passphrase: Option<&str>,
    ) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let mnemonic = Self::parse(phrase)?;
        let entropy = Zeroizing::new(mnemonic.to_entropy());
        let salt = Zeroizing::new(format!("mnemonic{}", passphrase.unwrap_or("")));

        let mut seed = Zeroizing::new([0u8; 64]);
        pbkdf2::pbkdf2_hmac::<Sha512>(&entropy, salt.as_bytes(), PBKDF2_ROUNDS, &mut seed[..]);

        let mut mini = Zeroizing::new([0u8; 32]);
        mini.copy_from_slice(&seed[..32]);
        Ok(mini)
    }

    pub fn to_words(phrase: &str) -> Vec<String> {
        phrase.split_whitespace().map(str::to_string).collect()
    }

    pub fn from_words<S: AsRef<str>>(words: &[S]) -> String {
        words
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ")
            .trim()
            .to_string()
    }

    /// Mask a phrase for display, keeping only the first and last word
    pub fn mask(phrase: &str) -> String {
        let words: Vec<&str> = phrase.split_whitespace().collect();
        match (words.first(), words.last()) {
            (Some(first), Some(last)) if words.len() >= 3 => format!("{} ... {}", first, last),
            _ => "***".to_string(),
        }
    }

    fn parse(phrase: &str) -> Result<Mnemonic, CryptoError> {
        let normalized = Self::normalize(phrase);
        Mnemonic::parse_in_normalized(Language::English, &normalized)
            .map_err(|_| CryptoError::InvalidMnemonic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_PHRASE: &str =
        "bottom drive obey lake curtain smoke basket hold race lonely fit walk";

    #[test]
    fn generated_phrases_validate() {
        for count in [WordCount::Twelve, WordCount::TwentyFour] {
            let phrase = MnemonicEngine::generate(count).unwrap();
            assert_eq!(phrase.split_whitespace().count(), count.words());
            assert!(MnemonicEngine::validate(&phrase));
        }
    }

    #[test]
    fn default_is_twelve_words() {
        let phrase = MnemonicEngine::generate(WordCount::default()).unwrap();
        assert_eq!(phrase.split_whitespace().count(), 12);
    }

    #[test]
    fn validation_normalizes_input() {
        let messy = format!("  {}  ", DEV_PHRASE.to_uppercase().replace(' ', "   "));
        assert!(MnemonicEngine::validate(&messy));
    }

    #[test]
    fn rejects_bad_checksum_with_valid_words() {
        // every word is in the list but the checksum does not match
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon";
        assert!(!MnemonicEngine::validate(phrase));
    }

    #[test]
    fn rejects_unknown_words_and_bad_counts() {
        assert!(!MnemonicEngine::validate("hello world"));
        assert!(!MnemonicEngine::validate(""));
        let with_typo = DEV_PHRASE.replace("bottom", "bottomm");
        assert!(!MnemonicEngine::validate(&with_typo));
    }

    #[test]
    fn last_word_corruption_is_caught() {
        let valid = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        assert!(MnemonicEngine::validate(valid));
        assert!(!MnemonicEngine::validate(&valid.replace("about", "abandon")));

        let valid = "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong";
        assert!(MnemonicEngine::validate(valid));
        assert!(!MnemonicEngine::validate(&valid.replace("wrong", "zoo")));
    }

    #[test]
    fn random_single_word_corruption_is_mostly_caught() {
        let mut misses = 0;
        let trials = 64;
        for i in 0..trials {
            let phrase = MnemonicEngine::generate(WordCount::Twelve).unwrap();
            let mut words: Vec<&str> = phrase.split_whitespace().collect();
            let position = i % words.len();
            words[position] = if words[position] == "zoo" { "abandon" } else { "zoo" };
            if MnemonicEngine::validate(&words.join(" ")) {
                misses += 1;
            }
        }
        // a 4-bit checksum lets about 1 in 16 corruptions through
        assert!(misses < trials / 3, "{} of {} corruptions passed", misses, trials);
    }

    #[test]
    fn to_seed_is_deterministic_and_rejects_invalid() {
        let a = MnemonicEngine::to_seed(DEV_PHRASE, None).unwrap();
        let b = MnemonicEngine::to_seed(DEV_PHRASE, None).unwrap();
        assert_eq!(*a, *b);
        let c = MnemonicEngine::to_seed(DEV_PHRASE, Some("extra")).unwrap();
        assert_ne!(*a, *c);
        assert_eq!(
            MnemonicEngine::to_seed("hello world", None).unwrap_err(),
            CryptoError::InvalidMnemonic
        );
    }

    #[test]
    fn mini_secret_matches_substrate_vector() {
        // `subkey inspect` of the dev phrase reports this secret seed
        let mini = MnemonicEngine::to_mini_secret(DEV_PHRASE, None).unwrap();
        assert_eq!(
            hex::encode(*mini),
            "fac7959dbfe72f052e5a0c3c8d6530f202b02fd8f9f5ca3580ec8deb7797479e"
        );
    }

    #[test]
    fn mask_and_words() {
        assert_eq!(MnemonicEngine::mask(DEV_PHRASE), "bottom ... walk");
        assert_eq!(MnemonicEngine::mask("one two"), "***");
        let words = MnemonicEngine::to_words(DEV_PHRASE);
        assert_eq!(words.len(), 12);
        assert_eq!(MnemonicEngine::from_words(&words), DEV_PHRASE);
    }
}
