//! SS58 address encoding
//!
//! `base58(prefix || public_key || checksum)` where the checksum is the
//! first two bytes of `BLAKE2b-512("SS58PRE" || prefix || public_key)`.
//! Only the 32-byte account id form is supported.

use blake2::{Blake2b512, Digest};

use crate::error::CryptoError;

/// Generic Substrate prefix, used by development chains
pub const GENERIC_PREFIX: u16 = 42;

const CHECKSUM_LEN: usize = 2;
const SS58_CONTEXT: &[u8] = b"SS58PRE";

fn checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let mut hasher = Blake2b512::new();
    hasher.update(SS58_CONTEXT);
    hasher.update(data);
    let hash = hasher.finalize();
    [hash[0], hash[1]]
}

fn encode_prefix(prefix: u16) -> Vec<u8> {
    if prefix < 64 {
        vec![prefix as u8]
    } else {
        // Two-byte form, see the SS58 registry format description
        let first = (((prefix & 0b0000_0000_1111_1100) as u8) >> 2) | 0b0100_0000;
        let second = ((prefix >> 8) as u8) | (((prefix & 0b0000_0000_0000_0011) as u8) << 6);
        vec![first, second]
    }
}

/// Encode a 32-byte public key as an SS58 address
pub fn encode(public_key: &[u8; 32], prefix: u16) -> String {
    let mut data = encode_prefix(prefix & 0b0011_1111_1111_1111);
    data.extend_from_slice(public_key);
    let check = checksum(&data);
    data.extend_from_slice(&check);
    bs58::encode(data).into_string()
}

/// Decode an SS58 address into its prefix and 32-byte public key
pub fn decode(address: &str) -> Result<(u16, [u8; 32]), CryptoError> {
    let invalid = |reason: &str| CryptoError::InvalidAddress(reason.to_string());

    let data = bs58::decode(address.trim())
        .into_vec()
        .map_err(|_| invalid("not base58"))?;

    let (prefix, prefix_len) = match data.first() {
        Some(&b) if b < 64 => (b as u16, 1),
        Some(&b) if b < 128 => {
            let second = *data.get(1).ok_or_else(|| invalid("truncated prefix"))?;
            let lower = ((b << 2) | (second >> 6)) as u16;
            let upper = (second & 0b0011_1111) as u16;
            (lower | (upper << 8), 2)
        }
        Some(_) => return Err(invalid("reserved prefix")),
        None => return Err(invalid("empty")),
    };

    if data.len() != prefix_len + 32 + CHECKSUM_LEN {
        return Err(invalid("unexpected length"));
    }

    let body_end = prefix_len + 32;
    let expected = checksum(&data[..body_end]);
    if data[body_end..] != expected {
        return Err(invalid("checksum mismatch"));
    }

    let mut public_key = [0u8; 32];
    public_key.copy_from_slice(&data[prefix_len..body_end]);
    Ok((prefix, public_key))
}

/// Decode an address and return its public key, whatever the prefix
pub fn decode_public_key(address: &str) -> Result<[u8; 32], CryptoError> {
    decode(address).map(|(_, key)| key)
}

/// Shorten an address for logs and display, e.g. `5Grwva...utQY`
pub fn short(address: &str) -> String {
    if address.len() <= 10 {
        return address.to_string();
    }
    format!("{}...{}", &address[..6], &address[address.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;

    // Alice's well-known dev account
    const ALICE_PUBLIC: &str = "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";
    const ALICE_ADDRESS: &str = "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY";

    fn alice_key() -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&hex::decode(ALICE_PUBLIC).unwrap());
        key
    }

    #[test]
    fn encodes_known_address() {
        assert_eq!(encode(&alice_key(), GENERIC_PREFIX), ALICE_ADDRESS);
    }

    #[test]
    fn decodes_known_address() {
        let (prefix, key) = decode(ALICE_ADDRESS).unwrap();
        assert_eq!(prefix, 42);
        assert_eq!(key, alice_key());
    }

    #[test]
    fn rejects_bad_checksum() {
        let mut chars: Vec<char> = ALICE_ADDRESS.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'Y' { 'Z' } else { 'Y' };
        let tampered: String = chars.into_iter().collect();
        assert!(decode(&tampered).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode("").is_err());
        assert!(decode("not-an-address-0OIl").is_err());
        assert!(decode("5Grwva").is_err());
    }

    #[test]
    fn two_byte_prefix_roundtrip() {
        let address = encode(&alice_key(), 1000);
        let (prefix, key) = decode(&address).unwrap();
        assert_eq!(prefix, 1000);
        assert_eq!(key, alice_key());
    }

    #[test]
    fn short_form() {
        assert_eq!(short(ALICE_ADDRESS), "5Grwva...utQY");
    }
}
