//! SCALE encoding of signed balance-transfer extrinsics (format version 4)
//!
//! Signed extensions covered: immortal era, compact nonce and a zero tip.
//! The additional signed data is spec version, transaction version and the
//! genesis hash twice (for the immortal era checkpoint).

use std::hash::Hasher;

use blake2::digest::consts::{U16, U32};
use blake2::{Blake2b, Digest};
use codec::{Compact, Encode};
use schnorrkel::Keypair;
use twox_hash::XxHash64;

use crate::config::CallIndex;
use crate::crypto::keyring::SIGNING_CONTEXT;

const SIGNED_V4: u8 = 0b1000_0000 | 4;
const MULTI_ADDRESS_ID: u8 = 0x00;
const MULTI_SIGNATURE_SR25519: u8 = 0x01;
const IMMORTAL_ERA: u8 = 0x00;

type Blake2b128 = Blake2b<U16>;
type Blake2b256 = Blake2b<U32>;

pub fn blake2_256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Blake2b256::digest(data));
    out
}

pub fn blake2_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Blake2b128::digest(data));
    out
}

pub fn twox_128(data: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for (seed, chunk) in out.chunks_exact_mut(8).enumerate() {
        let mut hasher = XxHash64::with_seed(seed as u64);
        hasher.write(data);
        chunk.copy_from_slice(&hasher.finish().to_le_bytes());
    }
    out
}

/// Storage key of `System.Account(account)`
pub fn system_account_key(account: &[u8; 32]) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + 16 + 16 + 32);
    key.extend_from_slice(&twox_128(b"System"));
    key.extend_from_slice(&twox_128(b"Account"));
    // Blake2_128Concat hasher
    key.extend_from_slice(&blake2_128(account));
    key.extend_from_slice(account);
    key
}

/// Runtime values that go into the signed payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeContext {
    pub genesis_hash: [u8; 32],
    pub spec_version: u32,
    pub transaction_version: u32,
}

/// `Balances.transfer_keep_alive(dest, value)`
pub fn transfer_call(index: CallIndex, dest: &[u8; 32], amount: u128) -> Vec<u8> {
    let mut call = vec![index.pallet, index.call, MULTI_ADDRESS_ID];
    call.extend_from_slice(dest);
    Compact(amount).encode_to(&mut call);
    call
}

fn extra(nonce: u64) -> Vec<u8> {
    let mut extra = vec![IMMORTAL_ERA];
    Compact(nonce).encode_to(&mut extra);
    Compact(0u128).encode_to(&mut extra);
    extra
}

fn additional(runtime: &RuntimeContext) -> Vec<u8> {
    let mut additional = Vec::with_capacity(8 + 64);
    runtime.spec_version.encode_to(&mut additional);
    runtime.transaction_version.encode_to(&mut additional);
    additional.extend_from_slice(&runtime.genesis_hash);
    additional.extend_from_slice(&runtime.genesis_hash);
    additional
}

/// Bytes the signer commits to. Payloads over 256 bytes are hashed first.
pub fn signing_payload(call: &[u8], nonce: u64, runtime: &RuntimeContext) -> Vec<u8> {
    let mut payload = call.to_vec();
    payload.extend_from_slice(&extra(nonce));
    payload.extend_from_slice(&additional(runtime));
    if payload.len() > 256 {
        blake2_256(&payload).to_vec()
    } else {
        payload
    }
}

fn assemble(signer: &[u8; 32], signature: &[u8; 64], call: &[u8], nonce: u64) -> Vec<u8> {
    let mut body = vec![SIGNED_V4, MULTI_ADDRESS_ID];
    body.extend_from_slice(signer);
    body.push(MULTI_SIGNATURE_SR25519);
    body.extend_from_slice(signature);
    body.extend_from_slice(&extra(nonce));
    body.extend_from_slice(call);

    let mut extrinsic = Compact(body.len() as u32).encode();
    extrinsic.extend_from_slice(&body);
    extrinsic
}

/// Length-prefixed signed extrinsic ready for `author_submitExtrinsic`
pub fn signed_transfer(
    signer: &Keypair,
    index: CallIndex,
    dest: &[u8; 32],
    amount: u128,
    nonce: u64,
    runtime: &RuntimeContext,
) -> Vec<u8> {
    let call = transfer_call(index, dest, amount);
    let payload = signing_payload(&call, nonce, runtime);
    let signature = signer.sign_simple(SIGNING_CONTEXT, &payload).to_bytes();
    assemble(&signer.public.to_bytes(), &signature, &call, nonce)
}

/// Same shape as [`signed_transfer`] with a zeroed signature, for
/// `TransactionPaymentApi_query_info`
pub fn unsigned_fee_transfer(
    from: &[u8; 32],
    index: CallIndex,
    dest: &[u8; 32],
    amount: u128,
    nonce: u64,
) -> Vec<u8> {
    let call = transfer_call(index, dest, amount);
    assemble(from, &[0u8; 64], &call, nonce)
}

/// Hash under which the node reports the extrinsic
pub fn extrinsic_hash(extrinsic: &[u8]) -> [u8; 32] {
    blake2_256(extrinsic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Decode;
    use schnorrkel::{ExpansionMode, MiniSecretKey, Signature};

    const ALICE: &str = "d43593c715fdd31c61141abd04a99fd6822c8558854ccde39a5684e7a56da27d";

    fn alice() -> [u8; 32] {
        let mut key = [0u8; 32];
        key.copy_from_slice(&hex::decode(ALICE).unwrap());
        key
    }

    fn keypair() -> Keypair {
        MiniSecretKey::from_bytes(&[3u8; 32])
            .unwrap()
            .expand_to_keypair(ExpansionMode::Ed25519)
    }

    fn runtime() -> RuntimeContext {
        RuntimeContext {
            genesis_hash: [9u8; 32],
            spec_version: 100,
            transaction_version: 1,
        }
    }

    #[test]
    fn system_account_key_layout() {
        assert_eq!(
            hex::encode(system_account_key(&alice())),
            format!(
                "26aa394eea5630e07c48ae0c9558cef7b99d880ec681799c0cf30e8886371da9de1e86a9a8c739864cf3cc5ec2bea59f{}",
                ALICE
            )
        );
    }

    #[test]
    fn transfer_call_encoding() {
        let call = transfer_call(CallIndex { pallet: 4, call: 3 }, &alice(), 12345);
        assert_eq!(&call[..3], &[4, 3, 0]);
        assert_eq!(&call[3..35], &alice());
        assert_eq!(Compact::<u128>::decode(&mut &call[35..]).unwrap().0, 12345);
    }

    #[test]
    fn signed_extrinsic_layout_and_signature() {
        let signer = keypair();
        let index = CallIndex::default();
        let ext = signed_transfer(&signer, index, &alice(), 1_000, 5, &runtime());

        let mut input = &ext[..];
        let len = Compact::<u32>::decode(&mut input).unwrap().0 as usize;
        assert_eq!(len, input.len());

        assert_eq!(input[0], 0x84);
        assert_eq!(input[1], MULTI_ADDRESS_ID);
        assert_eq!(&input[2..34], &signer.public.to_bytes());
        assert_eq!(input[34], MULTI_SIGNATURE_SR25519);

        let mut sig = [0u8; 64];
        sig.copy_from_slice(&input[35..99]);
        let call = transfer_call(index, &alice(), 1_000);
        let payload = signing_payload(&call, 5, &runtime());
        signer
            .public
            .verify_simple(SIGNING_CONTEXT, &payload, &Signature::from_bytes(&sig).unwrap())
            .unwrap();

        // extra: era, nonce 5, tip 0 then the call
        assert_eq!(&input[99..102], &[0x00, 5 << 2, 0x00]);
        assert_eq!(&input[102..], call.as_slice());
    }

    #[test]
    fn fee_payload_matches_signed_length() {
        let signer = keypair();
        let from = signer.public.to_bytes();
        let signed = signed_transfer(&signer, CallIndex::default(), &alice(), 77, 0, &runtime());
        let placeholder = unsigned_fee_transfer(&from, CallIndex::default(), &alice(), 77, 0);
        assert_eq!(signed.len(), placeholder.len());
        assert_ne!(extrinsic_hash(&signed), extrinsic_hash(&placeholder));
    }

    #[test]
    fn short_payloads_are_not_hashed() {
        let call = transfer_call(CallIndex::default(), &alice(), 1);
        let payload = signing_payload(&call, 0, &runtime());
        assert!(payload.starts_with(&call));
        assert_eq!(payload.len(), call.len() + 3 + 8 + 64);
    }
}
