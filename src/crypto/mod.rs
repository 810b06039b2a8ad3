//! Signing primitives and the pluggable input-signature check.
//!
//! Keys are Ed25519. Consensus only requires a `SignatureVerifier`; the
//! default `FormatVerifier` checks shape alone, `Ed25519Verifier` checks the
//! actual signature.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::core::types::{double_sha256, Address, Hash256, Transaction};

pub mod txid;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;
/// Length of an Ed25519 public key
pub const PUBLIC_KEY_LEN: usize = 32;

/// Prefix of every address derived from a public key
pub const ADDRESS_PREFIX: &str = "fs1";

/// Holds an Ed25519 signing key and its verifying key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key_bytes())
    }

    /// Sign a 32-byte hash.
    pub fn sign_hash(&self, hash: &Hash256) -> [u8; 64] {
        self.signing_key.sign(hash).to_bytes()
    }
}

/// Verify an Ed25519 signature. Expects a 32-byte pubkey and a 64-byte signature.
pub fn verify_signature(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    let Ok(pk): Result<&[u8; PUBLIC_KEY_LEN], _> = pubkey.try_into() else {
        return false;
    };
    let Ok(sig): Result<&[u8; SIGNATURE_LEN], _> = signature.try_into() else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pk) else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(sig)).is_ok()
}

/// Address for a public key: prefix plus hex of the first 20 bytes of
/// double-SHA256(pubkey).
pub fn address_from_public_key(pubkey: &[u8]) -> Address {
    let hash = double_sha256(pubkey);
    format!("{}{}", ADDRESS_PREFIX, hex::encode(&hash[..20]))
}

/// Canonical signing hash for tx inputs (v1).
///
/// The txid already commits to every input's outpoint, address and value,
/// so binding the id and the input index pins the signature to the exact
/// UTXO being spent.
pub fn tx_signing_hash_v1(tx: &Transaction, input_index: usize) -> Hash256 {
    const TAG: &[u8] = b"FSIM_TXSIG_V1";

    let mut buf = Vec::with_capacity(TAG.len() + 32 + 4);
    buf.extend_from_slice(TAG);
    buf.extend_from_slice(&tx.compute_id());
    buf.extend_from_slice(&(input_index as u32).to_le_bytes());
    double_sha256(&buf)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureFault {
    #[error("signature is missing")]
    Missing,
    #[error("signature does not verify")]
    Invalid,
}

/// Checks the unlocking data of one transaction input. Callers have already
/// matched the input's address and value against the spent UTXO.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, tx: &Transaction, input_index: usize) -> Result<(), SignatureFault>;
}

/// Shape-only check: a 64-byte signature and a 32-byte public key.
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatVerifier;

impl SignatureVerifier for FormatVerifier {
    fn verify(&self, tx: &Transaction, input_index: usize) -> Result<(), SignatureFault> {
        let input = tx.inputs.get(input_index).ok_or(SignatureFault::Invalid)?;
        if input.signature.is_empty() {
            return Err(SignatureFault::Missing);
        }
        if input.signature.len() != SIGNATURE_LEN || input.public_key.len() != PUBLIC_KEY_LEN {
            return Err(SignatureFault::Invalid);
        }
        Ok(())
    }
}

/// Full check: the public key must hash to the input's address and the
/// signature must verify over `tx_signing_hash_v1`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, tx: &Transaction, input_index: usize) -> Result<(), SignatureFault> {
        FormatVerifier.verify(tx, input_index)?;
        let input = &tx.inputs[input_index];
        if address_from_public_key(&input.public_key) != input.address {
            return Err(SignatureFault::Invalid);
        }
        let msg = tx_signing_hash_v1(tx, input_index);
        if verify_signature(&input.public_key, &msg, &input.signature) {
            Ok(())
        } else {
            Err(SignatureFault::Invalid)
        }
    }
}
