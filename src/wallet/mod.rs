use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::ledger::{LedgerState, Utxo};
use crate::core::types::*;
use crate::crypto::{tx_signing_hash_v1, Keypair};

/// Pending spends are released after this long if they never confirm (ms)
pub const RESERVATION_TTL_MS: u64 = 60_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds { have: u64, need: u64 },
    #[error("amount must be positive")]
    ZeroAmount,
}

// ─── Key Derivation ─────────────────────────────────────────────────

/// Source of per-node signing keys
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, index: u32) -> Keypair;
}

/// Deterministic keys: secret = SHA-256(seed || index)
#[derive(Clone)]
pub struct Ed25519KeyDeriver {
    seed: [u8; 32],
}

impl Ed25519KeyDeriver {
    pub fn new(seed: [u8; 32]) -> Self { Self { seed } }

    /// Stretch a numeric simulation seed into a key seed
    pub fn from_u64(seed: u64) -> Self {
        let digest = Sha256::digest(seed.to_le_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self { seed: bytes }
    }

    pub fn seed_hex(&self) -> String { hex::encode(self.seed) }
}

impl KeyDeriver for Ed25519KeyDeriver {
    fn derive(&self, index: u32) -> Keypair {
        let mut hasher = Sha256::new();
        hasher.update(self.seed);
        hasher.update(index.to_le_bytes());
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&hasher.finalize());
        Keypair::from_secret_bytes(&secret)
    }
}

// ─── Wallet ─────────────────────────────────────────────────────────

/// Spends one address's outputs. Outputs used by a payment stay reserved
/// until they leave the ledger or the reservation expires.
#[derive(Clone)]
pub struct Wallet {
    keypair: Keypair,
    address: Address,
    label: String,
    reserved: HashMap<OutPoint, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSummary {
    pub label: String,
    pub address: Address,
    pub balance: u64,
    pub utxos: usize,
}

impl Wallet {
    pub fn new(keypair: Keypair, label: impl Into<String>) -> Self {
        let address = keypair.address();
        Self { keypair, address, label: label.into(), reserved: HashMap::new() }
    }

    pub fn derive(deriver: &dyn KeyDeriver, index: u32) -> Self {
        Self::new(deriver.derive(index), format!("node-{}", index))
    }

    pub fn address(&self) -> &str { &self.address }
    pub fn label(&self) -> &str { &self.label }
    pub fn keypair(&self) -> &Keypair { &self.keypair }
    pub fn reserved_count(&self) -> usize { self.reserved.len() }

    pub fn balance(&self, state: &LedgerState) -> u64 { state.balance(&self.address) }

    pub fn summary(&self, state: &LedgerState) -> WalletSummary {
        WalletSummary {
            label: self.label.clone(),
            address: self.address.clone(),
            balance: self.balance(state),
            utxos: state.address(&self.address).map_or(0, |d| d.utxos.len()),
        }
    }

    fn release_stale(&mut self, state: &LedgerState, now: u64) {
        let owned: Vec<OutPoint> = state
            .address(&self.address)
            .map(|d| d.utxos.iter().map(Utxo::outpoint).collect())
            .unwrap_or_default();
        self.reserved.retain(|op, until| *until > now && owned.contains(op));
    }

    /// Unreserved outputs, largest first, until `needed` is covered
    pub fn select_utxos(&mut self, state: &LedgerState, needed: u64, now: u64) -> Result<Vec<Utxo>, WalletError> {
        self.release_stale(state, now);
        let mut ours: Vec<Utxo> = state
            .address(&self.address)
            .map(|d| d.utxos.iter().filter(|u| !self.reserved.contains_key(&u.outpoint())).cloned().collect())
            .unwrap_or_default();
        ours.sort_by(|a, b| b.value.cmp(&a.value));

        let mut selected = Vec::new();
        let mut total = 0u64;
        for utxo in ours {
            total += utxo.value;
            selected.push(utxo);
            if total >= needed {
                return Ok(selected);
            }
        }
        Err(WalletError::InsufficientFunds { have: total, need: needed })
    }

    /// Build and sign a payment of `amount` to `to`, with change back to us
    pub fn build_payment(
        &mut self,
        state: &LedgerState,
        to: &str,
        amount: u64,
        fee: u64,
        now: u64,
    ) -> Result<Transaction, WalletError> {
        if amount == 0 {
            return Err(WalletError::ZeroAmount);
        }
        let needed = amount.saturating_add(fee);
        let selected = self.select_utxos(state, needed, now)?;
        let total_input: u64 = selected.iter().map(|u| u.value).sum();
        let change = total_input - needed;

        let mut outputs = vec![TxOutput { address: to.to_string(), value: amount }];
        if change > 0 {
            outputs.push(TxOutput { address: self.address.clone(), value: change });
        }
        let public_key = self.keypair.public_key_bytes().to_vec();
        let inputs: Vec<TxInput> = selected
            .iter()
            .map(|u| TxInput {
                previous_output: u.outpoint(),
                address: self.address.clone(),
                value: u.value,
                signature: vec![],
                public_key: public_key.clone(),
            })
            .collect();

        let mut tx = Transaction::new(inputs, outputs, now);
        for i in 0..tx.inputs.len() {
            let signing_hash = tx_signing_hash_v1(&tx, i);
            tx.inputs[i].signature = self.keypair.sign_hash(&signing_hash).to_vec();
        }

        for utxo in &selected {
            self.reserved.insert(utxo.outpoint(), now + RESERVATION_TTL_MS);
        }
        tracing::debug!(
            "💸 {} pays {} to {} (fee {}, {} inputs)",
            self.label,
            amount,
            to,
            fee,
            tx.inputs.len()
        );
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ledger::validate_transaction;
    use crate::crypto::{Ed25519Verifier, SignatureVerifier};

    fn funded(wallet: &Wallet, values: &[u64]) -> LedgerState {
        let mut state = LedgerState::default();
        for (h, &value) in values.iter().enumerate() {
            let mut block = Block::origin();
            block.height = h as i64;
            block.hash = [h as u8 + 1; 32];
            block.transactions = vec![Transaction::new_coinbase(h as i64, wallet.address(), value, h as u64)];
            let (next, _) = state.apply_block(&block, value, &Ed25519Verifier).unwrap();
            state = next;
        }
        state
    }

    #[test]
    fn test_deterministic_derivation() {
        let a = Ed25519KeyDeriver::from_u64(7);
        let b = Ed25519KeyDeriver::from_u64(7);
        assert_eq!(a.derive(3).address(), b.derive(3).address());
        assert_ne!(a.derive(3).address(), a.derive(4).address());
        assert_eq!(a.seed_hex().len(), 64);
    }

    #[test]
    fn test_payment_verifies() {
        let mut wallet = Wallet::derive(&Ed25519KeyDeriver::from_u64(1), 0);
        let state = funded(&wallet, &[1_000, 300]);
        let tx = wallet.build_payment(&state, "fs1dest", 900, 10, 50).unwrap();

        assert_eq!(tx.inputs.len(), 1, "largest output covers it");
        assert_eq!(tx.outputs[1].value, 90);
        assert_eq!(validate_transaction(&tx, &state, &Ed25519Verifier), Ok(10));
        assert!(Ed25519Verifier.verify(&tx, 0).is_ok());
    }

    #[test]
    fn test_reservations_prevent_double_spend() {
        let mut wallet = Wallet::derive(&Ed25519KeyDeriver::from_u64(2), 0);
        let state = funded(&wallet, &[500, 400]);
        let first = wallet.build_payment(&state, "x", 450, 0, 0).unwrap();
        let second = wallet.build_payment(&state, "x", 350, 0, 0).unwrap();
        assert_ne!(first.inputs[0].previous_output, second.inputs[0].previous_output);
        assert_eq!(
            wallet.build_payment(&state, "x", 10, 0, 0),
            Err(WalletError::InsufficientFunds { have: 0, need: 10 })
        );
        // reservations lapse
        assert!(wallet.build_payment(&state, "x", 10, 0, RESERVATION_TTL_MS + 1).is_ok());
    }
}
