use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A 32-byte hash used throughout the system
pub type Hash256 = [u8; 32];

/// Null hash (all zeros). The synthetic origin sentinel carries it, so every
/// height-0 block points at it.
pub const NULL_HASH: Hash256 = [0u8; 32];

/// Height of the synthetic origin sentinel that roots every chain tree
pub const ORIGIN_HEIGHT: i64 = -1;

/// Opaque address string produced by a `KeyDeriver`
pub type Address = String;

/// Identifier of a simulated node (also used as the block's miner id)
pub type NodeId = u32;

pub fn double_sha256(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&second);
    hash
}

/// First 8 bytes of a hash as hex, for log lines
pub fn short_hex(hash: &Hash256) -> String {
    hex::encode(&hash[..8])
}

// ─── Transaction Types ───────────────────────────────────────────────

/// Reference to a previous transaction output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub tx_id: Hash256,
    pub output_index: u32,
}

/// Transaction input. `address` and `value` restate the UTXO being spent;
/// the ledger rejects the input if they disagree with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub address: Address,
    pub value: u64,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub address: Address,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    /// Coinbases store their block height here so two coinbases never collide
    pub lock_time: u64,
    pub timestamp: u64,
}

impl Transaction {
    /// Build a transaction and seal its id. Inputs are left unsigned.
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>, timestamp: u64) -> Self {
        let mut tx = Transaction { id: NULL_HASH, inputs, outputs, lock_time: 0, timestamp };
        tx.id = tx.compute_id();
        tx
    }

    /// Create a coinbase transaction. `reward` is only the template value:
    /// the ledger credits `subsidy + fees` when the block is accepted.
    pub fn new_coinbase(height: i64, miner_address: &str, reward: u64, timestamp: u64) -> Self {
        let mut tx = Transaction {
            id: NULL_HASH,
            inputs: vec![],
            outputs: vec![TxOutput { address: miner_address.to_string(), value: reward }],
            lock_time: height.max(0) as u64,
            timestamp,
        };
        tx.id = tx.compute_id();
        tx
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn compute_id(&self) -> Hash256 {
        crate::crypto::txid::txid_v1(self)
    }

    pub fn total_input(&self) -> u64 {
        self.inputs.iter().map(|i| i.value).sum()
    }

    pub fn total_output(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

// ─── Block Types ─────────────────────────────────────────────────────

/// A block. `bits` is the compact-encoded target the hash must fall below.
///
/// Blocks never carry local mining state: nonce progress and timers live in
/// the miner's session, and a block is immutable once it leaves the miner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub height: i64,
    pub previous_hash: Hash256,
    pub hash: Hash256,
    pub nonce: u64,
    pub bits: u32,
    pub transactions: Vec<Transaction>,
    pub miner: NodeId,
    pub consensus_version: u32,
    pub timestamp: u64,
}

impl Block {
    /// The synthetic origin sentinel at height -1
    pub fn origin() -> Self {
        Block {
            height: ORIGIN_HEIGHT,
            previous_hash: NULL_HASH,
            hash: NULL_HASH,
            nonce: 0,
            bits: 0,
            transactions: vec![],
            miner: 0,
            consensus_version: 0,
            timestamp: 0,
        }
    }

    pub fn is_origin(&self) -> bool {
        self.height == ORIGIN_HEIGHT
    }

    /// Compute the merkle root from the block's transactions
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.transactions)
    }

    /// Hash of the header fields with a precomputed merkle root.
    /// The miner caches the root so each nonce costs one header hash.
    pub fn header_hash(&self, merkle_root: &Hash256) -> Hash256 {
        let mut buf = Vec::with_capacity(8 + 8 + 32 + 32 + 8 + 4);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.extend_from_slice(&self.previous_hash);
        buf.extend_from_slice(merkle_root);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.bits.to_le_bytes());
        double_sha256(&buf)
    }

    pub fn compute_hash(&self) -> Hash256 {
        self.header_hash(&self.compute_merkle_root())
    }

    /// Check if the stored hash is below the target encoded in `bits`
    pub fn meets_target(&self) -> bool {
        crate::core::difficulty::hash_meets_bits(&self.hash, self.bits)
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first()
    }

    pub fn size(&self) -> usize {
        bincode::serialized_size(self).unwrap_or(0) as usize
    }
}

pub fn merkle_root(transactions: &[Transaction]) -> Hash256 {
    if transactions.is_empty() {
        return NULL_HASH;
    }

    let mut hashes: Vec<Hash256> = transactions.iter().map(|tx| tx.id).collect();

    while hashes.len() > 1 {
        if hashes.len() % 2 != 0 {
            let last = hashes[hashes.len() - 1];
            hashes.push(last);
        }

        let mut next_level = Vec::with_capacity(hashes.len() / 2);
        for chunk in hashes.chunks(2) {
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&chunk[0]);
            combined.extend_from_slice(&chunk[1]);
            next_level.push(double_sha256(&combined));
        }
        hashes = next_level;
    }

    hashes[0]
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} [{}] bits={:08x} miner={} txs={}",
            self.height,
            short_hex(&self.hash),
            self.bits,
            self.miner,
            self.transactions.len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spend() -> Transaction {
        let input = TxInput {
            previous_output: OutPoint { tx_id: [7u8; 32], output_index: 0 },
            address: "alice".into(),
            value: 100,
            signature: vec![],
            public_key: vec![],
        };
        Transaction::new(vec![input], vec![TxOutput { address: "bob".into(), value: 90 }], 5)
    }

    #[test]
    fn test_coinbase_transaction() {
        let tx = Transaction::new_coinbase(0, "miner", 5_000_000_000, 1);
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.total_output(), 5_000_000_000);
        assert_eq!(tx.id, tx.compute_id());
    }

    #[test]
    fn test_coinbases_at_different_heights_differ() {
        let a = Transaction::new_coinbase(1, "miner", 50, 1);
        let b = Transaction::new_coinbase(2, "miner", 50, 1);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_tx_id_ignores_signature() {
        let tx = sample_spend();
        let mut signed = tx.clone();
        signed.inputs[0].signature = vec![1u8; 64];
        signed.inputs[0].public_key = vec![2u8; 32];
        assert_eq!(tx.compute_id(), signed.compute_id());
        assert_ne!(tx.id, NULL_HASH);
    }

    #[test]
    fn test_merkle_root_single_tx() {
        let tx = Transaction::new_coinbase(0, "miner", 50, 0);
        assert_eq!(merkle_root(std::slice::from_ref(&tx)), tx.id);
    }

    #[test]
    fn test_block_hash_commits_to_transactions_and_nonce() {
        let mut block = Block {
            height: 0,
            previous_hash: NULL_HASH,
            hash: NULL_HASH,
            nonce: 0,
            bits: 0x207fffff,
            transactions: vec![Transaction::new_coinbase(0, "miner", 50, 1)],
            miner: 1,
            consensus_version: 1,
            timestamp: 1,
        };
        let h0 = block.compute_hash();
        block.nonce = 1;
        let h1 = block.compute_hash();
        assert_ne!(h0, h1);
        block.transactions.push(sample_spend());
        assert_ne!(block.compute_hash(), h1);
    }

    #[test]
    fn test_origin_sentinel() {
        let origin = Block::origin();
        assert!(origin.is_origin());
        assert_eq!(origin.hash, NULL_HASH);
    }
}
