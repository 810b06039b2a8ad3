//! UTXO ledger following a node's selected chain.
//!
//! State is copy-on-write: every commit builds a new `LedgerState`, wraps it
//! in an `Arc` and publishes it on a watch channel, so observers always hold
//! a consistent snapshot. Applying a block returns a `BlockUndo` that
//! restores the previous state exactly.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::core::script;
use crate::core::types::*;
use crate::crypto::{SignatureFault, SignatureVerifier};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRejectReason {
    #[error("malformed transaction")]
    MalformedTx,
    #[error("referenced output not found or already spent")]
    UtxoNotFound,
    #[error("input address does not own the referenced output")]
    AddressMismatch,
    #[error("input value differs from the referenced output")]
    ValueMismatch,
    #[error("outputs exceed inputs")]
    InsufficientFunds,
    #[error("input is not signed")]
    MissingSignature,
    #[error("signature check failed")]
    InvalidSignature,
    #[error("transaction already confirmed")]
    DuplicateTransaction,
}

impl From<SignatureFault> for TxRejectReason {
    fn from(fault: SignatureFault) -> Self {
        match fault {
            SignatureFault::Missing => TxRejectReason::MissingSignature,
            SignatureFault::Invalid => TxRejectReason::InvalidSignature,
        }
    }
}

/// A transaction inside a block failed
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("transaction {} rejected: {reason}", short_hex(.tx_id))]
pub struct TxRejection {
    pub reason: TxRejectReason,
    pub tx_id: Hash256,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("block {} rejected: {rej}", short_hex(.0), rej = .1)]
    Block(Hash256, TxRejection),
    #[error("no undo record for block {}", short_hex(.0))]
    MissingUndo(Hash256),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub tx_id: Hash256,
    pub output_index: u32,
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint { tx_id: self.tx_id, output_index: self.output_index }
    }
}

/// Per-address view. `utxos` stays sorted by outpoint so that reverting a
/// block restores the list exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressData {
    pub balance: u64,
    pub utxos: Vec<Utxo>,
    pub transaction_history: Vec<Hash256>,
}

impl AddressData {
    fn insert_utxo(&mut self, utxo: Utxo) {
        let key = utxo.outpoint();
        let pos = match self.utxos.binary_search_by(|u| u.outpoint().cmp(&key)) {
            Ok(p) | Err(p) => p,
        };
        self.balance += utxo.value;
        self.utxos.insert(pos, utxo);
    }

    fn take_utxo(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let pos = self.utxos.binary_search_by(|u| u.outpoint().cmp(outpoint)).ok()?;
        let utxo = self.utxos.remove(pos);
        self.balance -= utxo.value;
        Some(utxo)
    }
}

/// Read access to spendable outputs, for transaction validation
pub trait UtxoView {
    /// Owner and value of an unspent output
    fn lookup(&self, outpoint: &OutPoint) -> Option<(&str, u64)>;
    fn is_confirmed(&self, tx_id: &Hash256) -> bool;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerState {
    addresses: BTreeMap<Address, AddressData>,
    owners: HashMap<OutPoint, Address>,
    confirmed: HashSet<Hash256>,
}

impl UtxoView for LedgerState {
    fn lookup(&self, outpoint: &OutPoint) -> Option<(&str, u64)> {
        let owner = self.owners.get(outpoint)?;
        let data = self.addresses.get(owner)?;
        let pos = data.utxos.binary_search_by(|u| u.outpoint().cmp(outpoint)).ok()?;
        Some((owner.as_str(), data.utxos[pos].value))
    }

    fn is_confirmed(&self, tx_id: &Hash256) -> bool {
        self.confirmed.contains(tx_id)
    }
}

/// Everything needed to undo one applied block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub block_hash: Hash256,
    spent: Vec<(Address, Utxo)>,
    created: Vec<OutPoint>,
    history: Vec<(Address, Hash256)>,
    confirmed: Vec<Hash256>,
    new_addresses: Vec<Address>,
    pub fees: u64,
    pub reward: u64,
}

impl LedgerState {
    pub fn balance(&self, address: &str) -> u64 {
        self.addresses.get(address).map_or(0, |d| d.balance)
    }

    pub fn address(&self, address: &str) -> Option<&AddressData> {
        self.addresses.get(address)
    }

    pub fn addresses(&self) -> impl Iterator<Item = (&Address, &AddressData)> {
        self.addresses.iter()
    }

    pub fn total_supply(&self) -> u64 {
        self.addresses.values().map(|d| d.balance).sum()
    }

    pub fn utxo_count(&self) -> usize {
        self.owners.len()
    }

    /// Balances equal their UTXO sums, every UTXO script pays its owner and
    /// the outpoint index matches the address map.
    pub fn check_invariants(&self) -> bool {
        let mut indexed = 0;
        for (address, data) in &self.addresses {
            if data.balance != data.utxos.iter().map(|u| u.value).sum::<u64>() {
                return false;
            }
            for utxo in &data.utxos {
                if script::address_of(&utxo.script_pubkey).as_deref() != Ok(address.as_str()) {
                    return false;
                }
                if self.owners.get(&utxo.outpoint()) != Some(address) {
                    return false;
                }
                indexed += 1;
            }
        }
        indexed == self.owners.len()
    }

    fn credit(&mut self, address: &str, utxo: Utxo, undo: &mut BlockUndo) {
        if !self.addresses.contains_key(address) {
            undo.new_addresses.push(address.to_string());
        }
        self.owners.insert(utxo.outpoint(), address.to_string());
        undo.created.push(utxo.outpoint());
        self.addresses.entry(address.to_string()).or_default().insert_utxo(utxo);
    }

    fn debit(&mut self, outpoint: &OutPoint) -> Option<(Address, Utxo)> {
        let owner = self.owners.remove(outpoint)?;
        let utxo = self.addresses.get_mut(&owner)?.take_utxo(outpoint)?;
        Some((owner, utxo))
    }

    fn record_history(&mut self, address: &str, tx_id: Hash256, undo: &mut BlockUndo) {
        if !self.addresses.contains_key(address) {
            undo.new_addresses.push(address.to_string());
        }
        self.addresses.entry(address.to_string()).or_default().transaction_history.push(tx_id);
        undo.history.push((address.to_string(), tx_id));
    }

    /// Apply a block in place. On error the state is partially modified, so
    /// callers work on a clone.
    fn apply_in_place(
        &mut self,
        block: &Block,
        subsidy: u64,
        verifier: &dyn SignatureVerifier,
    ) -> Result<BlockUndo, TxRejection> {
        let mut undo = BlockUndo { block_hash: block.hash, ..Default::default() };
        let (coinbase, rest) = block
            .transactions
            .split_first()
            .ok_or(TxRejection { reason: TxRejectReason::MalformedTx, tx_id: NULL_HASH })?;

        let reject = |reason, tx: &Transaction| TxRejection { reason, tx_id: tx.id };
        if !coinbase.is_coinbase() || coinbase.outputs.len() != 1 || coinbase.id != coinbase.compute_id() {
            return Err(reject(TxRejectReason::MalformedTx, coinbase));
        }
        if self.confirmed.contains(&coinbase.id) {
            return Err(reject(TxRejectReason::DuplicateTransaction, coinbase));
        }

        let mut fees = 0u64;
        for tx in rest {
            if tx.is_coinbase() {
                return Err(reject(TxRejectReason::MalformedTx, tx));
            }
            let fee = validate_transaction(tx, &*self, verifier).map_err(|r| reject(r, tx))?;
            fees = fees.saturating_add(fee);

            for input in &tx.inputs {
                let (owner, utxo) = self
                    .debit(&input.previous_output)
                    .ok_or(reject(TxRejectReason::UtxoNotFound, tx))?;
                self.record_history(&owner, tx.id, &mut undo);
                undo.spent.push((owner, utxo));
            }
            self.create_outputs(tx, None, &mut undo);
            self.confirmed.insert(tx.id);
            undo.confirmed.push(tx.id);
        }

        let reward = subsidy.saturating_add(fees);
        self.create_outputs(coinbase, Some(reward), &mut undo);
        self.confirmed.insert(coinbase.id);
        undo.confirmed.push(coinbase.id);

        undo.fees = fees;
        undo.reward = reward;
        Ok(undo)
    }

    fn create_outputs(&mut self, tx: &Transaction, value_override: Option<u64>, undo: &mut BlockUndo) {
        for (index, output) in tx.outputs.iter().enumerate() {
            let utxo = Utxo {
                tx_id: tx.id,
                output_index: index as u32,
                value: value_override.unwrap_or(output.value),
                script_pubkey: script::pay_to_address(&output.address),
            };
            self.credit(&output.address, utxo, undo);
            self.record_history(&output.address, tx.id, undo);
        }
    }

    fn revert_in_place(&mut self, undo: &BlockUndo) {
        // Restore spends first: an output created and spent inside the same
        // block must come back before its creation is undone.
        for (owner, utxo) in undo.spent.iter().rev() {
            self.owners.insert(utxo.outpoint(), owner.clone());
            self.addresses.entry(owner.clone()).or_default().insert_utxo(utxo.clone());
        }
        for outpoint in undo.created.iter().rev() {
            self.debit(outpoint);
        }
        for (address, tx_id) in undo.history.iter().rev() {
            if let Some(data) = self.addresses.get_mut(address) {
                if let Some(pos) = data.transaction_history.iter().rposition(|h| h == tx_id) {
                    data.transaction_history.remove(pos);
                }
            }
        }
        for tx_id in &undo.confirmed {
            self.confirmed.remove(tx_id);
        }
        for address in &undo.new_addresses {
            let empty = self
                .addresses
                .get(address)
                .map_or(false, |d| d.utxos.is_empty() && d.transaction_history.is_empty());
            if empty {
                self.addresses.remove(address);
            }
        }
    }

    /// Apply a block to a copy of this state; `self` is untouched on error
    pub fn apply_block(
        &self,
        block: &Block,
        subsidy: u64,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(LedgerState, BlockUndo), TxRejection> {
        let mut next = self.clone();
        let undo = next.apply_in_place(block, subsidy, verifier)?;
        Ok((next, undo))
    }

    pub fn revert_block(&self, undo: &BlockUndo) -> LedgerState {
        let mut prev = self.clone();
        prev.revert_in_place(undo);
        prev
    }
}

/// Validate a transaction against a view. Returns the fee.
pub fn validate_transaction(
    tx: &Transaction,
    view: &dyn UtxoView,
    verifier: &dyn SignatureVerifier,
) -> Result<u64, TxRejectReason> {
    if tx.inputs.is_empty() || tx.outputs.is_empty() || tx.id != tx.compute_id() {
        return Err(TxRejectReason::MalformedTx);
    }
    if view.is_confirmed(&tx.id) {
        return Err(TxRejectReason::DuplicateTransaction);
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    let mut total_in = 0u64;
    for input in &tx.inputs {
        if !seen.insert(input.previous_output) {
            return Err(TxRejectReason::UtxoNotFound);
        }
        let (owner, value) = view.lookup(&input.previous_output).ok_or(TxRejectReason::UtxoNotFound)?;
        if owner != input.address {
            return Err(TxRejectReason::AddressMismatch);
        }
        if value != input.value {
            return Err(TxRejectReason::ValueMismatch);
        }
        total_in = total_in.checked_add(value).ok_or(TxRejectReason::MalformedTx)?;
    }

    let total_out = tx
        .outputs
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value))
        .ok_or(TxRejectReason::MalformedTx)?;
    if total_out > total_in {
        return Err(TxRejectReason::InsufficientFunds);
    }

    for index in 0..tx.inputs.len() {
        verifier.verify(tx, index)?;
    }
    Ok(total_in - total_out)
}

/// Outputs created and spent by pending (unconfirmed) transactions
#[derive(Debug, Clone, Default)]
pub struct VirtualUtxos {
    created: HashMap<OutPoint, (Address, u64)>,
    spent: HashSet<OutPoint>,
}

impl VirtualUtxos {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.spent.is_empty()
    }
}

/// Confirmed state with the mempool overlay on top
struct MempoolView<'a> {
    state: &'a LedgerState,
    overlay: &'a VirtualUtxos,
}

impl UtxoView for MempoolView<'_> {
    fn lookup(&self, outpoint: &OutPoint) -> Option<(&str, u64)> {
        if self.overlay.spent.contains(outpoint) {
            return None;
        }
        if let Some((address, value)) = self.overlay.created.get(outpoint) {
            return Some((address.as_str(), *value));
        }
        self.state.lookup(outpoint)
    }

    fn is_confirmed(&self, tx_id: &Hash256) -> bool {
        self.state.is_confirmed(tx_id)
    }
}

/// Serializable ledger state plus undo records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub addresses: BTreeMap<Address, AddressData>,
    pub confirmed: Vec<Hash256>,
    pub undo: Vec<BlockUndo>,
}

/// Saved state for an all-or-nothing multi-block operation
#[derive(Debug, Clone)]
pub struct LedgerCheckpoint {
    state: Arc<LedgerState>,
    undo: HashMap<Hash256, BlockUndo>,
}

pub struct Ledger {
    state: Arc<LedgerState>,
    undo: HashMap<Hash256, BlockUndo>,
    virtual_utxos: VirtualUtxos,
    verifier: Arc<dyn SignatureVerifier>,
    publisher: watch::Sender<Arc<LedgerState>>,
}

impl Ledger {
    pub fn new(verifier: Arc<dyn SignatureVerifier>) -> Self {
        let state = Arc::new(LedgerState::default());
        let (publisher, _) = watch::channel(state.clone());
        Self { state, undo: HashMap::new(), virtual_utxos: VirtualUtxos::default(), verifier, publisher }
    }

    /// Current immutable snapshot
    pub fn snapshot(&self) -> Arc<LedgerState> {
        self.state.clone()
    }

    pub fn state(&self) -> &LedgerState {
        &self.state
    }

    /// Receives every committed snapshot
    pub fn subscribe(&self) -> watch::Receiver<Arc<LedgerState>> {
        self.publisher.subscribe()
    }

    pub fn balance(&self, address: &str) -> u64 {
        self.state.balance(address)
    }

    pub fn is_confirmed(&self, tx_id: &Hash256) -> bool {
        self.state.is_confirmed(tx_id)
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }

    fn commit(&mut self, next: LedgerState) {
        debug_assert!(next.check_invariants());
        self.state = Arc::new(next);
        self.publisher.send_replace(self.state.clone());
    }

    // ─── Mempool overlay ─────────────────────────────────────────────

    /// Validate a pending transaction against confirmed state plus the overlay
    pub fn validate_pending(&self, tx: &Transaction) -> Result<u64, TxRejectReason> {
        let view = MempoolView { state: &self.state, overlay: &self.virtual_utxos };
        validate_transaction(tx, &view, self.verifier.as_ref())
    }

    /// Record a pending transaction's spends and outputs
    pub fn add_virtual(&mut self, tx: &Transaction) {
        for input in &tx.inputs {
            if self.virtual_utxos.created.remove(&input.previous_output).is_none() {
                self.virtual_utxos.spent.insert(input.previous_output);
            }
        }
        for (index, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint { tx_id: tx.id, output_index: index as u32 };
            self.virtual_utxos.created.insert(outpoint, (output.address.clone(), output.value));
        }
    }

    pub fn clear_virtual(&mut self) {
        self.virtual_utxos = VirtualUtxos::default();
    }

    pub fn virtual_utxos(&self) -> &VirtualUtxos {
        &self.virtual_utxos
    }

    // ─── Block application ───────────────────────────────────────────

    pub fn apply_block(&mut self, block: &Block, subsidy: u64) -> Result<(), LedgerError> {
        let (next, undo) = self
            .state
            .apply_block(block, subsidy, self.verifier.as_ref())
            .map_err(|r| LedgerError::Block(block.hash, r))?;
        self.undo.insert(block.hash, undo);
        self.commit(next);
        Ok(())
    }

    pub fn revert_block(&mut self, block_hash: &Hash256) -> Result<(), LedgerError> {
        let undo = self.undo.remove(block_hash).ok_or(LedgerError::MissingUndo(*block_hash))?;
        let prev = self.state.revert_block(&undo);
        self.commit(prev);
        Ok(())
    }

    /// Revert `revert` (highest first) then apply `apply` (lowest first) on
    /// one working copy. Nothing changes unless every step succeeds.
    pub fn reorganize(&mut self, revert: &[&Block], apply: &[(&Block, u64)]) -> Result<(), LedgerError> {
        let (next, undos) = self.replay(revert, apply)?;
        for block in revert {
            self.undo.remove(&block.hash);
        }
        for undo in undos {
            self.undo.insert(undo.block_hash, undo);
        }
        self.commit(next);
        Ok(())
    }

    /// State the ledger would have after a reorganization, without committing
    pub fn view_after(&self, revert: &[&Block], apply: &[(&Block, u64)]) -> Result<LedgerState, LedgerError> {
        self.replay(revert, apply).map(|(state, _)| state)
    }

    fn replay(
        &self,
        revert: &[&Block],
        apply: &[(&Block, u64)],
    ) -> Result<(LedgerState, Vec<BlockUndo>), LedgerError> {
        let mut work = (*self.state).clone();
        for block in revert {
            let undo = self.undo.get(&block.hash).ok_or(LedgerError::MissingUndo(block.hash))?;
            work.revert_in_place(undo);
        }
        let mut undos = Vec::with_capacity(apply.len());
        for (block, subsidy) in apply {
            let undo = work
                .apply_in_place(block, *subsidy, self.verifier.as_ref())
                .map_err(|r| LedgerError::Block(block.hash, r))?;
            undos.push(undo);
        }
        Ok((work, undos))
    }

    /// Check that `block` would apply cleanly on top of `view`
    pub fn check_block(&self, view: &LedgerState, block: &Block, subsidy: u64) -> Result<u64, TxRejection> {
        let mut work = view.clone();
        let undo = work.apply_in_place(block, subsidy, self.verifier.as_ref())?;
        Ok(undo.fees)
    }

    /// Replay from empty state along `chain` (lowest first). On failure the
    /// ledger keeps the prefix that applied and returns the error.
    pub fn rebuild(&mut self, chain: &[(&Block, u64)]) -> Result<(), LedgerError> {
        let mut work = LedgerState::default();
        let mut undo = HashMap::with_capacity(chain.len());
        let mut result = Ok(());
        for (block, subsidy) in chain {
            match work.apply_in_place(block, *subsidy, self.verifier.as_ref()) {
                Ok(u) => {
                    undo.insert(block.hash, u);
                }
                Err(r) => {
                    // apply_in_place may have half-applied; redo the good prefix
                    let applied = undo.len();
                    work = LedgerState::default();
                    undo.clear();
                    for (good, s) in &chain[..applied] {
                        if let Ok(u) = work.apply_in_place(good, *s, self.verifier.as_ref()) {
                            undo.insert(good.hash, u);
                        }
                    }
                    result = Err(LedgerError::Block(block.hash, r));
                    break;
                }
            }
        }
        self.undo = undo;
        self.clear_virtual();
        self.commit(work);
        result
    }

    // ─── Checkpoints & snapshots ─────────────────────────────────────

    pub fn checkpoint(&self) -> LedgerCheckpoint {
        LedgerCheckpoint { state: self.state.clone(), undo: self.undo.clone() }
    }

    pub fn restore(&mut self, checkpoint: LedgerCheckpoint) {
        self.undo = checkpoint.undo;
        self.state = checkpoint.state;
        self.publisher.send_replace(self.state.clone());
    }

    pub fn to_snapshot(&self) -> LedgerSnapshot {
        let mut confirmed: Vec<Hash256> = self.state.confirmed.iter().copied().collect();
        confirmed.sort();
        LedgerSnapshot {
            addresses: self.state.addresses.clone(),
            confirmed,
            undo: self.undo.values().cloned().collect(),
        }
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot, verifier: Arc<dyn SignatureVerifier>) -> Self {
        let mut owners = HashMap::new();
        for (address, data) in &snapshot.addresses {
            for utxo in &data.utxos {
                owners.insert(utxo.outpoint(), address.clone());
            }
        }
        let state = LedgerState {
            addresses: snapshot.addresses,
            owners,
            confirmed: snapshot.confirmed.into_iter().collect(),
        };
        let mut ledger = Ledger::new(verifier);
        ledger.undo = snapshot.undo.into_iter().map(|u| (u.block_hash, u)).collect();
        ledger.commit(state);
        ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{tx_signing_hash_v1, Ed25519Verifier, FormatVerifier, Keypair};

    const SUBSIDY: u64 = 5_000;

    #[test]
    fn test_block_error_names_block_and_tx() {
        let err = LedgerError::Block([0xab; 32], TxRejection { reason: TxRejectReason::MalformedTx, tx_id: [0xcd; 32] });
        let text = err.to_string();
        assert!(text.starts_with("block "));
        assert!(text.contains("rejected: transaction"));
    }

    fn block(height: i64, miner: &str, txs: Vec<Transaction>) -> Block {
        let mut transactions = vec![Transaction::new_coinbase(height, miner, 0, height as u64)];
        transactions.extend(txs);
        let mut b = Block {
            height,
            previous_hash: NULL_HASH,
            hash: NULL_HASH,
            nonce: 0,
            bits: 0,
            transactions,
            miner: 0,
            consensus_version: 1,
            timestamp: height as u64,
        };
        b.hash = b.compute_hash();
        b
    }

    fn spend(from: &str, prev: OutPoint, value: u64, outputs: Vec<(&str, u64)>) -> Transaction {
        let input = TxInput {
            previous_output: prev,
            address: from.to_string(),
            value,
            signature: vec![1u8; 64],
            public_key: vec![2u8; 32],
        };
        let outputs = outputs
            .into_iter()
            .map(|(a, v)| TxOutput { address: a.to_string(), value: v })
            .collect();
        Transaction::new(vec![input], outputs, 0)
    }

    fn coinbase_outpoint(b: &Block) -> OutPoint {
        OutPoint { tx_id: b.transactions[0].id, output_index: 0 }
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(FormatVerifier))
    }

    #[test]
    fn test_coinbase_credited_with_subsidy() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        assert_eq!(l.balance("alice"), SUBSIDY);
        assert!(l.state().check_invariants());
        assert_eq!(l.state().address("alice").unwrap().transaction_history, vec![b0.transactions[0].id]);
    }

    #[test]
    fn test_fees_go_to_miner() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let tx = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", 1_000), ("alice", 3_900)]);
        let b1 = block(1, "carol", vec![tx]);
        l.apply_block(&b1, SUBSIDY).unwrap();
        assert_eq!(l.balance("bob"), 1_000);
        assert_eq!(l.balance("alice"), 3_900);
        assert_eq!(l.balance("carol"), SUBSIDY + 100);
        assert_eq!(l.state().total_supply(), 2 * SUBSIDY);
        assert!(l.state().check_invariants());
    }

    #[test]
    fn test_chained_spend_within_block() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let t1 = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        let t2 = spend("bob", OutPoint { tx_id: t1.id, output_index: 0 }, SUBSIDY, vec![("carol", SUBSIDY)]);
        let b1 = block(1, "miner", vec![t1, t2]);
        l.apply_block(&b1, SUBSIDY).unwrap();
        assert_eq!(l.balance("bob"), 0);
        assert_eq!(l.balance("carol"), SUBSIDY);
    }

    #[test]
    fn test_rejections() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let op = coinbase_outpoint(&b0);
        let v = FormatVerifier;

        let missing = spend("alice", OutPoint { tx_id: [9; 32], output_index: 0 }, SUBSIDY, vec![("bob", 1)]);
        assert_eq!(validate_transaction(&missing, l.state(), &v), Err(TxRejectReason::UtxoNotFound));

        let wrong_owner = spend("mallory", op, SUBSIDY, vec![("bob", 1)]);
        assert_eq!(validate_transaction(&wrong_owner, l.state(), &v), Err(TxRejectReason::AddressMismatch));

        let wrong_value = spend("alice", op, SUBSIDY + 1, vec![("bob", 1)]);
        assert_eq!(validate_transaction(&wrong_value, l.state(), &v), Err(TxRejectReason::ValueMismatch));

        let overspend = spend("alice", op, SUBSIDY, vec![("bob", SUBSIDY + 1)]);
        assert_eq!(validate_transaction(&overspend, l.state(), &v), Err(TxRejectReason::InsufficientFunds));

        let mut unsigned = spend("alice", op, SUBSIDY, vec![("bob", 1)]);
        unsigned.inputs[0].signature.clear();
        assert_eq!(validate_transaction(&unsigned, l.state(), &v), Err(TxRejectReason::MissingSignature));

        let mut tampered = spend("alice", op, SUBSIDY, vec![("bob", 1)]);
        tampered.outputs[0].value = 2;
        assert_eq!(validate_transaction(&tampered, l.state(), &v), Err(TxRejectReason::MalformedTx));

        let mut double = spend("alice", op, SUBSIDY, vec![("bob", 1)]);
        double.inputs.push(double.inputs[0].clone());
        double.id = double.compute_id();
        assert_eq!(validate_transaction(&double, l.state(), &v), Err(TxRejectReason::UtxoNotFound));
    }

    #[test]
    fn test_duplicate_confirmed_transaction() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let tx = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        l.apply_block(&block(1, "m", vec![tx.clone()]), SUBSIDY).unwrap();
        assert_eq!(
            validate_transaction(&tx, l.state(), &FormatVerifier),
            Err(TxRejectReason::DuplicateTransaction)
        );
    }

    #[test]
    fn test_failed_block_leaves_state_untouched() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let before = l.snapshot();
        let good = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        let bad = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("carol", SUBSIDY)]);
        let b1 = block(1, "m", vec![good, bad.clone()]);
        let err = l.apply_block(&b1, SUBSIDY).unwrap_err();
        assert_eq!(
            err,
            LedgerError::Block(b1.hash, TxRejection { reason: TxRejectReason::UtxoNotFound, tx_id: bad.id })
        );
        assert_eq!(*l.snapshot(), *before);
    }

    #[test]
    fn test_apply_revert_roundtrip() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let before = l.snapshot();
        let tx = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", 2_000), ("dave", 2_500)]);
        let b1 = block(1, "carol", vec![tx]);
        l.apply_block(&b1, SUBSIDY).unwrap();
        assert_ne!(*l.snapshot(), *before);
        l.revert_block(&b1.hash).unwrap();
        assert_eq!(*l.snapshot(), *before);
        assert!(l.state().address("dave").is_none());
        assert_eq!(l.revert_block(&b1.hash).unwrap_err(), LedgerError::MissingUndo(b1.hash));
    }

    #[test]
    fn test_revert_chained_spend() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let before = l.snapshot();
        let t1 = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        let t2 = spend("bob", OutPoint { tx_id: t1.id, output_index: 0 }, SUBSIDY, vec![("carol", SUBSIDY)]);
        let b1 = block(1, "miner", vec![t1, t2]);
        l.apply_block(&b1, SUBSIDY).unwrap();
        l.revert_block(&b1.hash).unwrap();
        assert_eq!(*l.snapshot(), *before);
    }

    #[test]
    fn test_reorganize_switches_branch() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let a1 = block(1, "bob", vec![]);
        l.apply_block(&a1, SUBSIDY).unwrap();

        let mut c1 = block(1, "carol", vec![]);
        c1.nonce = 7;
        c1.hash = c1.compute_hash();
        let c2 = block(2, "carol", vec![]);
        l.reorganize(&[&a1], &[(&c1, SUBSIDY), (&c2, SUBSIDY)]).unwrap();
        assert_eq!(l.balance("bob"), 0);
        assert_eq!(l.balance("carol"), 2 * SUBSIDY);
        assert!(l.state().check_invariants());
    }

    #[test]
    fn test_reorganize_is_atomic() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let a1 = block(1, "bob", vec![]);
        l.apply_block(&a1, SUBSIDY).unwrap();
        let before = l.snapshot();
        let bad_tx = spend("alice", OutPoint { tx_id: [5; 32], output_index: 0 }, 1, vec![("x", 1)]);
        let c1 = block(1, "carol", vec![bad_tx]);
        assert!(l.reorganize(&[&a1], &[(&c1, SUBSIDY)]).is_err());
        assert_eq!(*l.snapshot(), *before);
        // undo for a1 still present
        l.revert_block(&a1.hash).unwrap();
    }

    #[test]
    fn test_virtual_overlay_allows_chained_pending() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        let t1 = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        l.validate_pending(&t1).unwrap();
        l.add_virtual(&t1);

        let t2 = spend("bob", OutPoint { tx_id: t1.id, output_index: 0 }, SUBSIDY, vec![("carol", SUBSIDY)]);
        assert_eq!(l.validate_pending(&t2), Ok(0));
        assert_eq!(validate_transaction(&t2, l.state(), &FormatVerifier), Err(TxRejectReason::UtxoNotFound));

        let again = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("dave", SUBSIDY)]);
        assert_eq!(l.validate_pending(&again), Err(TxRejectReason::UtxoNotFound));

        l.clear_virtual();
        assert!(l.virtual_utxos().is_empty());
        assert!(l.validate_pending(&again).is_ok());
    }

    #[test]
    fn test_ed25519_ledger_requires_real_signature() {
        let kp = Keypair::from_secret_bytes(&[4u8; 32]);
        let mut l = Ledger::new(Arc::new(Ed25519Verifier));
        let b0 = block(0, &kp.address(), vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();

        let mut tx = spend(&kp.address(), coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        assert_eq!(l.validate_pending(&tx), Err(TxRejectReason::InvalidSignature));
        let sig = kp.sign_hash(&tx_signing_hash_v1(&tx, 0));
        tx.inputs[0].signature = sig.to_vec();
        tx.inputs[0].public_key = kp.public_key_bytes().to_vec();
        assert_eq!(l.validate_pending(&tx), Ok(0));
    }

    #[test]
    fn test_rebuild_and_snapshot() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        let tx = spend("alice", coinbase_outpoint(&b0), SUBSIDY, vec![("bob", SUBSIDY)]);
        let b1 = block(1, "carol", vec![tx]);
        l.rebuild(&[(&b0, SUBSIDY), (&b1, SUBSIDY)]).unwrap();
        assert_eq!(l.balance("bob"), SUBSIDY);

        let restored = Ledger::from_snapshot(l.to_snapshot(), Arc::new(FormatVerifier));
        assert_eq!(*restored.snapshot(), *l.snapshot());

        let mut restored = restored;
        restored.revert_block(&b1.hash).unwrap();
        assert_eq!(restored.balance("alice"), SUBSIDY);
    }

    #[test]
    fn test_rebuild_keeps_valid_prefix() {
        let mut l = ledger();
        let b0 = block(0, "alice", vec![]);
        let bad = spend("alice", OutPoint { tx_id: [1; 32], output_index: 0 }, 5, vec![("bob", 5)]);
        let b1 = block(1, "carol", vec![bad]);
        assert!(l.rebuild(&[(&b0, SUBSIDY), (&b1, SUBSIDY)]).is_err());
        assert_eq!(l.balance("alice"), SUBSIDY);
        assert_eq!(l.balance("carol"), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_commits() {
        let mut l = ledger();
        let mut rx = l.subscribe();
        let b0 = block(0, "alice", vec![]);
        l.apply_block(&b0, SUBSIDY).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().balance("alice"), SUBSIDY);
    }
}
