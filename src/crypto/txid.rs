use crate::core::types::{double_sha256, Hash256, Transaction};

/// Canonical transaction id encoding. Excludes signatures and public keys so
/// the id is fixed before inputs are signed.
///
/// v1 encoding:
/// TAG || inputs(outpoint + address + value) || outputs(address + value) || lock_time || timestamp
pub fn txid_v1(tx: &Transaction) -> Hash256 {
    const TAG: &[u8] = b"FSIM_TXID_V1";
    let mut buf = Vec::with_capacity(256);
    buf.extend_from_slice(TAG);

    buf.extend_from_slice(&(tx.inputs.len() as u32).to_le_bytes());
    for i in &tx.inputs {
        buf.extend_from_slice(&i.previous_output.tx_id);
        buf.extend_from_slice(&i.previous_output.output_index.to_le_bytes());
        put_str(&mut buf, &i.address);
        buf.extend_from_slice(&i.value.to_le_bytes());
    }

    buf.extend_from_slice(&(tx.outputs.len() as u32).to_le_bytes());
    for o in &tx.outputs {
        put_str(&mut buf, &o.address);
        buf.extend_from_slice(&o.value.to_le_bytes());
    }

    buf.extend_from_slice(&tx.lock_time.to_le_bytes());
    buf.extend_from_slice(&tx.timestamp.to_le_bytes());
    double_sha256(&buf)
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{TxOutput, NULL_HASH};

    #[test]
    fn test_txid_depends_on_outputs() {
        let a = Transaction::new(vec![], vec![TxOutput { address: "a".into(), value: 1 }], 0);
        let b = Transaction::new(vec![], vec![TxOutput { address: "a".into(), value: 2 }], 0);
        assert_ne!(txid_v1(&a), txid_v1(&b));
        assert_ne!(txid_v1(&a), NULL_HASH);
    }

    #[test]
    fn test_length_prefix_separates_fields() {
        let a = Transaction::new(vec![], vec![TxOutput { address: "ab".into(), value: 1 }], 0);
        let b = Transaction::new(vec![], vec![TxOutput { address: "a".into(), value: 1 }], 0);
        assert_ne!(a.id, b.id);
    }
}
