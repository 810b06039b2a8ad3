// src/core/script.rs
//! Locking scripts stored on UTXOs.
//!
//! Standard form: OP_DUP OP_HASH256 OP_PUSHDATA1 <len> <address bytes> OP_EQUALVERIFY OP_CHECKSIG
//! Unlocking data lives on the input (signature + public key), not in a script.

/// Opcodes (minimal subset).
pub const OP_DUP: u8 = 0x76;
pub const OP_HASH256: u8 = 0xAA;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xAC;

/// Push helpers
pub const OP_PUSHDATA1: u8 = 0x4c;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptError {
    NonStandard,
    BadEncoding,
}

/// Build the standard pay-to-address script.
pub fn pay_to_address(address: &str) -> Vec<u8> {
    let bytes = address.as_bytes();
    let len = bytes.len().min(u8::MAX as usize);
    let mut s = Vec::with_capacity(4 + len + 2);
    s.push(OP_DUP);
    s.push(OP_HASH256);
    s.push(OP_PUSHDATA1);
    s.push(len as u8);
    s.extend_from_slice(&bytes[..len]);
    s.push(OP_EQUALVERIFY);
    s.push(OP_CHECKSIG);
    s
}

/// Extract the address a standard script pays to.
pub fn address_of(script_pubkey: &[u8]) -> Result<String, ScriptError> {
    if script_pubkey.len() < 6 {
        return Err(ScriptError::NonStandard);
    }
    if script_pubkey[0] != OP_DUP || script_pubkey[1] != OP_HASH256 || script_pubkey[2] != OP_PUSHDATA1 {
        return Err(ScriptError::NonStandard);
    }
    let len = script_pubkey[3] as usize;
    if script_pubkey.len() != 4 + len + 2 {
        return Err(ScriptError::BadEncoding);
    }
    if script_pubkey[4 + len] != OP_EQUALVERIFY || script_pubkey[5 + len] != OP_CHECKSIG {
        return Err(ScriptError::NonStandard);
    }
    String::from_utf8(script_pubkey[4..4 + len].to_vec()).map_err(|_| ScriptError::BadEncoding)
}
