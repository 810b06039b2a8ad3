//! Compact target encoding and retargeting.
//!
//! Targets use Bitcoin's `nBits` form: one exponent byte and a 3-byte
//! mantissa, `target = mantissa * 256^(exponent - 3)`. A hash meets the
//! target when, read as a big-endian integer, it is strictly below it.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};

use crate::core::types::Hash256;

/// Expand compact bits into the full 256-bit target
pub fn bits_to_target(bits: u32) -> BigUint {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    // Sign bit set means a negative target, which no hash can meet
    if bits & 0x0080_0000 != 0 || mantissa == 0 {
        return BigUint::zero();
    }
    if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent as usize - 3))
    }
}

/// Compress a target back into compact bits, rounding down
pub fn target_to_bits(target: &BigUint) -> u32 {
    if target.is_zero() {
        return 0;
    }
    let mut size = ((target.bits() + 7) / 8) as u32;
    let mut mantissa = if size <= 3 {
        target.to_u32().unwrap_or(0) << (8 * (3 - size))
    } else {
        (target >> (8 * (size as usize - 3))).to_u32().unwrap_or(0)
    };
    // Keep the mantissa positive
    if mantissa & 0x0080_0000 != 0 {
        mantissa >>= 8;
        size += 1;
    }
    (size << 24) | (mantissa & 0x007f_ffff)
}

pub fn hash_to_uint(hash: &Hash256) -> BigUint {
    BigUint::from_bytes_be(hash)
}

pub fn hash_meets_bits(hash: &Hash256, bits: u32) -> bool {
    hash_to_uint(hash) < bits_to_target(bits)
}

/// Scale the previous target by `actual / expected`, clamped to [1/4, 4],
/// and never easier than the pow limit.
pub fn retarget(prev_bits: u32, actual_ms: u64, expected_ms: u64, pow_limit_bits: u32) -> u32 {
    let expected = expected_ms.max(1);
    let actual = actual_ms.clamp(expected / 4, expected.saturating_mul(4));

    let mut target = bits_to_target(prev_bits) * BigUint::from(actual) / BigUint::from(expected);
    let limit = bits_to_target(pow_limit_bits);
    if target > limit {
        target = limit;
    }
    if target.is_zero() {
        target = BigUint::from(1u32);
    }
    target_to_bits(&target)
}

/// Expected number of hashes to find a block at the given bits
pub fn estimated_hashes(bits: u32) -> f64 {
    let target = bits_to_target(bits);
    if target.is_zero() {
        return f64::INFINITY;
    }
    let space = BigUint::from(1u32) << 256usize;
    let ratio = space / (target + 1u32);
    ratio.to_f64().unwrap_or(f64::INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::{INITIAL_BITS, POW_LIMIT_BITS};

    #[test]
    fn test_compact_roundtrip_known_values() {
        for bits in [0x1d00_ffffu32, POW_LIMIT_BITS, INITIAL_BITS, 0x1b04_04cb] {
            assert_eq!(target_to_bits(&bits_to_target(bits)), bits, "bits {:08x}", bits);
        }
    }

    #[test]
    fn test_bitcoin_genesis_target() {
        let target = bits_to_target(0x1d00_ffff);
        let expected = BigUint::from(0xffffu32) << 208usize;
        assert_eq!(target, expected);
    }

    #[test]
    fn test_negative_bits_unreachable() {
        assert!(bits_to_target(0x0480_0001).is_zero());
        assert!(!hash_meets_bits(&[0u8; 32], 0x0480_0001));
    }

    #[test]
    fn test_hash_meets_bits() {
        let mut low = [0u8; 32];
        low[31] = 1;
        assert!(hash_meets_bits(&low, POW_LIMIT_BITS));
        assert!(!hash_meets_bits(&[0xff; 32], POW_LIMIT_BITS));
    }

    #[test]
    fn test_retarget_on_schedule_keeps_bits() {
        let bits = 0x1d00_ffff;
        assert_eq!(retarget(bits, 1000, 1000, POW_LIMIT_BITS), bits);
    }

    #[test]
    fn test_retarget_clamped_to_factor_four() {
        let bits = 0x1d00_ffff;
        let harder = bits_to_target(retarget(bits, 1, 1000, POW_LIMIT_BITS));
        let quarter = bits_to_target(bits) / BigUint::from(4u32);
        assert_eq!(target_to_bits(&harder), target_to_bits(&quarter));

        let easier = bits_to_target(retarget(bits, 1_000_000, 1000, POW_LIMIT_BITS));
        let quadruple = bits_to_target(bits) * BigUint::from(4u32);
        assert_eq!(target_to_bits(&easier), target_to_bits(&quadruple));
    }

    #[test]
    fn test_retarget_capped_at_pow_limit() {
        assert_eq!(retarget(POW_LIMIT_BITS, 10_000, 1000, POW_LIMIT_BITS), POW_LIMIT_BITS);
    }

    #[test]
    fn test_estimated_hashes() {
        let easy = estimated_hashes(POW_LIMIT_BITS);
        assert!(easy > 1.9 && easy < 2.1);
        assert!(estimated_hashes(INITIAL_BITS) > 500.0);
    }
}
