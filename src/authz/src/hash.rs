//! Deterministic non-cryptographic hashing (FNV-1a, 64-bit)

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a over `bytes`, continuing from `state`
fn fnv1a_update(mut state: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        state ^= u64::from(*byte);
        state = state.wrapping_mul(FNV_PRIME);
    }
    state
}

/// Plain FNV-1a 64
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    fnv1a_update(FNV_OFFSET_BASIS, bytes)
}

/// FNV-1a 64 with the seed mixed in ahead of the payload.
///
/// Distinct seeds give the independent hash functions used by the Bloom filter.
pub fn fnv1a64_seeded(seed: u32, bytes: &[u8]) -> u64 {
    let state = fnv1a_update(FNV_OFFSET_BASIS, &seed.to_le_bytes());
    fnv1a_update(state, bytes)
}

/// Quick-check hash of a resource entry: `(standard_ops, extended_op_count)`
pub fn quick_check(standard_ops: u32, extended_op_count: usize) -> u64 {
    let state = fnv1a_update(FNV_OFFSET_BASIS, &standard_ops.to_le_bytes());
    fnv1a_update(state, &(extended_op_count as u64).to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn test_seeds_are_independent() {
        let key = b"shipment:read";
        assert_ne!(fnv1a64_seeded(0, key), fnv1a64_seeded(1, key));
        assert_eq!(fnv1a64_seeded(3, key), fnv1a64_seeded(3, key));
    }

    #[test]
    fn test_quick_check_distinguishes_inputs() {
        assert_eq!(quick_check(0x0f, 2), quick_check(0x0f, 2));
        assert_ne!(quick_check(0x0f, 2), quick_check(0x0f, 3));
        assert_ne!(quick_check(0x0f, 2), quick_check(0x07, 2));
    }
}
