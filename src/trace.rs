//! The branch-hit trace map: its dimensions, its structural hash and the
//! logarithmic value transform applied before any PCA math.

use std::sync::OnceLock;

use crate::config::REGULIZER;

/// log2 of the trace map size.
pub const MAP_SIZE_POW2: usize = 16;
/// Size of the shared branch-hit map. One byte per branch identifier.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

// The hash walks the map in 8-byte strides and the shared-memory attach is
// checked for 8-byte alignment, so both properties are enforced here instead
// of at every use site.
const _: () = assert!(MAP_SIZE.is_power_of_two());
const _: () = assert!(MAP_SIZE % 8 == 0);

const HASH_SEED: u64 = 0xa5b3_5705;

/// 64-bit structural hash of a trace, from AFL's coverage hash lineage
/// (MurmurHash3 finalizer). Deterministic, depends only on the bytes.
///
/// # Panics
/// Panics if `trace.len()` is not a multiple of 8.
#[must_use]
pub fn hash_trace(trace: &[u8]) -> u64 {
    const LOOP_MULT1: u64 = 0x87c3_7b91_1142_53d5;
    const LOOP_MULT2: u64 = 0x4cf5_ad43_2745_937f;
    const LOOP_ADD: u64 = 0x52dc_e729;
    const END_MULT1: u64 = 0xff51_afd7_ed55_8ccd;
    const END_MULT2: u64 = 0xc4ce_b9fe_1a85_ec53;
    const END_SHIFT: u32 = 33;

    assert!(trace.len() % 8 == 0, "trace length must be a multiple of 8");

    let mut hash = HASH_SEED ^ trace.len() as u64;
    for chunk in trace.chunks_exact(8) {
        let mut k = u64::from_ne_bytes(chunk.try_into().unwrap());
        k = k.wrapping_mul(LOOP_MULT1);
        k = k.rotate_left(31);
        k = k.wrapping_mul(LOOP_MULT2);

        hash ^= k;
        hash = hash.rotate_left(27);
        hash = hash.wrapping_mul(5).wrapping_add(LOOP_ADD);
    }

    hash ^= hash >> END_SHIFT;
    hash = hash.wrapping_mul(END_MULT1);
    hash ^= hash >> END_SHIFT;
    hash = hash.wrapping_mul(END_MULT2);
    hash ^= hash >> END_SHIFT;

    hash
}

/// Lookup table mapping a raw hit-count byte to its regularized logarithm:
/// `ln(v + r) - ln(r)`. Zero maps to zero, so untouched branches contribute
/// nothing to a centered sample.
pub fn log_vals() -> &'static [f64; 256] {
    static LOG_VALS: OnceLock<[f64; 256]> = OnceLock::new();
    LOG_VALS.get_or_init(|| {
        let log_reg = REGULIZER.ln();
        let mut vals = [0.0f64; 256];
        for (v, slot) in vals.iter_mut().enumerate() {
            *slot = (v as f64 + REGULIZER).ln() - log_reg;
        }
        vals
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let mut trace = vec![0u8; MAP_SIZE];
        trace[42] = 3;
        trace[MAP_SIZE - 1] = 255;
        assert_eq!(hash_trace(&trace), hash_trace(&trace.clone()));
    }

    #[test]
    fn hash_depends_on_content() {
        let zeroed = vec![0u8; MAP_SIZE];
        let mut touched = zeroed.clone();
        touched[0] = 1;
        assert_ne!(hash_trace(&zeroed), hash_trace(&touched));

        // Same byte at a different index is a different structure.
        let mut shifted = zeroed.clone();
        shifted[8] = 1;
        assert_ne!(hash_trace(&touched), hash_trace(&shifted));
    }

    #[test]
    fn log_vals_shape() {
        let vals = log_vals();
        assert_eq!(vals[0], 0.0);
        // Strictly increasing in the hit count.
        for v in 1..256 {
            assert!(vals[v] > vals[v - 1]);
        }
    }
}
