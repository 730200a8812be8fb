//! Test-case producers. Deliberately dumb: the interesting signal comes from
//! the fitness pipeline, not from clever mutations.

use rand::{distributions::Bernoulli, prelude::*};

/// A stateless-looking producer of test cases. Mutators keep RNG state, so
/// generation takes `&mut self`.
pub trait InputGen: Send {
    fn generate(&mut self) -> Vec<u8>;
}

/// Always returns the seed input unchanged.
#[derive(Debug, Clone)]
pub struct SeedCopier {
    seed: Vec<u8>,
}

impl SeedCopier {
    #[must_use]
    pub fn new(seed: Vec<u8>) -> Self {
        Self { seed }
    }
}

impl InputGen for SeedCopier {
    fn generate(&mut self) -> Vec<u8> {
        self.seed.clone()
    }
}

/// Flips each bit of the seed independently with a fixed probability.
#[derive(Debug, Clone)]
pub struct RatioMutator {
    seed: Vec<u8>,
    flip: Bernoulli,
    rng: SmallRng,
}

impl RatioMutator {
    /// # Panics
    /// Panics if `ratio` is outside `[0, 1]`.
    #[must_use]
    pub fn new(seed: Vec<u8>, ratio: f64) -> Self {
        Self {
            seed,
            flip: Bernoulli::new(ratio).expect("bit-flip ratio must be a probability"),
            rng: SmallRng::from_entropy(),
        }
    }
}

impl InputGen for RatioMutator {
    fn generate(&mut self) -> Vec<u8> {
        let mut testcase = self.seed.clone();
        for byte in &mut testcase {
            for bit in 0..8 {
                if self.flip.sample(&mut self.rng) {
                    *byte ^= 1 << bit;
                }
            }
        }
        testcase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_copier_is_identity() {
        let mut gen = SeedCopier::new(vec![b'A'; 32]);
        assert_eq!(gen.generate(), vec![b'A'; 32]);
        assert_eq!(gen.generate(), vec![b'A'; 32]);
    }

    #[test]
    fn zero_ratio_never_mutates() {
        let mut gen = RatioMutator::new(vec![0x55; 64], 0.0);
        assert_eq!(gen.generate(), vec![0x55; 64]);
    }

    #[test]
    fn full_ratio_flips_every_bit() {
        let mut gen = RatioMutator::new(vec![0x0f; 8], 1.0);
        assert_eq!(gen.generate(), vec![0xf0; 8]);
    }

    #[test]
    fn ratio_mutation_stays_close_to_ratio() {
        let mut gen = RatioMutator::new(vec![0u8; 1024], 1.0 / 100.0);
        let out = gen.generate();
        let flipped: u32 = out.iter().map(|b| b.count_ones()).sum();
        // 8192 bits at 1% gives ~82 expected flips; allow a generous band.
        assert!(flipped > 20 && flipped < 250, "flipped {flipped} bits");
    }
}
