//! Random attribute-subset masks for adversarial epochs.

use crate::attributes::AttributeMask;
use crate::error::MlError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Draws uniformly random non-empty attribute masks.
#[derive(Debug, Clone)]
pub struct MaskSampler {
    rng: StdRng,
}

impl MaskSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Rejection-sample a mask over `attribute_count` attributes until at
    /// least one entry is set.
    pub fn sample(&mut self, attribute_count: usize) -> Result<AttributeMask, MlError> {
        if attribute_count == 0 {
            return Err(MlError::invalid_input(
                "cannot sample a mask over zero sensitive attributes",
            ));
        }
        loop {
            let bits: Vec<bool> = (0..attribute_count).map(|_| self.rng.gen_bool(0.5)).collect();
            if bits.iter().any(|&b| b) {
                return AttributeMask::new(bits);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_attributes_rejected() {
        let mut sampler = MaskSampler::new(7);
        assert!(matches!(sampler.sample(0), Err(MlError::InvalidInput(_))));
    }

    #[test]
    fn test_single_attribute_always_revealed() {
        let mut sampler = MaskSampler::new(7);
        for _ in 0..50 {
            assert_eq!(sampler.sample(1).unwrap().bits(), &[true]);
        }
    }

    #[test]
    fn test_every_attribute_gets_selected() {
        let mut sampler = MaskSampler::new(2020);
        let mut hits = [0usize; 3];
        for _ in 0..300 {
            let mask = sampler.sample(3).unwrap();
            for (hit, &bit) in hits.iter_mut().zip(mask.bits()) {
                *hit += usize::from(bit);
            }
        }
        assert!(hits.iter().all(|&h| h > 0), "hits: {hits:?}");
    }

    #[test]
    fn test_same_seed_same_masks() {
        let mut a = MaskSampler::new(42);
        let mut b = MaskSampler::new(42);
        for _ in 0..10 {
            assert_eq!(a.sample(4).unwrap(), b.sample(4).unwrap());
        }
    }
}
