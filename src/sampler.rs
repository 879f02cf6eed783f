//! Random variate source for the strategy scheduler.
//!
//! One uniform stream gates mixup activation; an optional symmetric beta
//! distribution provides the blend weight. The beta half stays unarmed until
//! the scheduler sets a shape parameter, and can be disarmed again when
//! augmentation weakens.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Distribution};

use crate::error::{Result, VisionError};

/// Stateful source of the per-epoch mixup variates.
///
/// Independently seedable so decision streams are reproducible in tests and
/// identical across data-parallel replicas started from the same seed.
#[derive(Debug)]
pub struct DistributionSampler {
    rng: StdRng,
    beta: Option<Beta<f64>>,
    alpha: Option<f64>,
}

impl DistributionSampler {
    /// Create a sampler from a seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            beta: None,
            alpha: None,
        }
    }

    /// Draw from `U[0, 1)`.
    pub fn draw_uniform(&mut self) -> f64 {
        self.rng.gen::<f64>()
    }

    /// Draw from the armed `Beta(alpha, alpha)`, or `None` while unarmed.
    pub fn draw_beta(&mut self) -> Option<f64> {
        self.beta.as_ref().map(|beta| beta.sample(&mut self.rng))
    }

    /// Arm the beta distribution with a symmetric shape parameter.
    ///
    /// # Errors
    ///
    /// Returns a strategy error for a non-positive shape parameter.
    pub fn arm(&mut self, alpha: f64) -> Result<()> {
        let beta = Beta::new(alpha, alpha).map_err(|e| {
            VisionError::Strategy(format!("invalid beta shape parameter {alpha}: {e}"))
        })?;
        self.beta = Some(beta);
        self.alpha = Some(alpha);
        Ok(())
    }

    /// Drop the beta distribution; subsequent draws return `None`.
    pub fn disarm(&mut self) {
        self.beta = None;
        self.alpha = None;
    }

    /// Whether a beta shape is currently armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.beta.is_some()
    }

    /// The armed shape parameter, if any.
    #[must_use]
    pub fn alpha(&self) -> Option<f64> {
        self.alpha
    }

    /// Re-arm from a restored shape parameter, if present.
    ///
    /// # Errors
    ///
    /// Propagates the arming error for invalid restored values.
    pub fn restore(&mut self, alpha: Option<f64>) -> Result<()> {
        match alpha {
            Some(a) => self.arm(a),
            None => {
                self.disarm();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_range() {
        let mut sampler = DistributionSampler::seeded(0);
        for _ in 0..1000 {
            let u = sampler.draw_uniform();
            assert!((0.0..1.0).contains(&u));
        }
    }

    #[test]
    fn test_beta_unarmed_returns_none() {
        let mut sampler = DistributionSampler::seeded(0);
        assert!(!sampler.is_armed());
        assert!(sampler.draw_beta().is_none());
    }

    #[test]
    fn test_beta_armed_draws_in_unit_interval() {
        let mut sampler = DistributionSampler::seeded(0);
        sampler.arm(0.2).unwrap();
        assert!(sampler.is_armed());
        for _ in 0..1000 {
            let lam = sampler.draw_beta().unwrap();
            assert!((0.0..=1.0).contains(&lam));
        }
    }

    #[test]
    fn test_disarm_clears_shape() {
        let mut sampler = DistributionSampler::seeded(0);
        sampler.arm(0.1).unwrap();
        sampler.disarm();
        assert!(!sampler.is_armed());
        assert!(sampler.draw_beta().is_none());
        assert!(sampler.alpha().is_none());
    }

    #[test]
    fn test_invalid_shape_rejected() {
        let mut sampler = DistributionSampler::seeded(0);
        assert!(sampler.arm(0.0).is_err());
        assert!(sampler.arm(-1.0).is_err());
    }

    #[test]
    fn test_seeded_streams_reproducible() {
        let mut a = DistributionSampler::seeded(7);
        let mut b = DistributionSampler::seeded(7);
        a.arm(0.2).unwrap();
        b.arm(0.2).unwrap();

        for _ in 0..100 {
            assert_eq!(a.draw_uniform().to_bits(), b.draw_uniform().to_bits());
            assert_eq!(
                a.draw_beta().unwrap().to_bits(),
                b.draw_beta().unwrap().to_bits()
            );
        }
    }

    #[test]
    fn test_restore_round_trip() {
        let mut sampler = DistributionSampler::seeded(0);
        sampler.restore(Some(0.1)).unwrap();
        assert_eq!(sampler.alpha(), Some(0.1));
        sampler.restore(None).unwrap();
        assert!(!sampler.is_armed());
    }
}
