//! Hyperparameter priors.
//!
//! Each prior keeps its validated parameters next to a ready-built `rand_distr`
//! sampler, so drawing never has to re-validate. Gamma priors are parameterised by
//! shape (concentration) and *rate*; `rand_distr` wants a scale, so the sampler is
//! built with `1 / rate`.

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Distribution, Gamma, Normal, Uniform};
use statrs::function::gamma::ln_gamma;

use crate::engine::errors::{MechanismError, Result};

/// Smallest noise variance a mechanism will ever hold.
///
/// Draws below the floor are replaced by the floor itself, silently.
pub const NOISE_VARIANCE_FLOOR: f64 = 1e-3;

/// Applies [`NOISE_VARIANCE_FLOOR`].
#[inline]
pub fn floor_noise_variance(noise_variance: f64) -> f64 {
    if noise_variance > NOISE_VARIANCE_FLOOR {
        noise_variance
    } else {
        NOISE_VARIANCE_FLOOR
    }
}

/// Log-density of `N(mean, variance)` at `x`.
#[inline]
pub fn normal_log_density(x: f64, mean: f64, variance: f64) -> f64 {
    let diff = x - mean;
    -0.5 * ((2.0 * PI * variance).ln() + diff * diff / variance)
}

/// `Gamma(concentration, rate)` prior over a positive hyperparameter.
#[derive(Debug, Clone, Copy)]
pub struct GammaPrior {
    concentration: f64,
    rate: f64,
    sampler: Gamma<f64>,
}

impl GammaPrior {
    pub fn new(concentration: f64, rate: f64) -> Result<Self> {
        if !(concentration > 0.0 && concentration.is_finite()) {
            return Err(MechanismError::InvalidConfig(format!(
                "gamma concentration must be finite and > 0, got {}",
                concentration
            )));
        }
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(MechanismError::InvalidConfig(format!(
                "gamma rate must be finite and > 0, got {}",
                rate
            )));
        }
        let sampler = Gamma::new(concentration, 1.0 / rate)
            .map_err(|e| MechanismError::InvalidConfig(format!("gamma prior: {}", e)))?;
        Ok(Self {
            concentration,
            rate,
            sampler,
        })
    }

    pub fn concentration(&self) -> f64 {
        self.concentration
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn mean(&self) -> f64 {
        self.concentration / self.rate
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.sampler.sample(rng)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        if x <= 0.0 {
            return f64::NEG_INFINITY;
        }
        self.concentration * self.rate.ln() - ln_gamma(self.concentration)
            + (self.concentration - 1.0) * x.ln()
            - self.rate * x
    }
}

/// `Normal(loc, scale)` prior over an unconstrained hyperparameter.
#[derive(Debug, Clone, Copy)]
pub struct NormalPrior {
    loc: f64,
    scale: f64,
    sampler: Normal<f64>,
}

impl NormalPrior {
    pub fn new(loc: f64, scale: f64) -> Result<Self> {
        if !loc.is_finite() || !(scale > 0.0 && scale.is_finite()) {
            return Err(MechanismError::InvalidConfig(format!(
                "normal prior needs finite loc and scale > 0, got ({}, {})",
                loc, scale
            )));
        }
        let sampler = Normal::new(loc, scale)
            .map_err(|e| MechanismError::InvalidConfig(format!("normal prior: {}", e)))?;
        Ok(Self { loc, scale, sampler })
    }

    pub fn loc(&self) -> f64 {
        self.loc
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.sampler.sample(rng)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        normal_log_density(x, self.loc, self.scale * self.scale)
    }
}

/// `Uniform[low, high)` prior, used by the additive-sigmoid generator.
#[derive(Debug, Clone, Copy)]
pub struct UniformPrior {
    low: f64,
    high: f64,
    sampler: Uniform<f64>,
}

impl UniformPrior {
    pub fn new(low: f64, high: f64) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(MechanismError::InvalidConfig(format!(
                "uniform prior needs finite low < high, got [{}, {})",
                low, high
            )));
        }
        let sampler = Uniform::new(low, high)
            .map_err(|e| MechanismError::InvalidConfig(format!("uniform prior: {}", e)))?;
        Ok(Self { low, high, sampler })
    }

    pub fn low(&self) -> f64 {
        self.low
    }

    pub fn high(&self) -> f64 {
        self.high
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.sampler.sample(rng)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        if x >= self.low && x < self.high {
            -(self.high - self.low).ln()
        } else {
            f64::NEG_INFINITY
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn floor_replaces_small_draws_exactly() {
        assert_eq!(floor_noise_variance(1e-7), NOISE_VARIANCE_FLOOR);
        assert_eq!(floor_noise_variance(0.0), NOISE_VARIANCE_FLOOR);
        assert_eq!(floor_noise_variance(0.25), 0.25);
    }

    #[test]
    fn gamma_log_prob_matches_exponential_special_case() {
        // Gamma(1, rate) is Exponential(rate): log p(x) = ln(rate) - rate * x
        let prior = GammaPrior::new(1.0, 2.0).unwrap();
        let expected = 2.0_f64.ln() - 2.0 * 0.7;
        assert!((prior.log_prob(0.7) - expected).abs() < 1e-12);
        assert_eq!(prior.log_prob(-1.0), f64::NEG_INFINITY);
    }

    #[test]
    fn gamma_samples_use_rate_parameterisation() {
        let prior = GammaPrior::new(4.0, 8.0).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let n = 20_000;
        let mean = (0..n).map(|_| prior.sample(&mut rng)).sum::<f64>() / n as f64;
        assert!((mean - prior.mean()).abs() < 0.02, "mean {}", mean);
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        assert!(GammaPrior::new(0.0, 1.0).is_err());
        assert!(GammaPrior::new(1.0, -1.0).is_err());
        assert!(NormalPrior::new(0.0, 0.0).is_err());
        assert!(UniformPrior::new(1.0, 1.0).is_err());
    }

    #[test]
    fn normal_log_prob_at_mean() {
        let prior = NormalPrior::new(1.5, 2.0).unwrap();
        let expected = -0.5 * (2.0 * PI * 4.0).ln();
        assert!((prior.log_prob(1.5) - expected).abs() < 1e-12);
    }
}
