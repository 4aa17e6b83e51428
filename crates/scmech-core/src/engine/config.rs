//! Configuration for mechanism priors and static ground-truth generation.
//!
//! Configs are immutable value types. Each one has sensible defaults and a consuming
//! `validate` that rejects values outside the prior's support before any mechanism
//! is built from it.

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::engine::errors::{MechanismError, Result};

/// Builds the RNG a mechanism owns. `None` seeds from the thread RNG.
pub(crate) fn seeded_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_rng(&mut rand::rng()),
    }
}

fn require_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(MechanismError::InvalidConfig(format!(
            "{} must be finite and > 0, got {}",
            name, value
        )))
    }
}

fn require_finite(name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(MechanismError::InvalidConfig(format!(
            "{} must be finite, got {}",
            name, value
        )))
    }
}

fn require_interval(name: &str, lower: f64, upper: f64) -> Result<()> {
    require_finite(name, lower)?;
    require_finite(name, upper)?;
    if lower < upper {
        Ok(())
    } else {
        Err(MechanismError::InvalidConfig(format!(
            "{} needs lower < upper, got [{}, {}]",
            name, lower, upper
        )))
    }
}

/// Normal-Inverse-Gamma prior of a parentless node.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianRootConfig {
    /// Prior mean of the node's mean.
    pub mu_0: f64,
    /// Pseudo-count on the mean.
    pub kappa_0: f64,
    /// Shape of the Gamma prior on the precision.
    pub alpha_0: f64,
    /// Rate of the Gamma prior on the precision.
    pub beta_0: f64,
    /// Seed of the mechanism-owned RNG.
    pub seed: Option<u64>,
}

impl Default for GaussianRootConfig {
    fn default() -> Self {
        Self {
            mu_0: 0.0,
            kappa_0: 1.0,
            alpha_0: 10.0,
            beta_0: 10.0,
            seed: None,
        }
    }
}

impl GaussianRootConfig {
    pub fn validate(self) -> Result<Self> {
        require_finite("mu_0", self.mu_0)?;
        require_positive("kappa_0", self.kappa_0)?;
        require_positive("alpha_0", self.alpha_0)?;
        require_positive("beta_0", self.beta_0)?;
        Ok(self)
    }
}

/// Hyperparameter priors and static-mode settings for Gaussian-process mechanisms.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianProcessConfig {
    pub noise_var_concentration: f64,
    pub noise_var_rate: f64,
    pub outscale_concentration: f64,
    pub outscale_rate: f64,
    /// Lengthscale prior shape is this multiplier times the number of input dimensions.
    pub lscale_concentration_multiplier: f64,
    pub lscale_rate: f64,
    /// Shape-parameter prior of the rational-quadratic scale mixture.
    pub scale_mix_concentration: f64,
    pub scale_mix_rate: f64,
    /// Constant-mean prior of the linear kernel family.
    pub offset_loc: f64,
    pub offset_scale: f64,
    /// Synthetic training points per input dimension for static mechanisms.
    pub num_support_points: usize,
    pub support_min: f64,
    pub support_max: f64,
    pub seed: Option<u64>,
}

impl Default for GaussianProcessConfig {
    fn default() -> Self {
        Self {
            noise_var_concentration: 10.0,
            noise_var_rate: 100.0,
            outscale_concentration: 10.0,
            outscale_rate: 10.0,
            lscale_concentration_multiplier: 30.0,
            lscale_rate: 30.0,
            scale_mix_concentration: 20.0,
            scale_mix_rate: 10.0,
            offset_loc: 0.0,
            offset_scale: 1.0,
            num_support_points: 20,
            support_min: -10.0,
            support_max: 10.0,
            seed: None,
        }
    }
}

impl GaussianProcessConfig {
    pub fn validate(self) -> Result<Self> {
        require_positive("noise_var_concentration", self.noise_var_concentration)?;
        require_positive("noise_var_rate", self.noise_var_rate)?;
        require_positive("outscale_concentration", self.outscale_concentration)?;
        require_positive("outscale_rate", self.outscale_rate)?;
        require_positive(
            "lscale_concentration_multiplier",
            self.lscale_concentration_multiplier,
        )?;
        require_positive("lscale_rate", self.lscale_rate)?;
        require_positive("scale_mix_concentration", self.scale_mix_concentration)?;
        require_positive("scale_mix_rate", self.scale_mix_rate)?;
        require_finite("offset_loc", self.offset_loc)?;
        require_positive("offset_scale", self.offset_scale)?;
        if self.num_support_points == 0 {
            return Err(MechanismError::InvalidConfig(
                "num_support_points must be > 0".into(),
            ));
        }
        require_interval("support", self.support_min, self.support_max)?;
        Ok(self)
    }
}

/// Parameter ranges of the additive-sigmoid ground-truth generator.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdditiveSigmoidsConfig {
    pub noise_var_concentration: f64,
    pub noise_var_rate: f64,
    pub outscale_concentration: f64,
    pub outscale_rate: f64,
    pub lscale_lower: f64,
    pub lscale_upper: f64,
    pub offset_lower: f64,
    pub offset_upper: f64,
    pub seed: Option<u64>,
}

impl Default for AdditiveSigmoidsConfig {
    fn default() -> Self {
        Self {
            noise_var_concentration: 10.0,
            noise_var_rate: 100.0,
            outscale_concentration: 10.0,
            outscale_rate: 1.0,
            lscale_lower: 0.5,
            lscale_upper: 2.0,
            offset_lower: -2.0,
            offset_upper: 2.0,
            seed: None,
        }
    }
}

impl AdditiveSigmoidsConfig {
    pub fn validate(self) -> Result<Self> {
        require_positive("noise_var_concentration", self.noise_var_concentration)?;
        require_positive("noise_var_rate", self.noise_var_rate)?;
        require_positive("outscale_concentration", self.outscale_concentration)?;
        require_positive("outscale_rate", self.outscale_rate)?;
        require_interval("lscale", self.lscale_lower, self.lscale_upper)?;
        require_interval("offset", self.offset_lower, self.offset_upper)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn defaults_validate() {
        assert!(GaussianRootConfig::default().validate().is_ok());
        assert!(GaussianProcessConfig::default().validate().is_ok());
        assert!(AdditiveSigmoidsConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_nig_prior() {
        let cfg = GaussianRootConfig {
            kappa_0: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(MechanismError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_empty_support() {
        let cfg = GaussianProcessConfig {
            support_min: 1.0,
            support_max: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn seeded_rng_is_deterministic() {
        let a: f64 = seeded_rng(Some(3)).random();
        let b: f64 = seeded_rng(Some(3)).random();
        assert_eq!(a, b);
    }
}
