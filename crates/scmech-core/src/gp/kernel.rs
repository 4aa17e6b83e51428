//! Covariance functions, mean functions, the Gaussian likelihood, and the
//! hyperparameter sets and priors that parameterise them.
//!
//! Two kernel families exist:
//!
//! - **Rational quadratic** (scale mixture of squared-exponentials), zero mean:
//!   `k(x, x') = s · (1 + r² / (2 α ℓ²))^(-α)` with `r² = ‖x − x'‖²`
//! - **Linear**, constant mean `c`: `k(x, x') = v · ⟨x, x'⟩`
//!
//! A kernel may be restricted to a subset of input columns (its *active dims*); this
//! is how many edges share one covariate table.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

use crate::engine::config::GaussianProcessConfig;
use crate::engine::errors::{MechanismError, Result};
use crate::engine::priors::{floor_noise_variance, GammaPrior, NormalPrior};

/// Kernel-family selector, fixed when a mechanism is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KernelFamily {
    Linear,
    RationalQuadratic,
}

impl KernelFamily {
    pub fn from_linear_flag(linear: bool) -> Self {
        if linear {
            KernelFamily::Linear
        } else {
            KernelFamily::RationalQuadratic
        }
    }

    /// Length of the flat parameter vector of this family.
    pub fn num_parameters(self) -> usize {
        match self {
            KernelFamily::Linear => 3,
            KernelFamily::RationalQuadratic => 4,
        }
    }
}

/// One complete hyperparameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Hyperparameters {
    RationalQuadratic {
        noise_variance: f64,
        outputscale: f64,
        lengthscale: f64,
        scale_mixture: f64,
    },
    Linear {
        noise_variance: f64,
        variance: f64,
        offset: f64,
    },
}

impl Hyperparameters {
    pub fn family(&self) -> KernelFamily {
        match self {
            Hyperparameters::RationalQuadratic { .. } => KernelFamily::RationalQuadratic,
            Hyperparameters::Linear { .. } => KernelFamily::Linear,
        }
    }

    pub fn noise_variance(&self) -> f64 {
        match *self {
            Hyperparameters::RationalQuadratic { noise_variance, .. }
            | Hyperparameters::Linear { noise_variance, .. } => noise_variance,
        }
    }

    /// Flat parameter vector: `[noise, outputscale, lengthscale, scale_mixture]` or
    /// `[noise, variance, offset]`.
    pub fn to_vec(&self) -> Vec<f64> {
        match *self {
            Hyperparameters::RationalQuadratic {
                noise_variance,
                outputscale,
                lengthscale,
                scale_mixture,
            } => vec![noise_variance, outputscale, lengthscale, scale_mixture],
            Hyperparameters::Linear {
                noise_variance,
                variance,
                offset,
            } => vec![noise_variance, variance, offset],
        }
    }

    pub fn from_vec(family: KernelFamily, params: &[f64]) -> Result<Self> {
        if params.len() != family.num_parameters() {
            return Err(MechanismError::InvalidSnapshot(format!(
                "{:?} expects {} parameters, got {}",
                family,
                family.num_parameters(),
                params.len()
            )));
        }
        let hp = match family {
            KernelFamily::RationalQuadratic => Hyperparameters::RationalQuadratic {
                noise_variance: params[0],
                outputscale: params[1],
                lengthscale: params[2],
                scale_mixture: params[3],
            },
            KernelFamily::Linear => Hyperparameters::Linear {
                noise_variance: params[0],
                variance: params[1],
                offset: params[2],
            },
        };
        hp.validate()
    }

    /// Rejects values outside the priors' support.
    pub fn validate(self) -> Result<Self> {
        let positive = match self {
            Hyperparameters::RationalQuadratic {
                noise_variance,
                outputscale,
                lengthscale,
                scale_mixture,
            } => [noise_variance, outputscale, lengthscale, scale_mixture]
                .iter()
                .all(|v| *v > 0.0 && v.is_finite()),
            Hyperparameters::Linear {
                noise_variance,
                variance,
                offset,
            } => [noise_variance, variance]
                .iter()
                .all(|v| *v > 0.0 && v.is_finite())
                && offset.is_finite(),
        };
        if positive {
            Ok(self)
        } else {
            Err(MechanismError::Numerical(format!(
                "hyperparameters outside their support: {:?}",
                self
            )))
        }
    }

    /// Splits the set into the solver-facing kernel, mean and likelihood.
    pub fn components(&self, active_dims: Option<&[usize]>) -> (Kernel, MeanFunction, GaussianLikelihood) {
        let active_dims = active_dims.map(<[usize]>::to_vec);
        match *self {
            Hyperparameters::RationalQuadratic {
                noise_variance,
                outputscale,
                lengthscale,
                scale_mixture,
            } => (
                Kernel::RationalQuadratic {
                    outputscale,
                    lengthscale,
                    scale_mixture,
                    active_dims,
                },
                MeanFunction::Zero,
                GaussianLikelihood::new(noise_variance),
            ),
            Hyperparameters::Linear {
                noise_variance,
                variance,
                offset,
            } => (
                Kernel::Linear {
                    variance,
                    active_dims,
                },
                MeanFunction::Constant(offset),
                GaussianLikelihood::new(noise_variance),
            ),
        }
    }

    /// Inverse of [`Hyperparameters::components`].
    pub fn from_components(
        kernel: &Kernel,
        mean: &MeanFunction,
        likelihood: &GaussianLikelihood,
    ) -> Self {
        match *kernel {
            Kernel::RationalQuadratic {
                outputscale,
                lengthscale,
                scale_mixture,
                ..
            } => Hyperparameters::RationalQuadratic {
                noise_variance: likelihood.noise_variance,
                outputscale,
                lengthscale,
                scale_mixture,
            },
            Kernel::Linear { variance, .. } => Hyperparameters::Linear {
                noise_variance: likelihood.noise_variance,
                variance,
                offset: mean.constant(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FamilyPriors {
    RationalQuadratic {
        lengthscale: GammaPrior,
        scale_mixture: GammaPrior,
    },
    Linear {
        offset: NormalPrior,
    },
}

/// Independent priors over one hyperparameter set.
#[derive(Debug, Clone, Copy)]
pub struct HyperparameterPriors {
    noise_variance: GammaPrior,
    outputscale: GammaPrior,
    family: FamilyPriors,
}

impl HyperparameterPriors {
    /// `input_dims` scales the lengthscale prior's shape; it is clamped to at least one
    /// so that parentless edges still get a proper prior.
    pub fn from_config(
        cfg: &GaussianProcessConfig,
        family: KernelFamily,
        input_dims: usize,
    ) -> Result<Self> {
        let noise_variance = GammaPrior::new(cfg.noise_var_concentration, cfg.noise_var_rate)?;
        let outputscale = GammaPrior::new(cfg.outscale_concentration, cfg.outscale_rate)?;
        let family = match family {
            KernelFamily::RationalQuadratic => FamilyPriors::RationalQuadratic {
                lengthscale: GammaPrior::new(
                    cfg.lscale_concentration_multiplier * input_dims.max(1) as f64,
                    cfg.lscale_rate,
                )?,
                scale_mixture: GammaPrior::new(cfg.scale_mix_concentration, cfg.scale_mix_rate)?,
            },
            KernelFamily::Linear => FamilyPriors::Linear {
                offset: NormalPrior::new(cfg.offset_loc, cfg.offset_scale)?,
            },
        };
        Ok(Self {
            noise_variance,
            outputscale,
            family,
        })
    }

    pub fn family(&self) -> KernelFamily {
        match self.family {
            FamilyPriors::RationalQuadratic { .. } => KernelFamily::RationalQuadratic,
            FamilyPriors::Linear { .. } => KernelFamily::Linear,
        }
    }

    /// Prior means, noise floored. Used to fill a freshly created edge before its
    /// hyperparameters are drawn.
    pub fn mean(&self) -> Hyperparameters {
        let noise_variance = floor_noise_variance(self.noise_variance.mean());
        let outputscale = self.outputscale.mean();
        match self.family {
            FamilyPriors::RationalQuadratic {
                lengthscale,
                scale_mixture,
            } => Hyperparameters::RationalQuadratic {
                noise_variance,
                outputscale,
                lengthscale: lengthscale.mean(),
                scale_mixture: scale_mixture.mean(),
            },
            FamilyPriors::Linear { offset } => Hyperparameters::Linear {
                noise_variance,
                variance: outputscale,
                offset: offset.loc(),
            },
        }
    }

    /// Draws every hyperparameter independently; the noise variance is floored.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Hyperparameters {
        let noise_variance = floor_noise_variance(self.noise_variance.sample(rng));
        let outputscale = self.outputscale.sample(rng);
        match self.family {
            FamilyPriors::RationalQuadratic {
                lengthscale,
                scale_mixture,
            } => Hyperparameters::RationalQuadratic {
                noise_variance,
                outputscale,
                lengthscale: lengthscale.sample(rng),
                scale_mixture: scale_mixture.sample(rng),
            },
            FamilyPriors::Linear { offset } => Hyperparameters::Linear {
                noise_variance,
                variance: outputscale,
                offset: offset.sample(rng),
            },
        }
    }

    /// Sum of the priors' log-densities at `hp`.
    pub fn log_prob(&self, hp: &Hyperparameters) -> Result<f64> {
        match (self.family, *hp) {
            (
                FamilyPriors::RationalQuadratic {
                    lengthscale,
                    scale_mixture,
                },
                Hyperparameters::RationalQuadratic {
                    noise_variance,
                    outputscale,
                    lengthscale: ls,
                    scale_mixture: mix,
                },
            ) => Ok(self.noise_variance.log_prob(noise_variance)
                + self.outputscale.log_prob(outputscale)
                + lengthscale.log_prob(ls)
                + scale_mixture.log_prob(mix)),
            (
                FamilyPriors::Linear { offset },
                Hyperparameters::Linear {
                    noise_variance,
                    variance,
                    offset: c,
                },
            ) => Ok(self.noise_variance.log_prob(noise_variance)
                + self.outputscale.log_prob(variance)
                + offset.log_prob(c)),
            _ => Err(MechanismError::InvalidConfig(format!(
                "hyperparameters {:?} do not match prior family {:?}",
                hp.family(),
                self.family()
            ))),
        }
    }
}

/// Covariance function, optionally restricted to a subset of input columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    RationalQuadratic {
        outputscale: f64,
        lengthscale: f64,
        scale_mixture: f64,
        active_dims: Option<Vec<usize>>,
    },
    Linear {
        variance: f64,
        active_dims: Option<Vec<usize>>,
    },
}

impl Kernel {
    pub fn active_dims(&self) -> Option<&[usize]> {
        match self {
            Kernel::RationalQuadratic { active_dims, .. } | Kernel::Linear { active_dims, .. } => {
                active_dims.as_deref()
            }
        }
    }

    fn project(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        match self.active_dims() {
            Some(dims) => x.select_columns(dims.iter()),
            None => x.clone(),
        }
    }

    /// Cross-covariance matrix `K(a, b)` of shape `a.nrows() × b.nrows()`.
    pub fn covariance(&self, a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
        let a = self.project(a);
        let b = self.project(b);
        match *self {
            Kernel::RationalQuadratic {
                outputscale,
                lengthscale,
                scale_mixture,
                ..
            } => {
                let denom = 2.0 * scale_mixture * lengthscale * lengthscale;
                DMatrix::from_fn(a.nrows(), b.nrows(), |i, j| {
                    let r2 = (a.row(i) - b.row(j)).norm_squared();
                    outputscale * (1.0 + r2 / denom).powf(-scale_mixture)
                })
            }
            Kernel::Linear { variance, .. } => {
                DMatrix::from_fn(a.nrows(), b.nrows(), |i, j| variance * a.row(i).dot(&b.row(j)))
            }
        }
    }
}

/// Prior mean of the latent function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeanFunction {
    Zero,
    Constant(f64),
}

impl MeanFunction {
    pub fn constant(&self) -> f64 {
        match *self {
            MeanFunction::Zero => 0.0,
            MeanFunction::Constant(c) => c,
        }
    }

    pub fn evaluate(&self, x: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_element(x.nrows(), self.constant())
    }
}

/// Homoscedastic Gaussian observation noise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianLikelihood {
    pub noise_variance: f64,
}

impl GaussianLikelihood {
    pub fn new(noise_variance: f64) -> Self {
        Self { noise_variance }
    }
}
