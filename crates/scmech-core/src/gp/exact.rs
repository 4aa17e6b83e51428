//! Exact Gaussian-process regression.
//!
//! Given training covariates `X`, targets `y`, a kernel `k`, mean `m` and noise `σ²`,
//! the latent predictive at new inputs `X*` is
//!
//! ```text
//! K   = k(X, X) + σ² I              (factorised once, cached)
//! w   = K⁻¹ (y − m(X))
//! μ*  = m(X*) + k(X, X*)ᵀ w
//! Σ*  = k(X*, X*) − k(X, X*)ᵀ K⁻¹ k(X, X*)
//! ```
//!
//! In prior mode (or without training data) the training set is ignored and the
//! predictive is `N(m(X*), k(X*, X*))`. The observation predictive adds `σ² I`.
//!
//! The training factor depends on the kernel, mean and likelihood in use, so callers
//! must [`ExactGpSolver::clear_cache`] whenever any of them changes.

use std::f64::consts::PI;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::engine::errors::{MechanismError, Result};
use crate::gp::kernel::{GaussianLikelihood, Kernel, MeanFunction};
use crate::mechanisms::Mode;

/// Diagonal jitter tried, in order, when a covariance is not numerically positive-definite.
const JITTER_SCHEDULE: [f64; 3] = [1e-6, 1e-5, 1e-4];

fn cholesky_with_jitter(matrix: DMatrix<f64>) -> Result<Cholesky<f64, Dyn>> {
    if let Some(chol) = Cholesky::new(matrix.clone()) {
        return Ok(chol);
    }
    for jitter in JITTER_SCHEDULE {
        let mut jittered = matrix.clone();
        for i in 0..jittered.nrows() {
            jittered[(i, i)] += jitter;
        }
        if let Some(chol) = Cholesky::new(jittered) {
            #[cfg(feature = "tracing")]
            tracing::warn!(jitter, size = matrix.nrows(), "covariance needed diagonal jitter");
            return Ok(chol);
        }
    }
    Err(MechanismError::Numerical(format!(
        "covariance of size {} is not positive-definite",
        matrix.nrows()
    )))
}

/// Borrowed view of the three model components the solver needs.
#[derive(Debug, Clone, Copy)]
pub struct GpModel<'a> {
    pub kernel: &'a Kernel,
    pub mean: &'a MeanFunction,
    pub likelihood: &'a GaussianLikelihood,
}

/// Multivariate normal over the outputs of one dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateNormal {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl MultivariateNormal {
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        if covariance.nrows() != mean.len() || covariance.ncols() != mean.len() {
            return Err(MechanismError::ShapeMismatch(format!(
                "covariance {}x{} does not match mean of length {}",
                covariance.nrows(),
                covariance.ncols(),
                mean.len()
            )));
        }
        Ok(Self { mean, covariance })
    }

    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn variance(&self) -> DVector<f64> {
        self.covariance.diagonal()
    }

    pub fn len(&self) -> usize {
        self.mean.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }

    /// Marginalises the Gaussian likelihood: adds `σ² I` to the covariance.
    pub fn with_likelihood(mut self, likelihood: &GaussianLikelihood) -> Self {
        for i in 0..self.covariance.nrows() {
            self.covariance[(i, i)] += likelihood.noise_variance;
        }
        self
    }

    pub fn log_prob(&self, value: &DVector<f64>) -> Result<f64> {
        if value.len() != self.mean.len() {
            return Err(MechanismError::ShapeMismatch(format!(
                "value of length {} under a distribution of length {}",
                value.len(),
                self.mean.len()
            )));
        }
        let n = self.mean.len();
        if n == 0 {
            return Ok(0.0);
        }
        let chol = cholesky_with_jitter(self.covariance.clone())?;
        let residual = value - &self.mean;
        let z = chol
            .l()
            .solve_lower_triangular(&residual)
            .ok_or_else(|| MechanismError::Numerical("singular Cholesky factor".into()))?;
        let log_det: f64 = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
        let lp = -0.5 * (z.norm_squared() + log_det + n as f64 * (2.0 * PI).ln());
        if lp.is_nan() {
            return Err(MechanismError::Numerical("log-density is NaN".into()));
        }
        Ok(lp)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<DVector<f64>> {
        let n = self.mean.len();
        if n == 0 {
            return Ok(DVector::zeros(0));
        }
        let chol = cholesky_with_jitter(self.covariance.clone())?;
        let eps = DVector::<f64>::from_fn(n, |_, _| StandardNormal.sample(&mut *rng));
        Ok(&self.mean + chol.l() * eps)
    }
}

/// Training covariates and targets.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingData {
    pub inputs: DMatrix<f64>,
    pub targets: DVector<f64>,
}

#[derive(Debug, Clone)]
struct TrainingFactor {
    cholesky: Cholesky<f64, Dyn>,
    weights: DVector<f64>,
}

/// Exact GP solver owning one training set and the factor cached for the model last
/// used against it.
#[derive(Debug, Clone, Default)]
pub struct ExactGpSolver {
    train: Option<TrainingData>,
    cache: Option<TrainingFactor>,
}

impl ExactGpSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the training set. Drops any cached factor.
    pub fn set_train_data(&mut self, inputs: DMatrix<f64>, targets: DVector<f64>) -> Result<()> {
        if inputs.nrows() != targets.len() {
            return Err(MechanismError::ShapeMismatch(format!(
                "{} training inputs vs {} targets",
                inputs.nrows(),
                targets.len()
            )));
        }
        self.train = Some(TrainingData { inputs, targets });
        self.cache = None;
        Ok(())
    }

    pub fn train_data(&self) -> Option<&TrainingData> {
        self.train.as_ref()
    }

    pub fn clear_cache(&mut self) {
        self.cache = None;
    }

    pub fn has_cached_factor(&self) -> bool {
        self.cache.is_some()
    }

    fn factor(&mut self, model: GpModel<'_>) -> Result<Option<(&TrainingData, &TrainingFactor)>> {
        let Some(train) = self.train.as_ref() else {
            return Ok(None);
        };
        if self.cache.is_none() {
            let mut k = model.kernel.covariance(&train.inputs, &train.inputs);
            for i in 0..k.nrows() {
                k[(i, i)] += model.likelihood.noise_variance;
            }
            let cholesky = cholesky_with_jitter(k)?;
            let residual = &train.targets - model.mean.evaluate(&train.inputs);
            let weights = cholesky.solve(&residual);
            self.cache = Some(TrainingFactor { cholesky, weights });
        }
        Ok(self.cache.as_ref().map(|factor| (train, factor)))
    }

    /// Latent-function predictive at `inputs`.
    pub fn predict(
        &mut self,
        model: GpModel<'_>,
        inputs: &DMatrix<f64>,
        mode: Mode,
    ) -> Result<MultivariateNormal> {
        let prior_mean = model.mean.evaluate(inputs);
        let prior_cov = model.kernel.covariance(inputs, inputs);
        if mode == Mode::Prior {
            return MultivariateNormal::new(prior_mean, prior_cov);
        }

        let Some((train, factor)) = self.factor(model)? else {
            return MultivariateNormal::new(prior_mean, prior_cov);
        };
        let cross = model.kernel.covariance(&train.inputs, inputs);
        let mean = prior_mean + cross.transpose() * &factor.weights;
        let reduction = cross.transpose() * factor.cholesky.solve(&cross);
        let cov = prior_cov - reduction;
        // Restore exact symmetry lost to round-off.
        let cov = (&cov + cov.transpose()) * 0.5;
        MultivariateNormal::new(mean, cov)
    }

    /// Observation predictive (latent predictive plus likelihood noise).
    pub fn predict_observations(
        &mut self,
        model: GpModel<'_>,
        inputs: &DMatrix<f64>,
        mode: Mode,
    ) -> Result<MultivariateNormal> {
        Ok(self.predict(model, inputs, mode)?.with_likelihood(model.likelihood))
    }
}
