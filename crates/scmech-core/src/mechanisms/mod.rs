//! Mechanisms: per-node generative models of a structural causal model.
//!
//! Every mechanism answers the same four questions about a node given its parents'
//! values:
//!
//! - **forward**: predictive mean
//! - **sample**: a draw from the predictive
//! - **log marginal likelihood**: score of observed targets, for model comparison
//! - **expected noise entropy**: entropy of the observation noise
//!
//! Inputs are batches of datasets. Dataset `b` is an `n_b × in_size` matrix and its
//! targets a vector of length `n_b`. Outputs carry one value per input row, or one
//! log-likelihood per dataset.
//!
//! Bayesian and static (frozen ground-truth) behaviour are separate types, so no method
//! has to branch on a "static" flag.

pub mod additive;
pub mod gaussian_process;
pub mod root;
pub mod shared_edge;

use nalgebra::{DMatrix, DVector};

use crate::engine::errors::{MechanismError, Result};
use crate::snapshot::MechanismSnapshot;

pub use additive::AdditiveSigmoids;
pub use gaussian_process::{
    GaussianProcessMechanism, HyperparameterSelection, HyperparameterSwitch, StaticGaussianProcess,
};
pub use root::{ConjugateGaussianRoot, GroundTruth, NigParams, StaticGaussianRoot};
pub use shared_edge::{SharedEdgeGaussianProcessRegistry, SharedEdgeMechanism};

/// Which parameter state a call evaluates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Prior parameters; training data is ignored.
    Prior,
    /// Posterior parameters, conditioned on training data.
    Posterior,
}

impl Mode {
    pub fn from_prior_flag(prior_mode: bool) -> Self {
        if prior_mode {
            Mode::Prior
        } else {
            Mode::Posterior
        }
    }

    pub fn is_prior(self) -> bool {
        self == Mode::Prior
    }
}

/// Capability set shared by all mechanism variants.
pub trait Mechanism {
    /// Number of parent dimensions.
    fn in_size(&self) -> usize;

    fn forward(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>>;

    fn sample(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>>;

    /// One log marginal likelihood per dataset.
    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<Vec<f64>>;

    /// Log marginal likelihood summed over the batch.
    fn total_log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<f64> {
        Ok(self
            .log_marginal_likelihood(inputs, targets, mode)?
            .into_iter()
            .sum())
    }

    fn expected_noise_entropy(&mut self, mode: Mode) -> Result<f64>;
}

/// Every input matrix must have `in_size` columns.
pub(crate) fn check_inputs(in_size: usize, inputs: &[DMatrix<f64>]) -> Result<()> {
    for (b, x) in inputs.iter().enumerate() {
        if x.ncols() != in_size {
            return Err(MechanismError::ShapeMismatch(format!(
                "dataset {}: expected {} input columns, got {}",
                b,
                in_size,
                x.ncols()
            )));
        }
    }
    Ok(())
}

/// Inputs and targets must agree in batch size and per-dataset length.
pub(crate) fn check_targets(
    in_size: usize,
    inputs: &[DMatrix<f64>],
    targets: &[DVector<f64>],
) -> Result<()> {
    check_inputs(in_size, inputs)?;
    if inputs.len() != targets.len() {
        return Err(MechanismError::ShapeMismatch(format!(
            "batch size mismatch: {} input datasets vs {} target datasets",
            inputs.len(),
            targets.len()
        )));
    }
    for (b, (x, y)) in inputs.iter().zip(targets).enumerate() {
        if x.nrows() != y.len() {
            return Err(MechanismError::ShapeMismatch(format!(
                "dataset {}: {} input rows vs {} targets",
                b,
                x.nrows(),
                y.len()
            )));
        }
    }
    Ok(())
}

/// `0.5 · ln(2πe σ²)`: differential entropy of `N(·, σ²)`.
pub(crate) fn gaussian_entropy(variance: f64) -> Result<f64> {
    if !(variance > 0.0 && variance.is_finite()) {
        return Err(MechanismError::Numerical(format!(
            "noise variance must be finite and > 0, got {}",
            variance
        )));
    }
    Ok(0.5 * (2.0 * std::f64::consts::PI * std::f64::consts::E * variance).ln())
}

/// Owned mechanism of any variant.
#[derive(Debug)]
pub enum AnyMechanism {
    RootConjugate(ConjugateGaussianRoot),
    RootStatic(StaticGaussianRoot),
    GaussianProcess(GaussianProcessMechanism),
    GaussianProcessStatic(StaticGaussianProcess),
    DeterministicAdditive(AdditiveSigmoids),
}

impl AnyMechanism {
    pub fn from_snapshot(snapshot: MechanismSnapshot) -> Result<Self> {
        Ok(match snapshot {
            MechanismSnapshot::RootConjugate(s) => {
                AnyMechanism::RootConjugate(ConjugateGaussianRoot::from_snapshot(s)?)
            }
            MechanismSnapshot::RootStatic(s) => {
                AnyMechanism::RootStatic(StaticGaussianRoot::from_snapshot(s)?)
            }
            MechanismSnapshot::GaussianProcess(s) => {
                AnyMechanism::GaussianProcess(GaussianProcessMechanism::from_snapshot(s)?)
            }
            MechanismSnapshot::GaussianProcessStatic(s) => {
                AnyMechanism::GaussianProcessStatic(StaticGaussianProcess::from_snapshot(s)?)
            }
            MechanismSnapshot::DeterministicAdditive(s) => {
                AnyMechanism::DeterministicAdditive(AdditiveSigmoids::from_snapshot(s)?)
            }
        })
    }

    pub fn snapshot(&self) -> MechanismSnapshot {
        match self {
            AnyMechanism::RootConjugate(m) => MechanismSnapshot::RootConjugate(m.snapshot()),
            AnyMechanism::RootStatic(m) => MechanismSnapshot::RootStatic(m.snapshot()),
            AnyMechanism::GaussianProcess(m) => MechanismSnapshot::GaussianProcess(m.snapshot()),
            AnyMechanism::GaussianProcessStatic(m) => {
                MechanismSnapshot::GaussianProcessStatic(m.snapshot())
            }
            AnyMechanism::DeterministicAdditive(m) => {
                MechanismSnapshot::DeterministicAdditive(m.snapshot())
            }
        }
    }

    fn as_mechanism(&mut self) -> &mut dyn Mechanism {
        match self {
            AnyMechanism::RootConjugate(m) => m,
            AnyMechanism::RootStatic(m) => m,
            AnyMechanism::GaussianProcess(m) => m,
            AnyMechanism::GaussianProcessStatic(m) => m,
            AnyMechanism::DeterministicAdditive(m) => m,
        }
    }
}

impl Mechanism for AnyMechanism {
    fn in_size(&self) -> usize {
        match self {
            AnyMechanism::RootConjugate(m) => m.in_size(),
            AnyMechanism::RootStatic(m) => m.in_size(),
            AnyMechanism::GaussianProcess(m) => m.in_size(),
            AnyMechanism::GaussianProcessStatic(m) => m.in_size(),
            AnyMechanism::DeterministicAdditive(m) => m.in_size(),
        }
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        self.as_mechanism().forward(inputs, mode)
    }

    fn sample(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        self.as_mechanism().sample(inputs, mode)
    }

    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<Vec<f64>> {
        self.as_mechanism()
            .log_marginal_likelihood(inputs, targets, mode)
    }

    fn expected_noise_entropy(&mut self, mode: Mode) -> Result<f64> {
        self.as_mechanism().expected_noise_entropy(mode)
    }
}
