//! Gaussian-process building blocks: kernels, hyperparameters and the exact solver.

pub mod exact;
pub mod kernel;

pub use exact::{ExactGpSolver, GpModel, MultivariateNormal, TrainingData};
pub use kernel::{
    GaussianLikelihood, HyperparameterPriors, Hyperparameters, Kernel, KernelFamily, MeanFunction,
};
