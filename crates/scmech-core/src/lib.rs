//! # scmech Core
//!
//! Mechanism layer for probabilistic structural causal models: the conditional
//! distribution of each node given its parents, with Bayesian scoring for causal
//! structure search.

pub mod engine;
pub mod gp;
pub mod mechanisms;
pub mod snapshot;

// Re-export commonly used types
pub use engine::config::{AdditiveSigmoidsConfig, GaussianProcessConfig, GaussianRootConfig};
pub use engine::edge_key::EdgeKey;
pub use engine::errors::MechanismError;
pub use gp::{Hyperparameters, KernelFamily};
pub use mechanisms::{
    AdditiveSigmoids, AnyMechanism, ConjugateGaussianRoot, GaussianProcessMechanism, Mechanism,
    Mode, SharedEdgeGaussianProcessRegistry, StaticGaussianProcess, StaticGaussianRoot,
};
pub use snapshot::MechanismSnapshot;
