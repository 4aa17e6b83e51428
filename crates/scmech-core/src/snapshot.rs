//! Parameter snapshots.
//!
//! A snapshot is the key-value state needed to rebuild a mechanism exactly: its
//! configuration, prior/posterior hyperparameters and, for static variants, the frozen
//! ground truth. Mechanism-owned RNG state is not captured; a restored mechanism
//! reseeds from its configuration.
//!
//! The shared-edge registry snapshot deliberately omits the covariate table and targets.
//! Callers re-supply them with `set_data` after restoring.
//!
//! With the `serde` feature every snapshot serializes. Maps are `BTreeMap` so output
//! is deterministic.

use std::collections::BTreeMap;

use crate::engine::config::{AdditiveSigmoidsConfig, GaussianProcessConfig, GaussianRootConfig};
use crate::engine::edge_key::EdgeKey;
use crate::gp::kernel::{Hyperparameters, KernelFamily};
use crate::mechanisms::root::{GroundTruth, NigParams};

/// Bayesian root node: prior (via config), posterior and the targets it was fit to.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RootSnapshot {
    pub config: GaussianRootConfig,
    pub posterior: NigParams,
    pub train_targets: Option<Vec<f64>>,
}

/// Static root node: prior (via config) and the frozen `(mu, lambda)` draw.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticRootSnapshot {
    pub config: GaussianRootConfig,
    pub ground_truth: GroundTruth,
}

/// Single-node GP: the stored posterior hyperparameter set.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GaussianProcessSnapshot {
    pub in_size: usize,
    pub family: KernelFamily,
    pub config: GaussianProcessConfig,
    pub posterior: Hyperparameters,
}

/// Static GP: hyperparameters plus the frozen synthetic training set (row-major).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticGaussianProcessSnapshot {
    pub in_size: usize,
    pub family: KernelFamily,
    pub config: GaussianProcessConfig,
    pub hyperparameters: Hyperparameters,
    pub train_inputs: Vec<Vec<f64>>,
    pub train_targets: Vec<f64>,
}

/// Shared-edge registry: node→dimension map and one flat parameter vector per edge.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegistrySnapshot {
    pub in_size: usize,
    pub family: KernelFamily,
    pub config: GaussianProcessConfig,
    pub node_to_dim: BTreeMap<String, usize>,
    pub edges: BTreeMap<EdgeKey, Vec<f64>>,
}

/// Additive-sigmoid generator parameters.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdditiveSigmoidsSnapshot {
    pub in_size: usize,
    pub config: AdditiveSigmoidsConfig,
    pub noise_variance: f64,
    pub outscales: Vec<f64>,
    pub lengthscales: Vec<f64>,
    pub offsets: Vec<f64>,
}

/// Snapshot of any owned mechanism variant.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "kind", rename_all = "snake_case"))]
pub enum MechanismSnapshot {
    RootConjugate(RootSnapshot),
    RootStatic(StaticRootSnapshot),
    GaussianProcess(GaussianProcessSnapshot),
    GaussianProcessStatic(StaticGaussianProcessSnapshot),
    DeterministicAdditive(AdditiveSigmoidsSnapshot),
}

impl MechanismSnapshot {
    pub fn in_size(&self) -> usize {
        match self {
            MechanismSnapshot::RootConjugate(_) | MechanismSnapshot::RootStatic(_) => 0,
            MechanismSnapshot::GaussianProcess(s) => s.in_size,
            MechanismSnapshot::GaussianProcessStatic(s) => s.in_size,
            MechanismSnapshot::DeterministicAdditive(s) => s.in_size,
        }
    }
}
