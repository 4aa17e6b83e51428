//! Many GP edges over one shared covariate table.
//!
//! During structure search a child node is scored against thousands of candidate
//! parent sets. Each candidate is an [`EdgeKey`] with its own kernel, likelihood and
//! (for the linear family) mean, restricted to the columns of its parents. Every edge
//! reads the same `N × in_size` covariate table through a fixed node→column map, so
//! adding or removing a candidate never touches the training data.
//!
//! Exactly one edge is *active* at a time. Its likelihood is the one the solver's
//! cached training factor was built for; switching the active edge drops that cache.
//! Edges are created lazily by [`SharedEdgeGaussianProcessRegistry::activate`].
//!
//! The registry is single-threaded state. Callers that share it across threads must
//! serialize each activate-then-evaluate sequence.

use nalgebra::{DMatrix, DVector};
use rand_chacha::ChaCha8Rng;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::engine::config::{seeded_rng, GaussianProcessConfig};
use crate::engine::edge_key::EdgeKey;
use crate::engine::errors::{MechanismError, Result};
use crate::gp::exact::{ExactGpSolver, GpModel, MultivariateNormal, TrainingData};
use crate::gp::kernel::{
    GaussianLikelihood, HyperparameterPriors, Hyperparameters, Kernel, KernelFamily, MeanFunction,
};
use crate::mechanisms::{check_inputs, check_targets, gaussian_entropy, Mechanism, Mode};
use crate::snapshot::RegistrySnapshot;

const ZERO_MEAN: MeanFunction = MeanFunction::Zero;

/// Kernel, likelihood and optional mean of one edge, plus the priors its
/// hyperparameters are drawn from.
#[derive(Debug, Clone)]
struct EdgeEntry {
    kernel: Kernel,
    likelihood: GaussianLikelihood,
    mean: Option<MeanFunction>,
    priors: HyperparameterPriors,
}

impl EdgeEntry {
    fn new(hp: Hyperparameters, active_dims: &[usize], priors: HyperparameterPriors) -> Self {
        let (kernel, mean, likelihood) = hp.components(Some(active_dims));
        Self {
            kernel,
            likelihood,
            mean: match mean {
                MeanFunction::Zero => None,
                constant => Some(constant),
            },
            priors,
        }
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::from_components(
            &self.kernel,
            self.mean.as_ref().unwrap_or(&ZERO_MEAN),
            &self.likelihood,
        )
    }

    fn load(&mut self, hp: Hyperparameters) {
        let (kernel, mean, likelihood) = hp.components(self.kernel.active_dims());
        self.kernel = kernel;
        self.likelihood = likelihood;
        if self.mean.is_some() {
            self.mean = Some(mean);
        }
    }

    fn model(&self) -> GpModel<'_> {
        GpModel {
            kernel: &self.kernel,
            mean: self.mean.as_ref().unwrap_or(&ZERO_MEAN),
            likelihood: &self.likelihood,
        }
    }
}

fn unknown_edge(key: &EdgeKey) -> MechanismError {
    MechanismError::UnknownEdgeKey(key.to_string())
}

/// Dictionary of per-edge GP components sharing one covariate table.
#[derive(Debug, Clone)]
pub struct SharedEdgeGaussianProcessRegistry {
    in_size: usize,
    family: KernelFamily,
    cfg: GaussianProcessConfig,
    node_to_dim: FxHashMap<String, usize>,
    edges: FxHashMap<EdgeKey, EdgeEntry>,
    active: Option<EdgeKey>,
    solver: ExactGpSolver,
    rng: ChaCha8Rng,
}

impl SharedEdgeGaussianProcessRegistry {
    /// `node_to_dim` maps every node that may appear as a parent to its column in the
    /// shared covariate table. Columns must be below `in_size`.
    pub fn new<I, S>(
        in_size: usize,
        node_to_dim: I,
        family: KernelFamily,
        cfg: GaussianProcessConfig,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (S, usize)>,
        S: Into<String>,
    {
        let cfg = cfg.validate()?;
        let node_to_dim: FxHashMap<String, usize> = node_to_dim
            .into_iter()
            .map(|(node, dim)| (node.into(), dim))
            .collect();
        if let Some((node, dim)) = node_to_dim.iter().find(|(_, dim)| **dim >= in_size) {
            return Err(MechanismError::InvalidConfig(format!(
                "node {:?} mapped to column {} of a {}-column table",
                node, dim, in_size
            )));
        }
        Ok(Self {
            in_size,
            family,
            cfg,
            node_to_dim,
            edges: FxHashMap::default(),
            active: None,
            solver: ExactGpSolver::new(),
            rng: seeded_rng(cfg.seed),
        })
    }

    /// Rebuilds every edge from its parameter vector. Training data is not part of the
    /// snapshot and must be re-supplied with [`Self::set_data`].
    pub fn from_snapshot(snapshot: RegistrySnapshot) -> Result<Self> {
        let mut registry = Self::new(
            snapshot.in_size,
            snapshot.node_to_dim,
            snapshot.family,
            snapshot.config,
        )
        .map_err(|e| MechanismError::InvalidSnapshot(e.to_string()))?;
        for (key, params) in snapshot.edges {
            let hp = Hyperparameters::from_vec(snapshot.family, &params)
                .map_err(|e| MechanismError::InvalidSnapshot(format!("edge {}: {}", key, e)))?;
            registry
                .init_kernel(&key)
                .map_err(|e| MechanismError::InvalidSnapshot(format!("edge {}: {}", key, e)))?;
            if let Some(entry) = registry.edges.get_mut(&key) {
                entry.load(hp);
            }
        }
        Ok(registry)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            in_size: self.in_size,
            family: self.family,
            config: self.cfg,
            node_to_dim: self
                .node_to_dim
                .iter()
                .map(|(node, &dim)| (node.clone(), dim))
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|(key, entry)| (key.clone(), entry.hyperparameters().to_vec()))
                .collect(),
        }
    }

    pub fn in_size(&self) -> usize {
        self.in_size
    }

    pub fn family(&self) -> KernelFamily {
        self.family
    }

    pub fn node_to_dim(&self) -> &FxHashMap<String, usize> {
        &self.node_to_dim
    }

    /// Replaces the shared covariate table and its targets.
    pub fn set_data(&mut self, inputs: &DMatrix<f64>, targets: &DVector<f64>) -> Result<()> {
        check_targets(
            self.in_size,
            std::slice::from_ref(inputs),
            std::slice::from_ref(targets),
        )?;
        self.solver.set_train_data(inputs.clone(), targets.clone())
    }

    pub fn training_data(&self) -> Option<&TrainingData> {
        self.solver.train_data()
    }

    fn active_dims(&self, key: &EdgeKey) -> Result<Vec<usize>> {
        key.parents()
            .iter()
            .map(|parent| {
                self.node_to_dim.get(parent).copied().ok_or_else(|| {
                    MechanismError::UnknownNode(format!("{} (parent in edge {})", parent, key))
                })
            })
            .collect()
    }

    /// Inserts a fresh kernel/likelihood/mean triple for `key`, restricted to its
    /// parents' columns and filled with prior means. Replaces any existing triple.
    pub fn init_kernel(&mut self, key: &EdgeKey) -> Result<()> {
        let dims = self.active_dims(key)?;
        let priors = HyperparameterPriors::from_config(&self.cfg, self.family, dims.len())?;
        self.edges
            .insert(key.clone(), EdgeEntry::new(priors.mean(), &dims, priors));
        if self.active.as_ref() == Some(key) {
            self.solver.clear_cache();
        }
        Ok(())
    }

    /// Draws `key`'s hyperparameters from its priors.
    pub fn init_hyperparams(&mut self, key: &EdgeKey) -> Result<()> {
        let entry = self.edges.get_mut(key).ok_or_else(|| unknown_edge(key))?;
        let hp = entry.priors.sample(&mut self.rng);
        entry.load(hp);
        if self.active.as_ref() == Some(key) {
            self.solver.clear_cache();
        }
        Ok(())
    }

    /// Makes `key` the active edge, creating and initialising it first if absent.
    pub fn activate(&mut self, key: &EdgeKey) -> Result<()> {
        if !self.edges.contains_key(key) {
            self.init_kernel(key)?;
            self.init_hyperparams(key)?;
            #[cfg(feature = "tracing")]
            tracing::debug!(edge = %key, edges = self.edges.len(), "materialised edge");
        }
        if self.active.as_ref() != Some(key) {
            self.active = Some(key.clone());
            self.solver.clear_cache();
            #[cfg(feature = "tracing")]
            tracing::trace!(edge = %key, "active edge switched, solver cache dropped");
        }
        Ok(())
    }

    /// Removes `key`'s triple. Returns whether it existed.
    pub fn delete_kernel(&mut self, key: &EdgeKey) -> bool {
        let removed = self.edges.remove(key).is_some();
        if removed && self.active.as_ref() == Some(key) {
            self.active = None;
            self.solver.clear_cache();
        }
        removed
    }

    /// Removes every listed triple in a single pass over the dictionary. Missing keys
    /// are ignored. Returns the number of edges removed.
    pub fn delete_kernels<'k, I>(&mut self, keys: I) -> usize
    where
        I: IntoIterator<Item = &'k EdgeKey>,
    {
        let doomed: FxHashSet<&EdgeKey> = keys.into_iter().collect();
        let before = self.edges.len();
        self.edges.retain(|key, _| !doomed.contains(key));
        if self.active.as_ref().is_some_and(|key| doomed.contains(key)) {
            self.active = None;
            self.solver.clear_cache();
        }
        let removed = before - self.edges.len();
        #[cfg(feature = "tracing")]
        tracing::debug!(removed, remaining = self.edges.len(), "deleted edges");
        removed
    }

    pub fn keys(&self) -> impl Iterator<Item = &EdgeKey> {
        self.edges.keys()
    }

    pub fn contains(&self, key: &EdgeKey) -> bool {
        self.edges.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn active_key(&self) -> Option<&EdgeKey> {
        self.active.as_ref()
    }

    pub fn hyperparameters(&self, key: &EdgeKey) -> Result<Hyperparameters> {
        self.edges
            .get(key)
            .map(EdgeEntry::hyperparameters)
            .ok_or_else(|| unknown_edge(key))
    }

    /// Overwrites `key`'s hyperparameters, e.g. after an optimiser step.
    pub fn set_hyperparameters(&mut self, key: &EdgeKey, hp: Hyperparameters) -> Result<()> {
        if hp.family() != self.family {
            return Err(MechanismError::InvalidConfig(format!(
                "{:?} hyperparameters for a {:?} registry",
                hp.family(),
                self.family
            )));
        }
        let hp = hp.validate()?;
        let entry = self.edges.get_mut(key).ok_or_else(|| unknown_edge(key))?;
        entry.load(hp);
        if self.active.as_ref() == Some(key) {
            self.solver.clear_cache();
        }
        Ok(())
    }

    pub fn hyperparam_log_prior(&self, key: &EdgeKey) -> Result<f64> {
        let entry = self.edges.get(key).ok_or_else(|| unknown_edge(key))?;
        entry.priors.log_prob(&entry.hyperparameters())
    }

    fn predictive(
        &mut self,
        key: &EdgeKey,
        x: &DMatrix<f64>,
        mode: Mode,
        observations: bool,
    ) -> Result<MultivariateNormal> {
        let entry = self.edges.get(key).ok_or_else(|| unknown_edge(key))?;
        let model = entry.model();
        if observations {
            self.solver.predict_observations(model, x, mode)
        } else {
            self.solver.predict(model, x, mode)
        }
    }

    pub fn forward(
        &mut self,
        key: &EdgeKey,
        inputs: &[DMatrix<f64>],
        mode: Mode,
    ) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size, inputs)?;
        self.activate(key)?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            out.push(self.predictive(key, x, mode, false)?.mean().clone());
        }
        Ok(out)
    }

    pub fn sample(
        &mut self,
        key: &EdgeKey,
        inputs: &[DMatrix<f64>],
        mode: Mode,
    ) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size, inputs)?;
        self.activate(key)?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            let y_dist = self.predictive(key, x, mode, true)?;
            out.push(y_dist.sample(&mut self.rng)?);
        }
        Ok(out)
    }

    pub fn log_marginal_likelihood(
        &mut self,
        key: &EdgeKey,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<Vec<f64>> {
        check_targets(self.in_size, inputs, targets)?;
        self.activate(key)?;
        inputs
            .iter()
            .zip(targets)
            .map(|(x, y)| self.predictive(key, x, mode, true)?.log_prob(y))
            .collect()
    }

    pub fn total_log_marginal_likelihood(
        &mut self,
        key: &EdgeKey,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<f64> {
        Ok(self
            .log_marginal_likelihood(key, inputs, targets, mode)?
            .into_iter()
            .sum())
    }

    /// Point-estimate entropy `½ ln(2πe σ²)` of `key`'s noise variance.
    pub fn expected_noise_entropy(&mut self, key: &EdgeKey) -> Result<f64> {
        self.activate(key)?;
        let entry = self.edges.get(key).ok_or_else(|| unknown_edge(key))?;
        gaussian_entropy(entry.likelihood.noise_variance)
    }

    /// Borrows the registry as a [`Mechanism`] bound to `key`.
    pub fn edge(&mut self, key: EdgeKey) -> SharedEdgeMechanism<'_> {
        SharedEdgeMechanism {
            registry: self,
            key,
        }
    }
}

/// One edge of a [`SharedEdgeGaussianProcessRegistry`] seen as a standalone mechanism.
#[derive(Debug)]
pub struct SharedEdgeMechanism<'a> {
    registry: &'a mut SharedEdgeGaussianProcessRegistry,
    key: EdgeKey,
}

impl SharedEdgeMechanism<'_> {
    pub fn key(&self) -> &EdgeKey {
        &self.key
    }
}

impl Mechanism for SharedEdgeMechanism<'_> {
    fn in_size(&self) -> usize {
        self.registry.in_size
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        self.registry.forward(&self.key, inputs, mode)
    }

    fn sample(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        self.registry.sample(&self.key, inputs, mode)
    }

    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<Vec<f64>> {
        self.registry
            .log_marginal_likelihood(&self.key, inputs, targets, mode)
    }

    /// The registry keeps no prior/posterior hyperparameter switch, so `mode` is unused.
    fn expected_noise_entropy(&mut self, _mode: Mode) -> Result<f64> {
        self.registry.expected_noise_entropy(&self.key)
    }
}
