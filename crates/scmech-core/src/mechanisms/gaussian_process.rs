//! Gaussian-process mechanisms for nodes with parents.
//!
//! [`GaussianProcessMechanism`] owns one GP regression model and two hyperparameter
//! sets: the one currently loaded into the solver and a stored posterior snapshot.
//! [`HyperparameterSwitch`] is the two-state machine between them:
//!
//! ```text
//!            select(PriorDraw): save current → posterior, load fresh prior draw
//! Posterior ───────────────────────────────────────────────────────────▶ PriorDraw
//!           ◀───────────────────────────────────────────────────────────
//!            select(Posterior): load stored posterior
//! ```
//!
//! Selecting the state that is already active does nothing, so a posterior → prior →
//! posterior round trip restores the original posterior values exactly.
//!
//! [`StaticGaussianProcess`] is a frozen ground-truth function: a GP prior draw on a
//! synthetic training set, evaluated through its point (mean) prediction only.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::engine::config::{seeded_rng, GaussianProcessConfig};
use crate::engine::errors::{MechanismError, Result};
use crate::engine::priors::{normal_log_density, UniformPrior};
use crate::gp::exact::{ExactGpSolver, GpModel};
use crate::gp::kernel::{HyperparameterPriors, Hyperparameters, KernelFamily};
use crate::mechanisms::{check_inputs, check_targets, gaussian_entropy, Mechanism, Mode};
use crate::snapshot::{GaussianProcessSnapshot, StaticGaussianProcessSnapshot};

/// Which hyperparameter set is loaded into the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HyperparameterSelection {
    /// The stored posterior set.
    Posterior,
    /// A fresh independent draw from the hyperparameter priors.
    PriorDraw,
}

/// Active/stored hyperparameter sets with save-on-exit semantics.
#[derive(Debug, Clone, PartialEq)]
pub struct HyperparameterSwitch {
    selection: HyperparameterSelection,
    current: Hyperparameters,
    posterior: Hyperparameters,
}

impl HyperparameterSwitch {
    /// Starts in the posterior state with `initial` as both current and posterior set.
    pub fn new(initial: Hyperparameters) -> Self {
        Self {
            selection: HyperparameterSelection::Posterior,
            current: initial,
            posterior: initial,
        }
    }

    pub fn selection(&self) -> HyperparameterSelection {
        self.selection
    }

    /// The set currently loaded into the solver.
    pub fn current(&self) -> &Hyperparameters {
        &self.current
    }

    /// The latest posterior values: the live set while in the posterior state, the
    /// stored snapshot otherwise.
    pub fn posterior(&self) -> &Hyperparameters {
        match self.selection {
            HyperparameterSelection::Posterior => &self.current,
            HyperparameterSelection::PriorDraw => &self.posterior,
        }
    }

    /// Overwrites the loaded set, as a hyperparameter optimiser step would.
    pub fn set_current(&mut self, hp: Hyperparameters) {
        self.current = hp;
    }

    /// Moves to `target`. Returns whether the loaded set changed.
    pub fn select<R: Rng + ?Sized>(
        &mut self,
        target: HyperparameterSelection,
        priors: &HyperparameterPriors,
        rng: &mut R,
    ) -> bool {
        if target == self.selection {
            return false;
        }
        match target {
            HyperparameterSelection::Posterior => {
                self.current = self.posterior;
            }
            HyperparameterSelection::PriorDraw => {
                self.posterior = self.current;
                self.current = priors.sample(rng);
            }
        }
        self.selection = target;
        true
    }
}

fn require_inputs(in_size: usize) -> Result<()> {
    if in_size == 0 {
        return Err(MechanismError::InvalidConfig(
            "Gaussian-process mechanisms need at least one input; use a root mechanism".into(),
        ));
    }
    Ok(())
}

/// Bayesian GP mechanism with switchable prior/posterior hyperparameters.
#[derive(Debug, Clone)]
pub struct GaussianProcessMechanism {
    in_size: usize,
    family: KernelFamily,
    cfg: GaussianProcessConfig,
    priors: HyperparameterPriors,
    switch: HyperparameterSwitch,
    solver: ExactGpSolver,
    rng: ChaCha8Rng,
}

impl GaussianProcessMechanism {
    /// Draws the initial hyperparameters from their priors.
    pub fn new(in_size: usize, family: KernelFamily, cfg: GaussianProcessConfig) -> Result<Self> {
        require_inputs(in_size)?;
        let cfg = cfg.validate()?;
        let priors = HyperparameterPriors::from_config(&cfg, family, in_size)?;
        let mut rng = seeded_rng(cfg.seed);
        let initial = priors.sample(&mut rng);
        Ok(Self {
            in_size,
            family,
            cfg,
            priors,
            switch: HyperparameterSwitch::new(initial),
            solver: ExactGpSolver::new(),
            rng,
        })
    }

    /// Restores the stored posterior set. Training data must be re-supplied.
    pub fn from_snapshot(snapshot: GaussianProcessSnapshot) -> Result<Self> {
        require_inputs(snapshot.in_size)?;
        let cfg = snapshot.config.validate()?;
        if snapshot.posterior.family() != snapshot.family {
            return Err(MechanismError::InvalidSnapshot(format!(
                "{:?} hyperparameters in a {:?} mechanism",
                snapshot.posterior.family(),
                snapshot.family
            )));
        }
        let posterior = snapshot
            .posterior
            .validate()
            .map_err(|e| MechanismError::InvalidSnapshot(e.to_string()))?;
        Ok(Self {
            in_size: snapshot.in_size,
            family: snapshot.family,
            cfg,
            priors: HyperparameterPriors::from_config(&cfg, snapshot.family, snapshot.in_size)?,
            switch: HyperparameterSwitch::new(posterior),
            solver: ExactGpSolver::new(),
            rng: seeded_rng(cfg.seed),
        })
    }

    pub fn snapshot(&self) -> GaussianProcessSnapshot {
        GaussianProcessSnapshot {
            in_size: self.in_size,
            family: self.family,
            config: self.cfg,
            posterior: *self.switch.posterior(),
        }
    }

    pub fn family(&self) -> KernelFamily {
        self.family
    }

    pub fn set_data(&mut self, inputs: &DMatrix<f64>, targets: &DVector<f64>) -> Result<()> {
        check_targets(
            self.in_size,
            std::slice::from_ref(inputs),
            std::slice::from_ref(targets),
        )?;
        self.solver.set_train_data(inputs.clone(), targets.clone())
    }

    pub fn selection(&self) -> HyperparameterSelection {
        self.switch.selection()
    }

    /// Switches between the stored posterior set and a fresh prior draw.
    pub fn select_hyperparameters(&mut self, use_posterior: bool) {
        let target = if use_posterior {
            HyperparameterSelection::Posterior
        } else {
            HyperparameterSelection::PriorDraw
        };
        if self.switch.select(target, &self.priors, &mut self.rng) {
            self.solver.clear_cache();
            #[cfg(feature = "tracing")]
            tracing::trace!(?target, "gp hyperparameter set switched");
        }
    }

    /// The set currently loaded into the solver.
    pub fn hyperparameters(&self) -> Hyperparameters {
        *self.switch.current()
    }

    pub fn posterior_hyperparameters(&self) -> Hyperparameters {
        *self.switch.posterior()
    }

    /// Replaces the loaded set, e.g. after an optimiser step.
    pub fn set_hyperparameters(&mut self, hp: Hyperparameters) -> Result<()> {
        if hp.family() != self.family {
            return Err(MechanismError::InvalidConfig(format!(
                "{:?} hyperparameters for a {:?} mechanism",
                hp.family(),
                self.family
            )));
        }
        self.switch.set_current(hp.validate()?);
        self.solver.clear_cache();
        Ok(())
    }

    /// Sum of prior log-densities at the loaded hyperparameters.
    pub fn hyperparam_log_prior(&self) -> Result<f64> {
        self.priors.log_prob(self.switch.current())
    }

    fn predict(
        &mut self,
        x: &DMatrix<f64>,
        mode: Mode,
        observations: bool,
    ) -> Result<crate::gp::MultivariateNormal> {
        let (kernel, mean, likelihood) = self.switch.current().components(None);
        let model = GpModel {
            kernel: &kernel,
            mean: &mean,
            likelihood: &likelihood,
        };
        if observations {
            self.solver.predict_observations(model, x, mode)
        } else {
            self.solver.predict(model, x, mode)
        }
    }
}

impl Mechanism for GaussianProcessMechanism {
    fn in_size(&self) -> usize {
        self.in_size
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size, inputs)?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            out.push(self.predict(x, mode, false)?.mean().clone());
        }
        Ok(out)
    }

    fn sample(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size, inputs)?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            let y_dist = self.predict(x, mode, true)?;
            out.push(y_dist.sample(&mut self.rng)?);
        }
        Ok(out)
    }

    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<Vec<f64>> {
        check_targets(self.in_size, inputs, targets)?;
        inputs
            .iter()
            .zip(targets)
            .map(|(x, y)| self.predict(x, mode, true)?.log_prob(y))
            .collect()
    }

    /// Point-estimate entropy `½ ln(2πe σ²)` of the noise variance loaded for `mode`.
    ///
    /// The previously active hyperparameter set is restored before returning, whether
    /// or not the entropy could be computed.
    fn expected_noise_entropy(&mut self, mode: Mode) -> Result<f64> {
        let previous = self.switch.selection();
        self.select_hyperparameters(mode == Mode::Posterior);
        let entropy = gaussian_entropy(self.switch.current().noise_variance());
        self.select_hyperparameters(previous == HyperparameterSelection::Posterior);
        entropy
    }
}

/// Ground-truth GP: hyperparameters and a synthetic training set drawn once from the
/// prior, then frozen. Ignores `Mode`.
#[derive(Debug, Clone)]
pub struct StaticGaussianProcess {
    in_size: usize,
    family: KernelFamily,
    cfg: GaussianProcessConfig,
    hyperparameters: Hyperparameters,
    solver: ExactGpSolver,
    rng: ChaCha8Rng,
}

impl StaticGaussianProcess {
    /// Draws hyperparameters, `num_support_points · in_size` covariates uniformly on the
    /// support box, and targets from the GP prior predictive.
    pub fn new(in_size: usize, family: KernelFamily, cfg: GaussianProcessConfig) -> Result<Self> {
        require_inputs(in_size)?;
        let cfg = cfg.validate()?;
        let priors = HyperparameterPriors::from_config(&cfg, family, in_size)?;
        let mut rng = seeded_rng(cfg.seed);
        let hyperparameters = priors.sample(&mut rng);

        let support = UniformPrior::new(cfg.support_min, cfg.support_max)?;
        let num_train = cfg.num_support_points * in_size;
        let train_x = DMatrix::from_fn(num_train, in_size, |_, _| support.sample(&mut rng));

        let mut solver = ExactGpSolver::new();
        let (kernel, mean, likelihood) = hyperparameters.components(None);
        let model = GpModel {
            kernel: &kernel,
            mean: &mean,
            likelihood: &likelihood,
        };
        let train_y = solver
            .predict_observations(model, &train_x, Mode::Prior)?
            .sample(&mut rng)?;
        solver.set_train_data(train_x, train_y)?;

        Ok(Self {
            in_size,
            family,
            cfg,
            hyperparameters,
            solver,
            rng,
        })
    }

    pub fn from_snapshot(snapshot: StaticGaussianProcessSnapshot) -> Result<Self> {
        require_inputs(snapshot.in_size)?;
        let cfg = snapshot.config.validate()?;
        if snapshot.hyperparameters.family() != snapshot.family {
            return Err(MechanismError::InvalidSnapshot(format!(
                "{:?} hyperparameters in a {:?} mechanism",
                snapshot.hyperparameters.family(),
                snapshot.family
            )));
        }
        let hyperparameters = snapshot
            .hyperparameters
            .validate()
            .map_err(|e| MechanismError::InvalidSnapshot(e.to_string()))?;
        let rows = snapshot.train_inputs.len();
        if snapshot.train_inputs.iter().any(|r| r.len() != snapshot.in_size) {
            return Err(MechanismError::InvalidSnapshot(format!(
                "training rows must have {} columns",
                snapshot.in_size
            )));
        }
        let train_x = DMatrix::from_row_iterator(
            rows,
            snapshot.in_size,
            snapshot.train_inputs.iter().flatten().copied(),
        );
        let mut solver = ExactGpSolver::new();
        solver
            .set_train_data(train_x, DVector::from_vec(snapshot.train_targets))
            .map_err(|e| MechanismError::InvalidSnapshot(e.to_string()))?;
        Ok(Self {
            in_size: snapshot.in_size,
            family: snapshot.family,
            cfg,
            hyperparameters,
            solver,
            rng: seeded_rng(cfg.seed),
        })
    }

    pub fn snapshot(&self) -> StaticGaussianProcessSnapshot {
        let (train_inputs, train_targets) = match self.solver.train_data() {
            Some(train) => (
                train
                    .inputs
                    .row_iter()
                    .map(|r| r.iter().copied().collect())
                    .collect(),
                train.targets.iter().copied().collect(),
            ),
            None => (Vec::new(), Vec::new()),
        };
        StaticGaussianProcessSnapshot {
            in_size: self.in_size,
            family: self.family,
            config: self.cfg,
            hyperparameters: self.hyperparameters,
            train_inputs,
            train_targets,
        }
    }

    pub fn hyperparameters(&self) -> Hyperparameters {
        self.hyperparameters
    }

    pub fn training_data(&self) -> Option<&crate::gp::TrainingData> {
        self.solver.train_data()
    }

    fn point_prediction(&mut self, x: &DMatrix<f64>) -> Result<DVector<f64>> {
        let (kernel, mean, likelihood) = self.hyperparameters.components(None);
        let model = GpModel {
            kernel: &kernel,
            mean: &mean,
            likelihood: &likelihood,
        };
        Ok(self.solver.predict(model, x, Mode::Posterior)?.mean().clone())
    }
}

impl Mechanism for StaticGaussianProcess {
    fn in_size(&self) -> usize {
        self.in_size
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], _mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size, inputs)?;
        inputs.iter().map(|x| self.point_prediction(x)).collect()
    }

    fn sample(&mut self, inputs: &[DMatrix<f64>], _mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size, inputs)?;
        let noise = Normal::new(0.0, self.hyperparameters.noise_variance().sqrt())
            .map_err(|e| MechanismError::Numerical(format!("noise distribution: {}", e)))?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            let mut y = self.point_prediction(x)?;
            for v in y.iter_mut() {
                *v += noise.sample(&mut self.rng);
            }
            out.push(y);
        }
        Ok(out)
    }

    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        _mode: Mode,
    ) -> Result<Vec<f64>> {
        check_targets(self.in_size, inputs, targets)?;
        let variance = self.hyperparameters.noise_variance();
        let mut lls = Vec::with_capacity(inputs.len());
        for (x, y) in inputs.iter().zip(targets) {
            let f = self.point_prediction(x)?;
            lls.push(
                y.iter()
                    .zip(f.iter())
                    .map(|(&yi, &fi)| normal_log_density(yi, fi, variance))
                    .sum::<f64>(),
            );
        }
        Ok(lls)
    }

    fn expected_noise_entropy(&mut self, _mode: Mode) -> Result<f64> {
        gaussian_entropy(self.hyperparameters.noise_variance())
    }
}
