//! Parentless ("root") nodes with a Normal-Inverse-Gamma model.
//!
//! The node's values are `x_i ~ N(μ, 1/λ)` with the conjugate prior
//! `λ ~ Gamma(α₀, β₀)`, `μ | λ ~ N(μ₀, 1/(κ₀ λ))`. After `n` observations with empirical
//! mean `x̄`:
//!
//! ```text
//! κ_n = κ₀ + n
//! μ_n = (κ₀ μ₀ + n x̄) / κ_n
//! α_n = α₀ + n/2
//! β_n = β₀ + ½ Σ (x_i − x̄)² + ½ κ₀ n (x̄ − μ₀)² / κ_n
//! ```
//!
//! The marginal likelihood of new targets is the ratio of NIG normalisers before and
//! after folding them in, so it is exact and additive over sequential updates.
//!
//! [`StaticGaussianRoot`] instead draws one `(μ, λ)` from the prior and keeps it frozen
//! as ground truth.

use std::f64::consts::{E, PI};

use nalgebra::{DMatrix, DVector};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma, Normal};
use statrs::function::gamma::{digamma, ln_gamma};

use crate::engine::config::{seeded_rng, GaussianRootConfig};
use crate::engine::errors::{MechanismError, Result};
use crate::engine::priors::normal_log_density;
use crate::mechanisms::{check_inputs, check_targets, gaussian_entropy, Mechanism, Mode};
use crate::snapshot::{RootSnapshot, StaticRootSnapshot};

/// Normal-Inverse-Gamma hyperparameters `(μ, κ, α, β)`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NigParams {
    pub mu: f64,
    pub kappa: f64,
    pub alpha: f64,
    pub beta: f64,
}

impl NigParams {
    fn from_config(cfg: &GaussianRootConfig) -> Self {
        Self {
            mu: cfg.mu_0,
            kappa: cfg.kappa_0,
            alpha: cfg.alpha_0,
            beta: cfg.beta_0,
        }
    }

    fn validate(self) -> Result<Self> {
        let ok = self.mu.is_finite()
            && [self.kappa, self.alpha, self.beta]
                .iter()
                .all(|v| *v > 0.0 && v.is_finite());
        if ok {
            Ok(self)
        } else {
            Err(MechanismError::InvalidSnapshot(format!(
                "NIG parameters outside their support: {:?}",
                self
            )))
        }
    }

    /// Conjugate update of `self` (as prior) with `values`.
    fn updated(&self, values: impl Iterator<Item = f64> + Clone) -> Self {
        let n = values.clone().count();
        if n == 0 {
            return *self;
        }
        let n_f = n as f64;
        let mean = values.clone().sum::<f64>() / n_f;
        let scatter: f64 = values.map(|x| (x - mean) * (x - mean)).sum();

        let kappa = self.kappa + n_f;
        let mu = (self.kappa * self.mu + n_f * mean) / kappa;
        let alpha = self.alpha + 0.5 * n_f;
        let beta = self.beta
            + 0.5 * scatter
            + 0.5 * self.kappa * n_f * (mean - self.mu) * (mean - self.mu) / kappa;
        Self {
            mu,
            kappa,
            alpha,
            beta,
        }
    }

    /// Log normaliser contribution `ln Γ(α) − α ln β − ½ ln κ`.
    fn log_normaliser(&self) -> f64 {
        ln_gamma(self.alpha) - self.alpha * self.beta.ln() - 0.5 * self.kappa.ln()
    }
}

fn gamma_precision(alpha: f64, beta: f64) -> Result<Gamma<f64>> {
    Gamma::new(alpha, 1.0 / beta)
        .map_err(|e| MechanismError::Numerical(format!("precision distribution: {}", e)))
}

fn normal(mean: f64, std_dev: f64) -> Result<Normal<f64>> {
    Normal::new(mean, std_dev)
        .map_err(|e| MechanismError::Numerical(format!("normal distribution: {}", e)))
}

fn require_finite_targets(targets: &DVector<f64>) -> Result<()> {
    match targets.iter().find(|v| !v.is_finite()) {
        Some(bad) => Err(MechanismError::Numerical(format!("non-finite target {}", bad))),
        None => Ok(()),
    }
}

/// Bayesian root node with a closed-form NIG posterior.
#[derive(Debug, Clone)]
pub struct ConjugateGaussianRoot {
    cfg: GaussianRootConfig,
    prior: NigParams,
    posterior: NigParams,
    train_targets: Option<DVector<f64>>,
    rng: ChaCha8Rng,
}

impl ConjugateGaussianRoot {
    /// Fresh mechanism whose posterior equals the prior.
    pub fn new(cfg: GaussianRootConfig) -> Result<Self> {
        let cfg = cfg.validate()?;
        let prior = NigParams::from_config(&cfg);
        Ok(Self {
            cfg,
            prior,
            posterior: prior,
            train_targets: None,
            rng: seeded_rng(cfg.seed),
        })
    }

    pub fn from_snapshot(snapshot: RootSnapshot) -> Result<Self> {
        let cfg = snapshot.config.validate()?;
        Ok(Self {
            cfg,
            prior: NigParams::from_config(&cfg),
            posterior: snapshot.posterior.validate()?,
            train_targets: snapshot.train_targets.map(DVector::from_vec),
            rng: seeded_rng(cfg.seed),
        })
    }

    pub fn snapshot(&self) -> RootSnapshot {
        RootSnapshot {
            config: self.cfg,
            posterior: self.posterior,
            train_targets: self.train_targets.as_ref().map(|t| t.iter().copied().collect()),
        }
    }

    pub fn prior(&self) -> NigParams {
        self.prior
    }

    pub fn posterior(&self) -> NigParams {
        self.posterior
    }

    pub fn train_targets(&self) -> Option<&DVector<f64>> {
        self.train_targets.as_ref()
    }

    fn params(&self, mode: Mode) -> NigParams {
        match mode {
            Mode::Prior => self.prior,
            Mode::Posterior => self.posterior,
        }
    }

    /// NIG update of the prior with each dataset in `targets`.
    ///
    /// In posterior mode the stored training targets are folded in as well, so the
    /// result is the posterior after training data plus `targets[b]`.
    pub fn compute_posterior_params(
        &self,
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Vec<NigParams> {
        let train: &[f64] = match (mode, &self.train_targets) {
            (Mode::Posterior, Some(train)) => train.as_slice(),
            _ => &[],
        };
        targets
            .iter()
            .map(|t| {
                self.prior
                    .updated(t.iter().copied().chain(train.iter().copied()))
            })
            .collect()
    }

    /// Fits the posterior to a single dataset, replacing any earlier fit.
    pub fn set_data(&mut self, targets: &[DVector<f64>]) -> Result<()> {
        let [dataset] = targets else {
            return Err(MechanismError::MultiplePosteriorSetsUnsupported);
        };
        require_finite_targets(dataset)?;
        self.posterior = self.prior.updated(dataset.iter().copied());
        self.train_targets = Some(dataset.clone());

        #[cfg(feature = "tracing")]
        tracing::debug!(
            n = dataset.len(),
            mu_n = self.posterior.mu,
            kappa_n = self.posterior.kappa,
            alpha_n = self.posterior.alpha,
            beta_n = self.posterior.beta,
            "root posterior updated"
        );
        Ok(())
    }
}

impl Mechanism for ConjugateGaussianRoot {
    fn in_size(&self) -> usize {
        0
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(0, inputs)?;
        let mu = self.params(mode).mu;
        Ok(inputs
            .iter()
            .map(|x| DVector::from_element(x.nrows(), mu))
            .collect())
    }

    /// Two-stage draw from the NIG predictive: `λ ~ Gamma(α, β)`,
    /// `μ ~ N(μ_n, 1/(κλ))`, then `y ~ N(μ, 1/λ)`. Each dataset gets its own `(μ, λ)`.
    fn sample(&mut self, inputs: &[DMatrix<f64>], mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(0, inputs)?;
        let p = self.params(mode);
        let precision = gamma_precision(p.alpha, p.beta)?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            let lambda = precision.sample(&mut self.rng);
            let mu = normal(p.mu, (p.kappa * lambda).powf(-0.5))?.sample(&mut self.rng);
            let noise = normal(mu, lambda.powf(-0.5))?;
            out.push(DVector::from_fn(x.nrows(), |_, _| noise.sample(&mut self.rng)));
        }
        Ok(out)
    }

    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        mode: Mode,
    ) -> Result<Vec<f64>> {
        check_targets(0, inputs, targets)?;
        for t in targets {
            require_finite_targets(t)?;
        }
        let before = self.params(mode);
        let lls = self
            .compute_posterior_params(targets, mode)
            .into_iter()
            .zip(targets)
            .map(|(after, t)| {
                after.log_normaliser() - before.log_normaliser()
                    - 0.5 * t.len() as f64 * (2.0 * PI).ln()
            })
            .collect::<Vec<_>>();
        debug_assert_eq!(lls.len(), targets.len());
        Ok(lls)
    }

    /// Exact `E[H]` of the noise under the Gamma-distributed precision:
    /// `½ (ln(2πe) − ψ(α) + ln β)`.
    fn expected_noise_entropy(&mut self, mode: Mode) -> Result<f64> {
        let p = self.params(mode);
        Ok(0.5 * ((2.0 * PI * E).ln() - digamma(p.alpha) + p.beta.ln()))
    }
}

/// Frozen ground-truth `(μ*, λ*)` of a static root node.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GroundTruth {
    pub mu: f64,
    pub lambda: f64,
}

/// Root node that draws `(μ*, λ*)` once from its NIG prior and never updates.
#[derive(Debug, Clone)]
pub struct StaticGaussianRoot {
    cfg: GaussianRootConfig,
    ground_truth: GroundTruth,
    rng: ChaCha8Rng,
}

impl StaticGaussianRoot {
    pub fn new(cfg: GaussianRootConfig) -> Result<Self> {
        let cfg = cfg.validate()?;
        let mut rng = seeded_rng(cfg.seed);
        let lambda = gamma_precision(cfg.alpha_0, cfg.beta_0)?.sample(&mut rng);
        let mu = normal(cfg.mu_0, (cfg.kappa_0 * lambda).powf(-0.5))?.sample(&mut rng);
        Ok(Self {
            cfg,
            ground_truth: GroundTruth { mu, lambda },
            rng,
        })
    }

    pub fn from_snapshot(snapshot: StaticRootSnapshot) -> Result<Self> {
        let cfg = snapshot.config.validate()?;
        let GroundTruth { mu, lambda } = snapshot.ground_truth;
        if !mu.is_finite() || !(lambda > 0.0 && lambda.is_finite()) {
            return Err(MechanismError::InvalidSnapshot(format!(
                "invalid ground truth {:?}",
                snapshot.ground_truth
            )));
        }
        Ok(Self {
            cfg,
            ground_truth: snapshot.ground_truth,
            rng: seeded_rng(cfg.seed),
        })
    }

    pub fn snapshot(&self) -> StaticRootSnapshot {
        StaticRootSnapshot {
            config: self.cfg,
            ground_truth: self.ground_truth,
        }
    }

    pub fn ground_truth(&self) -> GroundTruth {
        self.ground_truth
    }

    fn variance(&self) -> f64 {
        1.0 / self.ground_truth.lambda
    }
}

impl Mechanism for StaticGaussianRoot {
    fn in_size(&self) -> usize {
        0
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], _mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(0, inputs)?;
        Ok(inputs
            .iter()
            .map(|x| DVector::from_element(x.nrows(), self.ground_truth.mu))
            .collect())
    }

    fn sample(&mut self, inputs: &[DMatrix<f64>], _mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(0, inputs)?;
        let dist = normal(self.ground_truth.mu, self.ground_truth.lambda.powf(-0.5))?;
        Ok(inputs
            .iter()
            .map(|x| DVector::from_fn(x.nrows(), |_, _| dist.sample(&mut self.rng)))
            .collect())
    }

    fn log_marginal_likelihood(
        &mut self,
        inputs: &[DMatrix<f64>],
        targets: &[DVector<f64>],
        _mode: Mode,
    ) -> Result<Vec<f64>> {
        check_targets(0, inputs, targets)?;
        let variance = self.variance();
        Ok(targets
            .iter()
            .map(|t| {
                t.iter()
                    .map(|&y| normal_log_density(y, self.ground_truth.mu, variance))
                    .sum::<f64>()
            })
            .collect())
    }

    fn expected_noise_entropy(&mut self, _mode: Mode) -> Result<f64> {
        gaussian_entropy(self.variance())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_prior() -> GaussianRootConfig {
        GaussianRootConfig {
            mu_0: 0.0,
            kappa_0: 1.0,
            alpha_0: 1.0,
            beta_0: 1.0,
            seed: Some(5),
        }
    }

    fn empty_inputs(rows: &[usize]) -> Vec<DMatrix<f64>> {
        rows.iter().map(|&n| DMatrix::zeros(n, 0)).collect()
    }

    #[test]
    fn set_data_matches_closed_form() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        root.set_data(&[DVector::from_vec(vec![1.0, 2.0, 3.0])])
            .unwrap();
        let post = root.posterior();
        assert_eq!(post.kappa, 4.0);
        assert_eq!(post.mu, 1.5);
        assert_eq!(post.alpha, 2.5);
        assert!((post.beta - 3.5).abs() < 1e-12);
        assert_eq!(root.prior(), NigParams::from_config(&unit_prior()));
    }

    #[test]
    fn set_data_rejects_batches() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let err = root
            .set_data(&[DVector::zeros(2), DVector::zeros(2)])
            .unwrap_err();
        assert_eq!(err, MechanismError::MultiplePosteriorSetsUnsupported);
        assert!(root.set_data(&[]).is_err());
        assert!(root.train_targets().is_none());
    }

    #[test]
    fn forward_broadcasts_mean_to_batch() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        root.set_data(&[DVector::from_vec(vec![1.0, 2.0, 3.0])])
            .unwrap();
        let out = root.forward(&empty_inputs(&[2, 4]), Mode::Posterior).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].len(), 4);
        assert!(out.iter().flat_map(|v| v.iter()).all(|&v| v == 1.5));

        let prior = root.forward(&empty_inputs(&[1]), Mode::Prior).unwrap();
        assert_eq!(prior[0][0], 0.0);
    }

    #[test]
    fn inputs_with_columns_are_rejected() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let err = root
            .forward(&[DMatrix::zeros(2, 1)], Mode::Posterior)
            .unwrap_err();
        assert!(matches!(err, MechanismError::ShapeMismatch(_)));
    }

    #[test]
    fn mll_of_single_point_under_unit_prior() {
        // One observation x under NIG(0,1,1,1): after = (κ=2, α=1.5, β=1+x²/4)
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let x = 0.8_f64;
        let ll = root
            .log_marginal_likelihood(&empty_inputs(&[1]), &[DVector::from_vec(vec![x])], Mode::Prior)
            .unwrap();
        let beta_after = 1.0 + x * x / 4.0;
        let expected = ln_gamma(1.5) - ln_gamma(1.0) + 0.0 - 1.5 * beta_after.ln()
            + 0.5 * (1.0_f64.ln() - 2.0_f64.ln())
            - 0.5 * (2.0 * PI).ln();
        assert!((ll[0] - expected).abs() < 1e-12, "{} vs {}", ll[0], expected);
    }

    #[test]
    fn mll_is_additive_over_sequential_updates() {
        let x1 = DVector::from_vec(vec![0.3, -1.2, 2.1]);
        let x2 = DVector::from_vec(vec![0.9, 1.4]);
        let joint = DVector::from_iterator(5, x1.iter().chain(x2.iter()).copied());

        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let all = root
            .total_log_marginal_likelihood(&empty_inputs(&[5]), &[joint], Mode::Prior)
            .unwrap();
        let first = root
            .total_log_marginal_likelihood(&empty_inputs(&[3]), &[x1.clone()], Mode::Prior)
            .unwrap();
        root.set_data(&[x1]).unwrap();
        let second = root
            .total_log_marginal_likelihood(&empty_inputs(&[2]), &[x2], Mode::Posterior)
            .unwrap();
        assert!((all - (first + second)).abs() < 1e-10);
    }

    #[test]
    fn non_finite_targets_are_rejected_when_scoring() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let err = root
            .log_marginal_likelihood(
                &empty_inputs(&[2]),
                &[DVector::from_vec(vec![0.5, f64::NAN])],
                Mode::Prior,
            )
            .unwrap_err();
        assert!(matches!(err, MechanismError::Numerical(_)));
        assert!(root
            .set_data(&[DVector::from_vec(vec![f64::INFINITY])])
            .is_err());
    }

    #[test]
    fn per_dataset_mll_has_batch_length() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let targets = vec![DVector::from_vec(vec![0.1, 0.2]), DVector::from_vec(vec![3.0, 2.0])];
        let lls = root
            .log_marginal_likelihood(&empty_inputs(&[2, 2]), &targets, Mode::Prior)
            .unwrap();
        assert_eq!(lls.len(), 2);
        assert!(lls[0] > lls[1], "values near the prior mean score higher");
        assert!(root
            .log_marginal_likelihood(&empty_inputs(&[2]), &targets, Mode::Prior)
            .is_err());
    }

    #[test]
    fn expected_entropy_uses_digamma() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let h = root.expected_noise_entropy(Mode::Prior).unwrap();
        // ψ(1) = −γ
        let expected = 0.5 * ((2.0 * PI * E).ln() + 0.577_215_664_901_532_9);
        assert!((h - expected).abs() < 1e-10);
    }

    #[test]
    fn samples_have_batch_shape() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        let out = root.sample(&empty_inputs(&[3, 0, 5]), Mode::Prior).unwrap();
        assert_eq!(out.iter().map(|v| v.len()).collect::<Vec<_>>(), vec![3, 0, 5]);
        assert!(out.iter().flat_map(|v| v.iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn snapshot_restores_posterior_and_training_targets() {
        let mut root = ConjugateGaussianRoot::new(unit_prior()).unwrap();
        root.set_data(&[DVector::from_vec(vec![1.0, 2.0, 3.0])])
            .unwrap();
        let mut restored = ConjugateGaussianRoot::from_snapshot(root.snapshot()).unwrap();
        assert_eq!(restored.posterior(), root.posterior());

        let inputs = empty_inputs(&[2]);
        let targets = [DVector::from_vec(vec![1.7, 2.2])];
        let a = root
            .total_log_marginal_likelihood(&inputs, &targets, Mode::Posterior)
            .unwrap();
        let b = restored
            .total_log_marginal_likelihood(&inputs, &targets, Mode::Posterior)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn static_root_is_frozen() {
        let mut root = StaticGaussianRoot::new(unit_prior()).unwrap();
        let truth = root.ground_truth();
        assert!(truth.lambda > 0.0);

        let prior = root.forward(&empty_inputs(&[2]), Mode::Prior).unwrap();
        let post = root.forward(&empty_inputs(&[2]), Mode::Posterior).unwrap();
        assert_eq!(prior, post);
        assert_eq!(prior[0][0], truth.mu);

        let ll = root
            .log_marginal_likelihood(
                &empty_inputs(&[1]),
                &[DVector::from_vec(vec![truth.mu])],
                Mode::Posterior,
            )
            .unwrap();
        let expected = -0.5 * (2.0 * PI / truth.lambda).ln();
        assert!((ll[0] - expected).abs() < 1e-12);

        let h = root.expected_noise_entropy(Mode::Prior).unwrap();
        assert!((h - 0.5 * (2.0 * PI * E / truth.lambda).ln()).abs() < 1e-12);
        assert_eq!(root.ground_truth(), truth);
    }

    #[test]
    fn static_root_snapshot_round_trip() {
        let root = StaticGaussianRoot::new(unit_prior()).unwrap();
        let restored = StaticGaussianRoot::from_snapshot(root.snapshot()).unwrap();
        assert_eq!(restored.ground_truth(), root.ground_truth());
    }
}
