//! Additive sigmoid ground-truth generator.
//!
//! A frozen nonlinear mechanism of the causal-additive-model family:
//!
//! ```text
//! f(x) = Σ_i s_i · t_i / (1 + |t_i|),   t_i = ℓ_i · (x_i + o_i)
//! y    = f(x) + ε,                      ε ~ N(0, σ²)
//! ```
//!
//! Outscales `s` are Gamma draws whose signs are flipped together with probability ½.
//! Lengthscales `ℓ` and offsets `o` are uniform draws. Nothing is learned, so every
//! method ignores [`Mode`].

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::engine::config::{seeded_rng, AdditiveSigmoidsConfig};
use crate::engine::errors::{MechanismError, Result};
use crate::engine::priors::{floor_noise_variance, normal_log_density, GammaPrior, UniformPrior};
use crate::mechanisms::{check_inputs, check_targets, gaussian_entropy, Mechanism, Mode};
use crate::snapshot::AdditiveSigmoidsSnapshot;

#[derive(Debug, Clone)]
pub struct AdditiveSigmoids {
    cfg: AdditiveSigmoidsConfig,
    noise_variance: f64,
    outscales: DVector<f64>,
    lengthscales: DVector<f64>,
    offsets: DVector<f64>,
    rng: ChaCha8Rng,
}

impl AdditiveSigmoids {
    pub fn new(in_size: usize, cfg: AdditiveSigmoidsConfig) -> Result<Self> {
        let cfg = cfg.validate()?;
        let noise = GammaPrior::new(cfg.noise_var_concentration, cfg.noise_var_rate)?;
        let outscale = GammaPrior::new(cfg.outscale_concentration, cfg.outscale_rate)?;
        let lengthscale = UniformPrior::new(cfg.lscale_lower, cfg.lscale_upper)?;
        let offset = UniformPrior::new(cfg.offset_lower, cfg.offset_upper)?;

        let mut rng = seeded_rng(cfg.seed);
        let noise_variance = floor_noise_variance(noise.sample(&mut rng));
        let mut outscales = DVector::from_fn(in_size, |_, _| outscale.sample(&mut rng));
        if rng.random_bool(0.5) {
            outscales.neg_mut();
        }
        let lengthscales = DVector::from_fn(in_size, |_, _| lengthscale.sample(&mut rng));
        let offsets = DVector::from_fn(in_size, |_, _| offset.sample(&mut rng));

        Ok(Self {
            cfg,
            noise_variance,
            outscales,
            lengthscales,
            offsets,
            rng,
        })
    }

    pub fn from_snapshot(snapshot: AdditiveSigmoidsSnapshot) -> Result<Self> {
        let cfg = snapshot.config.validate()?;
        let n = snapshot.in_size;
        if snapshot.outscales.len() != n
            || snapshot.lengthscales.len() != n
            || snapshot.offsets.len() != n
        {
            return Err(MechanismError::InvalidSnapshot(format!(
                "additive sigmoid parameters must all have length {}",
                n
            )));
        }
        if !(snapshot.noise_variance > 0.0 && snapshot.noise_variance.is_finite()) {
            return Err(MechanismError::InvalidSnapshot(format!(
                "noise variance must be finite and > 0, got {}",
                snapshot.noise_variance
            )));
        }
        Ok(Self {
            cfg,
            noise_variance: snapshot.noise_variance,
            outscales: DVector::from_vec(snapshot.outscales),
            lengthscales: DVector::from_vec(snapshot.lengthscales),
            offsets: DVector::from_vec(snapshot.offsets),
            rng: seeded_rng(cfg.seed),
        })
    }

    pub fn snapshot(&self) -> AdditiveSigmoidsSnapshot {
        AdditiveSigmoidsSnapshot {
            in_size: self.outscales.len(),
            config: self.cfg,
            noise_variance: self.noise_variance,
            outscales: self.outscales.iter().copied().collect(),
            lengthscales: self.lengthscales.iter().copied().collect(),
            offsets: self.offsets.iter().copied().collect(),
        }
    }

    pub fn noise_variance(&self) -> f64 {
        self.noise_variance
    }

    pub fn outscales(&self) -> &DVector<f64> {
        &self.outscales
    }

    fn evaluate(&self, x: &DMatrix<f64>) -> DVector<f64> {
        DVector::from_fn(x.nrows(), |row, _| {
            (0..x.ncols())
                .map(|i| {
                    let t = self.lengthscales[i] * (x[(row, i)] + self.offsets[i]);
                    self.outscales[i] * t / (1.0 + t.abs())
                })
                .sum::<f64>()
        })
    }
}

impl Mechanism for AdditiveSigmoids {
    fn in_size(&self) -> usize {
        self.outscales.len()
    }

    fn forward(&mut self, inputs: &[DMatrix<f64>], _mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size(), inputs)?;
        Ok(inputs.iter().map(|x| self.evaluate(x)).collect())
    }

    fn sample(&mut self, inputs: &[DMatrix<f64>], _mode: Mode) -> Result<Vec<DVector<f64>>> {
        check_inputs(self.in_size(), inputs)?;
        let noise = Normal::new(0.0, self.noise_variance.sqrt())
            .map_err(|e| MechanismError::Numerical(format!("noise distribution: {}", e)))?;
        let mut out = Vec::with_capacity(inputs.len());
        for x in inputs {
            let mut y = self.evaluate(x);
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
        check_targets(self.in_size(), inputs, targets)?;
        Ok(inputs
            .iter()
            .zip(targets)
            .map(|(x, y)| {
                self.evaluate(x)
                    .iter()
                    .zip(y.iter())
                    .map(|(&f, &yi)| normal_log_density(yi, f, self.noise_variance))
                    .sum::<f64>()
            })
            .collect())
    }

    fn expected_noise_entropy(&mut self, _mode: Mode) -> Result<f64> {
        gaussian_entropy(self.noise_variance)
    }
}
