//! Gaussian-process mechanism: hyperparameter switching, noise floor, and scoring.

use nalgebra::{DMatrix, DVector};
use scmech_core::mechanisms::{HyperparameterSelection, StaticGaussianProcess};
use scmech_core::{
    GaussianProcessConfig, GaussianProcessMechanism, Hyperparameters, KernelFamily, Mechanism,
    Mode,
};

fn assert_close(actual: f64, expected: f64, tol: f64, label: &str) {
    assert!(
        (actual - expected).abs() <= tol,
        "{} mismatch: expected {:.15}, got {:.15}, diff={:.3e}",
        label,
        expected,
        actual,
        (actual - expected).abs()
    );
}

fn cfg(seed: u64) -> GaussianProcessConfig {
    GaussianProcessConfig {
        seed: Some(seed),
        num_support_points: 6,
        ..Default::default()
    }
}

fn sine_data(n: usize) -> (DMatrix<f64>, DVector<f64>) {
    let x = DMatrix::from_fn(n, 1, |i, _| -3.0 + 6.0 * i as f64 / (n - 1) as f64);
    let y = DVector::from_fn(n, |i, _| x[(i, 0)].sin());
    (x, y)
}

#[test]
fn posterior_prior_posterior_restores_original_bits() {
    for family in [KernelFamily::Linear, KernelFamily::RationalQuadratic] {
        let mut gp = GaussianProcessMechanism::new(2, family, cfg(5)).unwrap();
        let original = gp.hyperparameters();

        gp.select_hyperparameters(true);
        gp.select_hyperparameters(false);
        assert_eq!(gp.selection(), HyperparameterSelection::PriorDraw);
        assert_ne!(gp.hyperparameters(), original);
        assert_eq!(gp.posterior_hyperparameters(), original);

        gp.select_hyperparameters(true);
        assert_eq!(gp.hyperparameters().to_vec(), original.to_vec());
    }
}

#[test]
fn every_prior_mode_entry_draws_fresh_values() {
    let mut gp = GaussianProcessMechanism::new(1, KernelFamily::RationalQuadratic, cfg(6)).unwrap();
    gp.select_hyperparameters(false);
    let first = gp.hyperparameters();
    gp.select_hyperparameters(true);
    gp.select_hyperparameters(false);
    assert_ne!(gp.hyperparameters(), first);
}

#[test]
fn tiny_noise_draws_are_floored_exactly() {
    let tiny_noise = GaussianProcessConfig {
        noise_var_concentration: 1.0,
        noise_var_rate: 1e6,
        seed: Some(9),
        ..Default::default()
    };
    let mut gp = GaussianProcessMechanism::new(1, KernelFamily::Linear, tiny_noise).unwrap();
    assert_eq!(gp.hyperparameters().noise_variance(), 1e-3);
    gp.select_hyperparameters(false);
    assert_eq!(gp.hyperparameters().noise_variance(), 1e-3);
}

#[test]
fn optimiser_updates_survive_a_prior_excursion() {
    let mut gp = GaussianProcessMechanism::new(1, KernelFamily::RationalQuadratic, cfg(7)).unwrap();
    let tuned = Hyperparameters::RationalQuadratic {
        noise_variance: 0.01,
        outputscale: 1.3,
        lengthscale: 0.9,
        scale_mixture: 2.0,
    };
    gp.set_hyperparameters(tuned).unwrap();
    let _ = gp.expected_noise_entropy(Mode::Prior).unwrap();
    assert_eq!(gp.hyperparameters(), tuned);
    assert_eq!(gp.selection(), HyperparameterSelection::Posterior);
}

#[test]
fn rq_posterior_interpolates_training_data() {
    let mut gp = GaussianProcessMechanism::new(1, KernelFamily::RationalQuadratic, cfg(8)).unwrap();
    gp.set_hyperparameters(Hyperparameters::RationalQuadratic {
        noise_variance: 1e-3,
        outputscale: 1.0,
        lengthscale: 1.0,
        scale_mixture: 2.0,
    })
    .unwrap();
    let (x, y) = sine_data(25);
    gp.set_data(&x, &y).unwrap();

    let probe = DMatrix::from_row_slice(3, 1, &[-1.0, 0.3, 2.0]);
    let f = gp.forward(&[probe.clone()], Mode::Posterior).unwrap();
    for (i, v) in probe.iter().enumerate() {
        assert_close(f[0][i], v.sin(), 0.05, "posterior mean");
    }

    let targets = vec![probe.map(f64::sin).column(0).into_owned()];
    let post = gp
        .total_log_marginal_likelihood(&[probe.clone()], &targets, Mode::Posterior)
        .unwrap();
    let prior = gp
        .total_log_marginal_likelihood(&[probe], &targets, Mode::Prior)
        .unwrap();
    assert!(post > prior);
}

#[test]
fn samples_follow_batch_shapes() {
    let mut gp = GaussianProcessMechanism::new(2, KernelFamily::Linear, cfg(10)).unwrap();
    let inputs = vec![DMatrix::from_element(3, 2, 0.5), DMatrix::from_element(5, 2, -1.0)];
    let draws = gp.sample(&inputs, Mode::Prior).unwrap();
    assert_eq!(draws.len(), 2);
    assert_eq!(draws[0].len(), 3);
    assert_eq!(draws[1].len(), 5);
    assert!(gp.sample(&[DMatrix::zeros(2, 3)], Mode::Prior).is_err());
}

#[test]
fn hyperparameter_log_prior_prefers_prior_bulk() {
    let mut gp = GaussianProcessMechanism::new(1, KernelFamily::Linear, cfg(12)).unwrap();
    gp.set_hyperparameters(Hyperparameters::Linear {
        noise_variance: 0.1,
        variance: 1.0,
        offset: 0.0,
    })
    .unwrap();
    let typical = gp.hyperparam_log_prior().unwrap();
    gp.set_hyperparameters(Hyperparameters::Linear {
        noise_variance: 5.0,
        variance: 40.0,
        offset: 6.0,
    })
    .unwrap();
    let extreme = gp.hyperparam_log_prior().unwrap();
    assert!(typical > extreme);
}

#[test]
fn static_gp_ignores_mode_and_scores_point_predictions() {
    let mut gp = StaticGaussianProcess::new(1, KernelFamily::RationalQuadratic, cfg(13)).unwrap();
    let x = vec![DMatrix::from_row_slice(4, 1, &[-2.0, -0.5, 1.0, 7.5])];
    let prior = gp.forward(&x, Mode::Prior).unwrap();
    let posterior = gp.forward(&x, Mode::Posterior).unwrap();
    assert_eq!(prior, posterior);

    let noise = gp.hyperparameters().noise_variance();
    let h = gp.expected_noise_entropy(Mode::Prior).unwrap();
    assert_close(
        h,
        0.5 * (2.0 * std::f64::consts::PI * std::f64::consts::E * noise).ln(),
        1e-12,
        "static entropy",
    );
}
