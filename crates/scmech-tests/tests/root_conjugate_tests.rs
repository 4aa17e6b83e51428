//! Analytical tests for the conjugate Normal-Inverse-Gamma root node.
//!
//! Expected values are worked out by hand from the closed-form NIG update and
//! marginal likelihood.

use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use scmech_core::engine::errors::MechanismError;
use scmech_core::mechanisms::NigParams;
use scmech_core::{ConjugateGaussianRoot, GaussianRootConfig, Mechanism, Mode};
use statrs::function::gamma::ln_gamma;

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

fn root(mu_0: f64, kappa_0: f64, alpha_0: f64, beta_0: f64) -> ConjugateGaussianRoot {
    ConjugateGaussianRoot::new(GaussianRootConfig {
        mu_0,
        kappa_0,
        alpha_0,
        beta_0,
        seed: Some(42),
    })
    .unwrap()
}

fn rows(n: usize) -> DMatrix<f64> {
    DMatrix::zeros(n, 0)
}

fn log_normaliser(p: &NigParams) -> f64 {
    ln_gamma(p.alpha) - p.alpha * p.beta.ln() - 0.5 * p.kappa.ln()
}

#[test]
fn three_point_update_matches_closed_form() {
    // Prior (0, 1, 1, 1), data 1, 2, 3:
    //   kappa_n = 4, mu_n = 6/4 = 1.5, alpha_n = 2.5
    //   beta_n  = 1 + 0.5*2 + 0.5*1*3*4/4 = 3.5
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    m.set_data(&[DVector::from_vec(vec![1.0, 2.0, 3.0])]).unwrap();
    let p = m.posterior();
    assert_close(p.kappa, 4.0, 1e-12, "kappa_n");
    assert_close(p.mu, 1.5, 1e-12, "mu_n");
    assert_close(p.alpha, 2.5, 1e-12, "alpha_n");
    assert_close(p.beta, 3.5, 1e-12, "beta_n");
    assert_eq!(m.prior().kappa, 1.0);
}

#[test]
fn second_set_data_replaces_first_fit() {
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    m.set_data(&[DVector::from_vec(vec![10.0, 20.0])]).unwrap();
    m.set_data(&[DVector::from_vec(vec![1.0, 2.0, 3.0])]).unwrap();
    assert_close(m.posterior().mu, 1.5, 1e-12, "mu_n after refit");
}

#[test]
fn batched_training_targets_are_rejected() {
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    let batch = [DVector::from_vec(vec![1.0]), DVector::from_vec(vec![2.0])];
    assert!(matches!(
        m.set_data(&batch),
        Err(MechanismError::MultiplePosteriorSetsUnsupported)
    ));
    assert_eq!(m.posterior(), m.prior());
}

#[test]
fn single_observation_log_likelihood_matches_closed_form() {
    // One observation x = 0.5 under prior (0, 1, 1, 1):
    //   after = (0.25, 2, 1.5, 1 + 0.5*1*1*0.25/2 = 1.0625)
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    let after = NigParams {
        mu: 0.25,
        kappa: 2.0,
        alpha: 1.5,
        beta: 1.0625,
    };
    let before = m.prior();
    let expected =
        log_normaliser(&after) - log_normaliser(&before) - 0.5 * (2.0 * PI).ln();
    let ll = m
        .log_marginal_likelihood(&[rows(1)], &[DVector::from_vec(vec![0.5])], Mode::Prior)
        .unwrap();
    assert_close(ll[0], expected, 1e-9, "single-point mll");
}

#[test]
fn posterior_mode_scores_against_training_data() {
    let mut m = root(0.0, 1.0, 2.0, 2.0);
    m.set_data(&[DVector::from_vec(vec![5.0, 5.2, 4.8, 5.1])]).unwrap();
    let near = vec![DVector::from_vec(vec![5.0, 4.9])];
    let post = m
        .total_log_marginal_likelihood(&[rows(2)], &near, Mode::Posterior)
        .unwrap();
    let prior = m
        .total_log_marginal_likelihood(&[rows(2)], &near, Mode::Prior)
        .unwrap();
    assert!(post > prior, "posterior {} should beat prior {}", post, prior);
}

#[test]
fn batch_log_likelihoods_are_per_dataset() {
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    let targets = vec![
        DVector::from_vec(vec![0.1, -0.2]),
        DVector::from_vec(vec![3.0]),
        DVector::from_vec(vec![]),
    ];
    let inputs = vec![rows(2), rows(1), rows(0)];
    let lls = m
        .log_marginal_likelihood(&inputs, &targets, Mode::Prior)
        .unwrap();
    assert_eq!(lls.len(), 3);
    assert_close(lls[2], 0.0, 1e-12, "empty dataset mll");
    let total = m
        .total_log_marginal_likelihood(&inputs, &targets, Mode::Prior)
        .unwrap();
    assert_close(total, lls.iter().sum(), 1e-12, "reduced mll");
}

#[test]
fn mismatched_batches_are_shape_errors() {
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    let err = m
        .log_marginal_likelihood(&[rows(2)], &[DVector::zeros(3)], Mode::Prior)
        .unwrap_err();
    assert!(matches!(err, MechanismError::ShapeMismatch(_)));
    let err = m.forward(&[DMatrix::zeros(2, 1)], Mode::Prior).unwrap_err();
    assert!(matches!(err, MechanismError::ShapeMismatch(_)));
}

#[test]
fn sequential_and_joint_scores_agree() {
    let x1 = DVector::from_vec(vec![0.3, -1.1, 2.4]);
    let x2 = DVector::from_vec(vec![0.9, 1.7]);
    let joint = DVector::from_iterator(5, x1.iter().chain(x2.iter()).copied());

    let mut fresh = root(0.5, 2.0, 3.0, 1.5);
    let whole = fresh
        .total_log_marginal_likelihood(&[rows(5)], &[joint], Mode::Prior)
        .unwrap();
    let first = fresh
        .total_log_marginal_likelihood(&[rows(3)], &[x1.clone()], Mode::Prior)
        .unwrap();

    let mut fitted = root(0.5, 2.0, 3.0, 1.5);
    fitted.set_data(&[x1]).unwrap();
    let second = fitted
        .total_log_marginal_likelihood(&[rows(2)], &[x2], Mode::Posterior)
        .unwrap();
    assert_close(first + second, whole, 1e-9, "mll chain rule");
}

#[test]
fn posterior_concentrates_on_true_parameters() {
    let (true_mean, true_sd) = (3.0, 0.5);
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let normal = Normal::new(true_mean, true_sd).unwrap();
    let n = 20_000;
    let data = DVector::from_fn(n, |_, _| normal.sample(&mut rng));
    let sample_mean = data.mean();

    let mut m = root(0.0, 1.0, 1.0, 1.0);
    m.set_data(&[data]).unwrap();
    let p = m.posterior();
    assert_close(p.mu, sample_mean, 1e-3, "mu_n vs sample mean");
    assert_close(p.kappa, n as f64 + 1.0, 1e-9, "kappa_n");
    assert_close(p.alpha / p.beta, 1.0 / (true_sd * true_sd), 0.15, "precision");
}

#[test]
fn expected_entropy_uses_digamma_form() {
    // alpha = 1: psi(1) = -gamma_EM
    let mut m = root(0.0, 1.0, 1.0, 2.0);
    let euler_gamma = 0.577_215_664_901_532_9;
    let expected = 0.5 * ((2.0 * PI * std::f64::consts::E).ln() + euler_gamma + 2f64.ln());
    assert_close(
        m.expected_noise_entropy(Mode::Prior).unwrap(),
        expected,
        1e-8,
        "expected entropy",
    );
}

#[test]
fn forward_broadcasts_mean() {
    let mut m = root(0.0, 1.0, 1.0, 1.0);
    m.set_data(&[DVector::from_vec(vec![1.0, 2.0, 3.0])]).unwrap();
    let out = m.forward(&[rows(3), rows(1)], Mode::Posterior).unwrap();
    assert_eq!(out[0], DVector::from_element(3, 1.5));
    assert_eq!(out[1], DVector::from_element(1, 1.5));
    let prior = m.forward(&[rows(2)], Mode::Prior).unwrap();
    assert_eq!(prior[0], DVector::zeros(2));
}

#[test]
fn predictive_draws_match_nig_moments() {
    // Prior (1, 1, 3, 2) fit to [0.5, 1.5]: mu_n = 1, kappa_n = 3, alpha_n = 4, beta_n = 2.25.
    // Predictive is Student-t with mean mu_n and variance beta_n/(alpha_n-1)·(1+1/kappa_n) = 1.
    let mut m = root(1.0, 1.0, 3.0, 2.0);
    m.set_data(&[DVector::from_vec(vec![0.5, 1.5])]).unwrap();
    let p = m.posterior();
    let expected_var = p.beta / (p.alpha - 1.0) * (1.0 + 1.0 / p.kappa);
    assert_close(expected_var, 1.0, 1e-12, "predictive variance");

    let n = 40_000;
    let inputs: Vec<DMatrix<f64>> = (0..n).map(|_| rows(1)).collect();
    let draws: Vec<f64> = m
        .sample(&inputs, Mode::Posterior)
        .unwrap()
        .iter()
        .map(|d| d[0])
        .collect();
    let mean = draws.iter().sum::<f64>() / n as f64;
    let var = draws.iter().map(|y| (y - mean) * (y - mean)).sum::<f64>() / (n - 1) as f64;
    assert_close(mean, p.mu, 0.05, "predictive mean");
    assert_close(var, expected_var, 0.06, "predictive variance");
}

#[test]
fn each_dataset_in_a_batch_gets_its_own_draw() {
    let mut m = root(1.0, 3.0, 4.0, 2.25);
    let inputs: Vec<DMatrix<f64>> = (0..8).map(|_| rows(500)).collect();
    let draws = m.sample(&inputs, Mode::Prior).unwrap();

    let means: Vec<f64> = draws.iter().map(|d| d.mean()).collect();
    let spread = means.iter().cloned().fold(f64::MIN, f64::max)
        - means.iter().cloned().fold(f64::MAX, f64::min);
    // Per-dataset mu varies with sd ~0.4; a shared mu would keep dataset means within ~0.1.
    assert!(spread > 0.2, "dataset means too close: {:?}", means);

    let singles = m.sample(&[rows(1), rows(1)], Mode::Prior).unwrap();
    assert_ne!(singles[0][0], singles[1][0]);
}
