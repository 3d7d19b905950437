//! End-to-end training across the emission families.
//!
//! Each family starts from explicit parameters near (but not at) the data
//! generating values, so the assertions track EM refinement rather than the
//! luck of a random draw.

use assert_approx_eq::assert_approx_eq;
use hidden_markov::{
    Categorical, CovarianceKind, EmissionModel, Gaussian, GaussianMixture, HiddenMarkovModel,
    HmmConfig, Multinomial, MixtureCovariances, Poisson, StateCovariances,
};
use nalgebra::{DMatrix, DVector};

fn scalar_rows(values: &[f64]) -> Vec<DVector<f64>> {
    values.iter().map(|&v| DVector::from_row_slice(&[v])).collect()
}

/// Deterministic bimodal scalar data alternating between blocks near 0 and
/// blocks near 5.
fn bimodal_blocks() -> Vec<DVector<f64>> {
    let mut values = Vec::new();
    for block in 0..12 {
        let center = if block % 2 == 0 { 0.0 } else { 5.0 };
        for i in 0..5 {
            values.push(center + (i as f64 - 2.0) * 0.15);
        }
    }
    scalar_rows(&values)
}

#[test]
fn gaussian_diag_separates_bimodal_levels() {
    let emission = Gaussian::new(2, 1, CovarianceKind::Diag)
        .unwrap()
        .with_means(DMatrix::from_row_slice(2, 1, &[1.0, 4.0]))
        .unwrap()
        .with_covariances(StateCovariances::Diag(DMatrix::from_row_slice(
            2,
            1,
            &[1.0, 1.0],
        )))
        .unwrap();
    let config = HmmConfig::default().with_n_iter(30).with_tol(1e-6).with_seed(1);
    let mut model = HiddenMarkovModel::new(emission, config).unwrap();
    let data = bimodal_blocks();
    let log_prob = model.fit(&data, None).unwrap();
    assert!(log_prob.is_finite());
    let means = model.emission().means().unwrap();
    let (low, high) = if means[(0, 0)] < means[(1, 0)] {
        (means[(0, 0)], means[(1, 0)])
    } else {
        (means[(1, 0)], means[(0, 0)])
    };
    assert!((low - 0.0).abs() < 0.5, "low mean drifted to {low}");
    assert!((high - 5.0).abs() < 0.5, "high mean drifted to {high}");
    // Blocks of five samples make self-transitions dominant.
    let trans = model.trans_mat().unwrap();
    assert!(trans[(0, 0)] > 0.5);
    assert!(trans[(1, 1)] > 0.5);
}

#[test]
fn gaussian_full_trains_on_correlated_data() {
    let mut data = Vec::new();
    for i in 0..40 {
        let t = i as f64 * 0.25;
        // Two elongated clouds with strong coordinate coupling.
        if i % 2 == 0 {
            data.push(DVector::from_row_slice(&[t.sin(), t.sin() * 0.8 + 0.1]));
        } else {
            data.push(DVector::from_row_slice(&[
                4.0 + t.cos(),
                4.0 + t.cos() * 0.9,
            ]));
        }
    }
    let emission = Gaussian::new(2, 2, CovarianceKind::Full)
        .unwrap()
        .with_means(DMatrix::from_row_slice(2, 2, &[0.5, 0.5, 3.5, 3.5]))
        .unwrap();
    let config = HmmConfig::default().with_n_iter(20).with_tol(1e-6).with_seed(2);
    let mut model = HiddenMarkovModel::new(emission, config).unwrap();
    let log_prob = model.fit(&data, None).unwrap();
    assert!(log_prob.is_finite());
    match model.emission().covariances().unwrap() {
        StateCovariances::Full(mats) => {
            for cov in mats {
                assert_eq!(cov.shape(), (2, 2));
                // Symmetry survives re-estimation.
                assert_approx_eq!(cov[(0, 1)], cov[(1, 0)], 1e-9);
            }
        }
        other => panic!("unexpected covariance storage {other:?}"),
    }
}

#[test]
fn gaussian_tied_and_spherical_train_cleanly() {
    for kind in [CovarianceKind::Tied, CovarianceKind::Spherical] {
        let emission = Gaussian::new(2, 1, kind)
            .unwrap()
            .with_means(DMatrix::from_row_slice(2, 1, &[1.0, 4.0]))
            .unwrap();
        let config = HmmConfig::default().with_n_iter(15).with_tol(1e-6).with_seed(3);
        let mut model = HiddenMarkovModel::new(emission, config).unwrap();
        let log_prob = model.fit(&bimodal_blocks(), None).unwrap();
        assert!(log_prob.is_finite(), "{:?} fit diverged", kind);
    }
}

#[test]
fn poisson_refines_rates_toward_the_data() {
    let mut data = Vec::new();
    // Blocks of low counts (rate ~1) and high counts (rate ~8).
    for block in 0..10 {
        let counts: [f64; 4] = if block % 2 == 0 {
            [1.0, 0.0, 2.0, 1.0]
        } else {
            [7.0, 9.0, 8.0, 10.0]
        };
        for &count in &counts {
            data.push(DVector::from_row_slice(&[count]));
        }
    }
    let emission = Poisson::new(2, 1)
        .unwrap()
        .with_lambdas(DMatrix::from_row_slice(2, 1, &[2.0, 6.0]))
        .unwrap();
    let config = HmmConfig::default().with_n_iter(25).with_tol(1e-6).with_seed(4);
    let mut model = HiddenMarkovModel::new(emission, config).unwrap();
    let log_prob = model.fit(&data, None).unwrap();
    assert!(log_prob.is_finite());
    let lambdas = model.emission().lambdas().unwrap();
    let (low, high) = if lambdas[(0, 0)] < lambdas[(1, 0)] {
        (lambdas[(0, 0)], lambdas[(1, 0)])
    } else {
        (lambdas[(1, 0)], lambdas[(0, 0)])
    };
    assert!((low - 1.0).abs() < 1.0, "low rate {low}");
    assert!((high - 8.5).abs() < 1.5, "high rate {high}");
}

#[test]
fn multinomial_separates_symbol_preferences() {
    let mut data = Vec::new();
    for block in 0..10 {
        let row: [f64; 2] = if block % 2 == 0 { [5.0, 0.0] } else { [0.0, 5.0] };
        for _ in 0..3 {
            data.push(DVector::from_row_slice(&row));
        }
    }
    let emission = Multinomial::new(2, 2)
        .unwrap()
        .with_n_trials(5)
        .unwrap()
        .with_emission_prob(DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.3, 0.7]))
        .unwrap();
    let config = HmmConfig::default().with_n_iter(25).with_tol(1e-6).with_seed(6);
    let mut model = HiddenMarkovModel::new(emission, config).unwrap();
    let log_prob = model.fit(&data, None).unwrap();
    assert!(log_prob.is_finite());
    let emission_prob = model.emission().emission_prob().unwrap();
    let first_preference = emission_prob[(0, 0)].max(emission_prob[(1, 0)]);
    assert!(
        first_preference > 0.95,
        "no state specialised on symbol 0: {first_preference}"
    );
}

#[test]
fn mixture_components_find_both_modes_within_a_state() {
    // One hidden state whose emission is itself bimodal.
    let mut values = Vec::new();
    for i in 0..30 {
        values.push(if i % 2 == 0 { 0.0 } else { 4.0 } + (i % 3) as f64 * 0.1);
    }
    let data = scalar_rows(&values);
    let emission = GaussianMixture::new(1, 2, 1, CovarianceKind::Diag)
        .unwrap()
        .with_weights(DMatrix::from_row_slice(1, 2, &[0.6, 0.4]))
        .unwrap()
        .with_means(vec![DMatrix::from_row_slice(2, 1, &[1.0, 3.0])])
        .unwrap()
        .with_covariances(MixtureCovariances::Diag(vec![DMatrix::from_row_slice(
            2,
            1,
            &[1.0, 1.0],
        )]))
        .unwrap();
    let config = HmmConfig::default().with_n_iter(40).with_tol(1e-8).with_seed(8);
    let mut model = HiddenMarkovModel::new(emission, config).unwrap();
    let log_prob = model.fit(&data, None).unwrap();
    assert!(log_prob.is_finite());
    let means = model.emission().means().unwrap();
    let (low, high) = if means[0][(0, 0)] < means[0][(1, 0)] {
        (means[0][(0, 0)], means[0][(1, 0)])
    } else {
        (means[0][(1, 0)], means[0][(0, 0)])
    };
    assert!((low - 0.1).abs() < 0.5, "low component mean {low}");
    assert!((high - 4.1).abs() < 0.5, "high component mean {high}");
    let weights = model.emission().weights().unwrap();
    assert_approx_eq!(weights.row(0).iter().sum::<f64>(), 1.0, 1e-9);
    assert!(weights[(0, 0)] > 0.3 && weights[(0, 1)] > 0.3);
}

#[test]
fn mixture_covariance_kinds_train_cleanly() {
    let mut values = Vec::new();
    for i in 0..30 {
        values.push(if i % 2 == 0 { 0.0 } else { 4.0 } + (i % 3) as f64 * 0.1);
    }
    let data = scalar_rows(&values);
    for kind in [
        CovarianceKind::Spherical,
        CovarianceKind::Full,
        CovarianceKind::Tied,
    ] {
        let emission = GaussianMixture::new(1, 2, 1, kind)
            .unwrap()
            .with_weights(DMatrix::from_row_slice(1, 2, &[0.5, 0.5]))
            .unwrap()
            .with_means(vec![DMatrix::from_row_slice(2, 1, &[0.5, 3.5])])
            .unwrap();
        // Covariances are left unset so initialisation derives them from
        // the pooled data scatter, then EM refines them per kind.
        let config = HmmConfig::default().with_n_iter(40).with_tol(1e-8).with_seed(12);
        let mut model = HiddenMarkovModel::new(emission, config).unwrap();
        let log_prob = model.fit(&data, None).unwrap();
        assert!(log_prob.is_finite(), "{kind:?} fit diverged");
        assert!(model.emission().validate().is_ok(), "{kind:?} left invalid parameters");
        let means = model.emission().means().unwrap();
        let (low, high) = if means[0][(0, 0)] < means[0][(1, 0)] {
            (means[0][(0, 0)], means[0][(1, 0)])
        } else {
            (means[0][(1, 0)], means[0][(0, 0)])
        };
        assert!((low - 0.1).abs() < 0.5, "{kind:?} low component mean {low}");
        assert!((high - 4.1).abs() < 0.5, "{kind:?} high component mean {high}");
        match model.emission().covariances().unwrap() {
            MixtureCovariances::Spherical(vars) => {
                assert!(vars.iter().all(|v| v.is_finite() && *v > 0.0));
            }
            MixtureCovariances::Full(per_state) => {
                for cov in &per_state[0] {
                    assert!(cov[(0, 0)].is_finite() && cov[(0, 0)] > 0.0);
                }
            }
            MixtureCovariances::Tied(per_state) => {
                assert_eq!(per_state.len(), 1);
                assert!(per_state[0][(0, 0)].is_finite() && per_state[0][(0, 0)] > 0.0);
            }
            other => panic!("unexpected storage {other:?}"),
        }
    }
}

#[test]
fn categorical_em_with_frozen_emissions_only_moves_the_chain() {
    let emission_matrix = DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]);
    let emission = Categorical::new(2, 2)
        .unwrap()
        .with_emission_prob(emission_matrix.clone())
        .unwrap();
    let config = HmmConfig::default()
        .with_params("st")
        .unwrap()
        .with_n_iter(10)
        .with_seed(9);
    let mut model = HiddenMarkovModel::new(emission, config).unwrap();
    let observations = [0usize, 0, 0, 1, 1, 1, 0, 0, 1, 1, 0, 0];
    model.fit(&observations, None).unwrap();
    // Emission rows were excluded from training and must be untouched.
    assert_eq!(model.emission().emission_prob().unwrap(), &emission_matrix);
    // The chain itself was re-estimated.
    let trans = model.trans_mat().unwrap();
    assert_approx_eq!(trans.row(0).iter().sum::<f64>(), 1.0, 1e-9);
}
