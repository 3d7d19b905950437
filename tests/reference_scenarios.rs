//! End-to-end scenarios with externally verified reference values.
//!
//! The expected numbers were recomputed independently (brute-force path
//! enumeration and a separate oracle implementation) for the literal inputs
//! below, so any drift in the recurrences shows up as an absolute error
//! rather than a self-consistent bias.

use assert_approx_eq::assert_approx_eq;
use hidden_markov::{
    Categorical, CovarianceKind, DecodeAlgorithm, Gaussian, HiddenMarkovModel, HmmConfig,
    StateCovariances,
};
use nalgebra::{DMatrix, DVector};

fn categorical_reference() -> hidden_markov::CategoricalHmm {
    let emission = Categorical::new(2, 3)
        .unwrap()
        .with_emission_prob(DMatrix::from_row_slice(
            2,
            3,
            &[0.1, 0.4, 0.5, 0.6, 0.3, 0.1],
        ))
        .unwrap();
    HiddenMarkovModel::new(emission, HmmConfig::default())
        .unwrap()
        .with_start_prob(DVector::from_row_slice(&[0.6, 0.4]))
        .unwrap()
        .with_trans_mat(DMatrix::from_row_slice(2, 2, &[0.7, 0.3, 0.4, 0.6]))
        .unwrap()
}

fn gaussian_reference() -> hidden_markov::GaussianHmm {
    let emission = Gaussian::new(2, 1, CovarianceKind::Diag)
        .unwrap()
        .with_means(DMatrix::from_row_slice(2, 1, &[0.0, 3.0]))
        .unwrap()
        .with_covariances(StateCovariances::Diag(DMatrix::from_row_slice(
            2,
            1,
            &[1.0, 1.0],
        )))
        .unwrap();
    HiddenMarkovModel::new(emission, HmmConfig::default())
        .unwrap()
        .with_start_prob(DVector::from_row_slice(&[0.5, 0.5]))
        .unwrap()
        .with_trans_mat(DMatrix::from_row_slice(2, 2, &[0.9, 0.1, 0.2, 0.8]))
        .unwrap()
}

fn gaussian_rows(values: &[f64]) -> Vec<DVector<f64>> {
    values.iter().map(|&v| DVector::from_row_slice(&[v])).collect()
}

mod categorical_two_state {
    use super::*;

    const OBSERVATIONS: [usize; 6] = [0, 1, 2, 2, 1, 0];

    #[test]
    fn forward_log_probability() {
        let model = categorical_reference();
        let log_prob = model.score(&OBSERVATIONS, None).unwrap();
        assert_approx_eq!(log_prob, -6.643386378986, 1e-6);
    }

    #[test]
    fn viterbi_path() {
        let model = categorical_reference();
        let (score, path) = model
            .decode_with(&OBSERVATIONS, None, DecodeAlgorithm::Viterbi)
            .unwrap();
        assert_eq!(path, vec![1, 0, 0, 0, 0, 1]);
        assert_approx_eq!(score, -8.347106, 1e-5);
    }

    #[test]
    fn first_frame_posterior() {
        let model = categorical_reference();
        let (_, posteriors) = model.score_samples(&OBSERVATIONS, None).unwrap();
        assert_approx_eq!(posteriors[(0, 0)], 0.2339300928, 1e-6);
        assert_approx_eq!(posteriors[(0, 1)], 0.7660699072, 1e-6);
    }

    #[test]
    fn posterior_rows_are_distributions() {
        let model = categorical_reference();
        let (_, posteriors) = model.score_samples(&OBSERVATIONS, None).unwrap();
        for t in 0..OBSERVATIONS.len() {
            assert_approx_eq!(posteriors.row(t).iter().sum::<f64>(), 1.0, 1e-9);
        }
    }
}

mod gaussian_two_state {
    use super::*;

    #[test]
    fn forward_log_probability() {
        let model = gaussian_reference();
        let data = gaussian_rows(&[0.1, 0.2, 3.1, 2.9, 0.0]);
        let log_prob = model.score(&data, None).unwrap();
        assert_approx_eq!(log_prob, -9.466594268075, 1e-6);
    }

    #[test]
    fn viterbi_path_follows_the_level_shift() {
        let model = gaussian_reference();
        let data = gaussian_rows(&[0.1, 0.2, 3.1, 2.9, 0.0]);
        let (score, path) = model
            .decode_with(&data, None, DecodeAlgorithm::Viterbi)
            .unwrap();
        assert_eq!(path, vec![0, 0, 1, 1, 0]);
        assert_approx_eq!(score, -9.563366918983, 1e-6);
    }

    #[test]
    fn map_decode_agrees_on_well_separated_states() {
        let model = gaussian_reference();
        let data = gaussian_rows(&[0.1, 0.2, 3.1, 2.9, 0.0]);
        let (_, path) = model
            .decode_with(&data, None, DecodeAlgorithm::Map)
            .unwrap();
        assert_eq!(path, vec![0, 0, 1, 1, 0]);
    }
}

mod em_training {
    use super::*;

    #[test]
    fn categorical_em_reaches_the_alternating_block_optimum() {
        let mut observations = Vec::new();
        for _ in 0..10 {
            observations.extend_from_slice(&[0usize, 0, 1, 1, 0, 0, 1, 1]);
        }
        let emission = Categorical::new(2, 2).unwrap();
        let config = HmmConfig::default()
            .with_n_iter(50)
            .with_tol(1e-6)
            .with_seed(42);
        let mut model = HiddenMarkovModel::new(emission, config).unwrap();
        let log_prob = model.fit(&observations, None).unwrap();
        // The best two-state explanation of the period-4 block pattern costs
        // one bit per transition: 79 * ln(1/2) ≈ -54.76.
        assert!(
            (-55.5..=-54.5).contains(&log_prob),
            "converged log-probability {log_prob} outside the expected band"
        );
        let trans = model.trans_mat().unwrap();
        for i in 0..2 {
            assert_approx_eq!(trans.row(i).iter().sum::<f64>(), 1.0, 1e-9);
            for j in 0..2 {
                assert!(trans[(i, j)] >= 0.0);
            }
        }
        let start = model.start_prob().unwrap();
        assert_approx_eq!(start.iter().sum::<f64>(), 1.0, 1e-9);
    }

    #[test]
    fn refitting_with_a_fresh_seed_stays_in_band() {
        let mut observations = Vec::new();
        for _ in 0..10 {
            observations.extend_from_slice(&[0usize, 0, 1, 1, 0, 0, 1, 1]);
        }
        for seed in [1, 7, 123] {
            let emission = Categorical::new(2, 2).unwrap();
            let config = HmmConfig::default()
                .with_n_iter(50)
                .with_tol(1e-6)
                .with_seed(seed);
            let mut model = HiddenMarkovModel::new(emission, config).unwrap();
            let log_prob = model.fit(&observations, None).unwrap();
            assert!(
                (-55.5..=-54.5).contains(&log_prob),
                "seed {seed} converged to {log_prob}"
            );
        }
    }
}

mod boundaries {
    use super::*;

    #[test]
    fn single_state_model_collapses_to_frame_sum() {
        let emission = Categorical::new(1, 2).unwrap();
        let config = HmmConfig::default().with_seed(3);
        let mut model = HiddenMarkovModel::new(emission, config).unwrap();
        let observations = [0usize, 1, 0, 0, 1];
        model.fit(&observations, None).unwrap();
        assert_approx_eq!(model.start_prob().unwrap()[0], 1.0, 1e-12);
        assert_approx_eq!(model.trans_mat().unwrap()[(0, 0)], 1.0, 1e-12);
        // With one state the score is the sum of per-frame log-likelihoods.
        let emission_prob = model.emission().emission_prob().unwrap();
        let expected: f64 = observations
            .iter()
            .map(|&symbol| emission_prob[(0, symbol)].ln())
            .sum();
        let actual = model.score(&observations, None).unwrap();
        assert_approx_eq!(actual, expected, 1e-9);
    }

    #[test]
    fn single_frame_subsequence() {
        let model = categorical_reference();
        let observations = [0usize];
        let (log_prob, posteriors) = model.score_samples(&observations, None).unwrap();
        // alpha[0] = log pi + frame[0]; the posterior is its softmax.
        let expected_log_prob = (0.6f64 * 0.1 + 0.4 * 0.6).ln();
        assert_approx_eq!(log_prob, expected_log_prob, 1e-9);
        assert_approx_eq!(posteriors[(0, 0)], 0.6 * 0.1 / (0.6 * 0.1 + 0.4 * 0.6), 1e-9);
        assert_approx_eq!(posteriors.row(0).iter().sum::<f64>(), 1.0, 1e-12);
    }

    #[test]
    fn lengths_partition_equals_independent_slices() {
        let model = categorical_reference();
        let observations = [0usize, 1, 2, 2, 1, 0, 0, 1, 2, 0];
        let lengths = [3usize, 4, 3];
        let joint = model.score(&observations, Some(&lengths)).unwrap();
        assert_approx_eq!(joint, -11.127088920643, 1e-6);

        let mut total = 0.0;
        let mut stacked_rows = Vec::new();
        let mut offset = 0;
        for &len in &lengths {
            let slice = &observations[offset..offset + len];
            total += model.score(slice, None).unwrap();
            let (_, posteriors) = model.score_samples(slice, None).unwrap();
            for t in 0..len {
                stacked_rows.push((posteriors[(t, 0)], posteriors[(t, 1)]));
            }
            offset += len;
        }
        assert_approx_eq!(joint, total, 1e-10);

        let (_, joint_posteriors) = model.score_samples(&observations, Some(&lengths)).unwrap();
        for (t, &(p0, p1)) in stacked_rows.iter().enumerate() {
            assert_approx_eq!(joint_posteriors[(t, 0)], p0, 1e-10);
            assert_approx_eq!(joint_posteriors[(t, 1)], p1, 1e-10);
        }
    }
}
