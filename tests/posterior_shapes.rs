//! Shape contracts for posterior evaluation and sampling.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use tmnre::{
    Dataset, Marginal, MarginalIndex, Observation, ObservationBatch, Posteriors, Prior,
    TrainOptions,
};

/// Two parameters, both observed with independent noise.
fn trained_posteriors() -> (Posteriors, MarginalIndex, Observation) {
    let prior = Prior::uniform(vec![-5.0, -5.0], vec![5.0, 5.0]).expect("valid prior");
    let mut posteriors = Posteriors::new(prior);

    // One 2-D joint marginal plus both 1-D marginals.
    let index = MarginalIndex::new(vec![vec![0], vec![1], vec![0, 1]]).expect("valid index");
    posteriors.add(&index, 2, 1).expect("add estimator");

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
    let mut dataset = Dataset::new(2).expect("valid dataset");
    let n = 400;
    let u = DMatrix::from_fn(n, 2, |_, _| rng.random::<f64>());
    let v = u.map(|x| x * 10.0 - 5.0);
    dataset.append_pending(u, v).expect("append");

    let mut simulator = |v: &DMatrix<f64>| {
        let mut noise = Xoshiro256PlusPlus::seed_from_u64(7);
        let x = DMatrix::from_fn(v.nrows(), 2, |r, c| v[(r, c)] + noise.random::<f64>() - 0.5);
        ObservationBatch::single("x", x).map_err(|e| e.to_string())
    };
    dataset.simulate_missing(&mut simulator).expect("simulate");

    posteriors
        .train(&index, &dataset, &TrainOptions::quick().seed(3))
        .expect("training");

    let observation = Observation::single("x", DVector::from_vec(vec![1.0, -2.0]));
    (posteriors, index, observation)
}

#[test]
fn log_prob_returns_one_value_per_batch_row_per_marginal() {
    let (posteriors, index, observation) = trained_posteriors();
    let posterior = posteriors.posterior(&index).expect("posterior");

    for n_batch in [1usize, 10, 250] {
        let v = DMatrix::zeros(n_batch, 2);
        let lp = posterior.log_prob(&observation, &v).expect("log_prob");
        assert_eq!(lp.len(), 3, "one entry per marginal group");
        for (marginal, values) in &lp {
            assert_eq!(
                values.len(),
                n_batch,
                "marginal {marginal} should have one value per row"
            );
        }
    }
}

#[test]
fn weighted_sample_keys_are_the_marginals_plus_raw_draws() {
    let (posteriors, index, observation) = trained_posteriors();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
    let weighted = posteriors
        .weighted_sample(100, &observation, &mut rng)
        .expect("weighted sample");

    assert_eq!(weighted.v.nrows(), 100);
    assert_eq!(weighted.v.ncols(), 2);
    assert_eq!(weighted.parameter_names, vec!["v0", "v1"]);

    let expected: Vec<Marginal> = index.groups().to_vec();
    let got: Vec<Marginal> = weighted.marginals().cloned().collect();
    assert_eq!(got, expected);
    for marginal in &expected {
        assert_eq!(weighted.weights[marginal].len(), 100);
    }
}

#[test]
fn sample_shapes_match_group_widths() {
    let (posteriors, _, observation) = trained_posteriors();
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(21);
    let samples = posteriors
        .sample(150, &observation, &mut rng)
        .expect("sample");

    // The raw truncated-prior draws ride along in full dimensionality.
    assert_eq!(samples.v.nrows(), 150);
    assert_eq!(samples.v.ncols(), 2);

    assert_eq!(samples.samples.len(), 3);
    for (marginal, draws) in &samples.samples {
        assert_eq!(draws.nrows(), 150);
        assert_eq!(draws.ncols(), marginal.len());
        assert!(draws.iter().all(|x| x.is_finite()));
        // Draws live inside the prior support.
        assert!(draws.iter().all(|&x| (-5.0..=5.0).contains(&x)));
    }
}

#[test]
fn equivalent_marginal_specs_address_the_same_estimator() {
    let (posteriors, _, _) = trained_posteriors();

    // Group order and inner order do not matter after canonicalization.
    let shuffled = MarginalIndex::new(vec![vec![1, 0], vec![1], vec![0]]).expect("valid index");
    assert!(posteriors.posterior(&shuffled).is_ok());
}
