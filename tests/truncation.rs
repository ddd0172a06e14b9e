//! Bound extraction, nesting, and the sequential driver.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use tmnre::{
    truncate_bound, truncate_bound_default, Bound, Error, Marginal, MarginalIndex, Observation,
    ObservationBatch, Prior, TruncationDriver, TruncationOptions, TruncationStatus,
};

#[test]
fn extraction_brackets_the_high_ratio_region() {
    // Log-ratios peak around u = 0.6 and fall off quadratically; samples
    // far from the peak are suppressed by much more than ln(1e-6).
    let n = 500;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
    let u = DMatrix::from_fn(n, 1, |_, _| rng.random::<f64>());
    let ratios = DVector::from_fn(n, |i, _| {
        let d: f64 = u[(i, 0)] - 0.6;
        -400.0 * d * d
    });

    let mut logratios = BTreeMap::new();
    logratios.insert(Marginal::new(vec![0]).expect("valid"), ratios);
    let bound =
        truncate_bound_default(&u, &logratios, &Bound::unit_cube(1)).expect("extraction");

    let (lo, hi) = bound.interval(0);
    // ln(1e-6) = -13.8, so the mask keeps |u - 0.6| < ~0.186.
    assert!(lo > 0.3 && lo < 0.6, "low edge {lo}");
    assert!(hi > 0.6 && hi < 0.9, "high edge {hi}");
    assert!(bound.volume() < 0.5);
}

#[test]
fn repeated_truncation_nests_volumes() {
    let n = 400;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(6);
    let marginal = Marginal::new(vec![0]).expect("valid");

    let mut bound = Bound::unit_cube(1);
    let mut volumes = vec![bound.volume()];
    for sharpness in [50.0, 200.0, 800.0] {
        // Draw from the current bound, as the sequential scheme does.
        let (lo, hi) = bound.interval(0);
        let u = DMatrix::from_fn(n, 1, |_, _| lo + rng.random::<f64>() * (hi - lo));
        let ratios = DVector::from_fn(n, |i, _| {
            let d: f64 = u[(i, 0)] - 0.5;
            -sharpness * d * d
        });
        let mut logratios = BTreeMap::new();
        logratios.insert(marginal.clone(), ratios);
        bound = truncate_bound_default(&u, &logratios, &bound).expect("extraction");
        volumes.push(bound.volume());
    }

    for pair in volumes.windows(2) {
        assert!(pair[1] <= pair[0], "volumes must nest: {volumes:?}");
    }
    assert!(volumes.last().expect("non-empty") < &0.4);
}

#[test]
fn flat_ratios_barely_truncate() {
    // Indistinguishable ratios keep essentially every sample.
    let n = 300;
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
    let u = DMatrix::from_fn(n, 1, |_, _| rng.random::<f64>());
    let ratios = DVector::from_fn(n, |_, _| 0.0);

    let mut logratios = BTreeMap::new();
    logratios.insert(Marginal::new(vec![0]).expect("valid"), ratios);
    let bound =
        truncate_bound_default(&u, &logratios, &Bound::unit_cube(1)).expect("extraction");
    assert!(bound.volume() > 0.95);
}

#[test]
fn degenerate_inputs_fail_loudly() {
    let u = DMatrix::from_row_slice(3, 1, &[0.1, 0.5, 0.9]);
    let marginal = Marginal::new(vec![0]).expect("valid");

    // All-(-inf) ratios carry no information.
    let mut logratios = BTreeMap::new();
    logratios.insert(marginal.clone(), DVector::from_element(3, f64::NEG_INFINITY));
    let err = truncate_bound_default(&u, &logratios, &Bound::unit_cube(1)).unwrap_err();
    assert!(matches!(err, Error::DegenerateBound { .. }));

    // Out-of-range thresholds are configuration errors.
    let mut logratios = BTreeMap::new();
    logratios.insert(marginal, DVector::zeros(3));
    let err = truncate_bound(&u, &logratios, 2.0, &Bound::unit_cube(1)).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));

    // No samples at all.
    let empty = DMatrix::zeros(0, 1);
    let err = truncate_bound_default(&empty, &BTreeMap::new(), &Bound::unit_cube(1)).unwrap_err();
    assert!(matches!(err, Error::DegenerateBound { .. }));
}

#[test]
fn driver_converges_on_a_sharp_likelihood() {
    // The simulator observes the first parameter with small noise, so the
    // informative dimension shrinks quickly while the nuisance dimension
    // stays wide.
    let prior = Prior::uniform(vec![-5.0, -5.0], vec![5.0, 5.0]).expect("valid prior");
    let marginals = MarginalIndex::new(vec![0, 1]).expect("valid index");
    let options = TruncationOptions::quick()
        .simulations_per_round(400)
        .bound_samples(400)
        .max_rounds(4)
        .seed(12);
    let driver = TruncationDriver::new(prior, marginals, 1, options).expect("valid driver");

    let mut noise_rng = Xoshiro256PlusPlus::seed_from_u64(19);
    let mut simulator = move |v: &DMatrix<f64>| {
        let x = DMatrix::from_fn(v.nrows(), 1, |r, _| {
            let noise: f64 = noise_rng.random::<f64>() + noise_rng.random::<f64>() - 1.0;
            v[(r, 0)] + 0.25 * noise
        });
        ObservationBatch::single("x", x).map_err(|e| e.to_string())
    };

    let observation = Observation::single("x", DVector::from_vec(vec![2.0]));
    let outcome = driver.run(&observation, &mut simulator).expect("run");

    assert!(matches!(
        outcome.status,
        TruncationStatus::Converged | TruncationStatus::MaxRounds
    ));
    assert!(outcome.bound().volume() < 1.0);

    // Truth at v0 = 2.0, cube coordinate 0.7.
    let (lo, hi) = outcome.bound().interval(0);
    assert!(lo < 0.7 && hi > 0.7, "final bound [{lo}, {hi}] excludes the truth");
    // The informative dimension shrank more than the nuisance one.
    let (nlo, nhi) = outcome.bound().interval(1);
    assert!(hi - lo < nhi - nlo);
}

#[test]
fn driver_round_records_are_consistent() {
    let prior = Prior::uniform(vec![-5.0], vec![5.0]).expect("valid prior");
    let marginals = MarginalIndex::new(0).expect("valid index");
    let options = TruncationOptions::quick().seed(4);
    let driver = TruncationDriver::new(prior, marginals, 1, options).expect("valid driver");

    let mut noise_rng = Xoshiro256PlusPlus::seed_from_u64(2);
    let mut simulator = move |v: &DMatrix<f64>| {
        let x = DMatrix::from_fn(v.nrows(), 1, |r, _| {
            v[(r, 0)] + 0.3 * (noise_rng.random::<f64>() - 0.5)
        });
        ObservationBatch::single("x", x).map_err(|e| e.to_string())
    };

    let observation = Observation::single("x", DVector::from_vec(vec![0.0]));
    let outcome = driver.run(&observation, &mut simulator).expect("run");

    for (i, round) in outcome.rounds.iter().enumerate() {
        assert_eq!(round.index, i);
        assert_eq!(round.n_simulations, 300);
        assert!(round.n_training >= 2);
        assert!(round.volume > 0.0 && round.volume <= 1.0);
    }
    assert_eq!(
        outcome.dataset.len(),
        outcome.rounds.len() * 300,
        "every round's simulations accumulate"
    );
}
