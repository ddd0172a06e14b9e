//! Full workflow on a tractable linear-Gaussian problem.
//!
//! The simulator observes the first of two parameters with unit Gaussian
//! noise under a uniform prior over `[-5, 5]^2`, so the first marginal
//! posterior is (nearly) a unit normal centered on the observed value and
//! the second parameter is pure nuisance.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use rand_xoshiro::Xoshiro256PlusPlus;

use tmnre::{
    Dataset, Marginal, MarginalIndex, Observation, ObservationBatch, Posteriors, Prior,
    TrainOptions,
};

const OBSERVED: f64 = 1.0;

fn gaussian_simulator(
    seed: u64,
) -> impl FnMut(&DMatrix<f64>) -> Result<ObservationBatch, String> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let noise = Normal::new(0.0, 1.0).expect("valid normal");
    move |v: &DMatrix<f64>| {
        let x = DMatrix::from_fn(v.nrows(), 1, |r, _| v[(r, 0)] + noise.sample(&mut rng));
        ObservationBatch::single("x", x).map_err(|e| e.to_string())
    }
}

fn simulate_dataset(n: usize, seed: u64) -> Dataset {
    let prior = Prior::uniform(vec![-5.0, -5.0], vec![5.0, 5.0]).expect("valid prior");
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let mut dataset = Dataset::new(2).expect("valid dataset");
    let u = DMatrix::from_fn(n, 2, |_, _| rng.random::<f64>());
    let v = prior.transform(&u);
    dataset.append_pending(u, v).expect("append");
    dataset
        .simulate_missing(&mut gaussian_simulator(seed.wrapping_add(1)))
        .expect("simulate");
    dataset
}

#[test]
fn posterior_recovers_the_analytic_mean() {
    let prior = Prior::uniform(vec![-5.0, -5.0], vec![5.0, 5.0]).expect("valid prior");
    let mut posteriors = Posteriors::new(prior);
    let index = MarginalIndex::new(vec![vec![0], vec![1], vec![0, 1]]).expect("valid index");
    posteriors.add(&index, 1, 0).expect("add estimator");

    let dataset = simulate_dataset(1000, 100);
    posteriors
        .train(&index, &dataset, &TrainOptions::new().seed(2))
        .expect("training");

    let observation = Observation::single("x", DVector::from_vec(vec![OBSERVED]));
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(55);
    let samples = posteriors
        .sample(500, &observation, &mut rng)
        .expect("sample");

    // Informative marginal: mean near the observed value, spread near the
    // unit noise scale. The classifier adds its own error on top of the
    // Monte-Carlo standard error, hence the loose tolerances.
    let informative = Marginal::new(vec![0]).expect("valid");
    let mean = samples.mean(&informative).expect("mean");
    let sd = samples.std_dev(&informative).expect("sd");
    assert!(
        (mean[0] - OBSERVED).abs() < 0.6,
        "posterior mean {} too far from {OBSERVED}",
        mean[0]
    );
    assert!(
        sd[0] > 0.5 && sd[0] < 2.5,
        "posterior spread {} inconsistent with unit noise",
        sd[0]
    );

    // Nuisance marginal: the posterior should stay close to the prior,
    // whose standard deviation is 10/sqrt(12) = 2.89.
    let nuisance = Marginal::new(vec![1]).expect("valid");
    let nuisance_sd = samples.std_dev(&nuisance).expect("sd");
    assert!(
        nuisance_sd[0] > 1.5,
        "nuisance spread {} collapsed",
        nuisance_sd[0]
    );

    // Joint marginal keeps both dimensions.
    let joint = Marginal::new(vec![0, 1]).expect("valid");
    let draws = samples.get(&joint).expect("joint draws");
    assert_eq!(draws.ncols(), 2);
    assert_eq!(draws.nrows(), 500);
}

#[test]
fn truncation_then_retraining_sharpens_the_posterior() {
    let prior = Prior::uniform(vec![-5.0, -5.0], vec![5.0, 5.0]).expect("valid prior");
    let mut posteriors = Posteriors::new(prior);
    let index = MarginalIndex::new(vec![0, 1]).expect("valid index");
    posteriors.add(&index, 1, 7).expect("add estimator");

    let dataset = simulate_dataset(800, 200);
    posteriors
        .train(&index, &dataset, &TrainOptions::new().seed(9))
        .expect("training");

    let observation = Observation::single("x", DVector::from_vec(vec![OBSERVED]));
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(77);
    let bound = posteriors
        .truncate_default(&observation, 1000, &mut rng)
        .expect("truncate");

    // The informative dimension shrinks; the observed value stays inside.
    let (lo, hi) = bound.interval(0);
    let observed_u = (OBSERVED + 5.0) / 10.0;
    assert!(hi - lo < 1.0);
    assert!(lo < observed_u && hi > observed_u);
    assert!(bound.volume() < 1.0);

    // Round two: fresh simulations concentrated inside the bound.
    posteriors.set_bound(bound.clone()).expect("set bound");
    let mut round_two = Dataset::new(2).expect("valid dataset");
    let (u, v) = posteriors
        .truncator()
        .sample_with_u(800, &mut rng)
        .expect("sample");
    round_two.append_pending(u, v).expect("append");
    round_two
        .simulate_missing(&mut gaussian_simulator(300))
        .expect("simulate");
    posteriors
        .train(&index, &round_two, &TrainOptions::new().seed(10))
        .expect("retraining");

    let samples = posteriors
        .sample(500, &observation, &mut rng)
        .expect("sample");
    let informative = Marginal::new(vec![0]).expect("valid");
    let mean = samples.mean(&informative).expect("mean");
    assert!(
        (mean[0] - OBSERVED).abs() < 0.6,
        "post-truncation mean {} drifted from {OBSERVED}",
        mean[0]
    );

    // Every draw respects the truncation bound.
    let draws = samples.get(&informative).expect("draws");
    for &x in draws.iter() {
        let u0 = (x + 5.0) / 10.0;
        assert!(u0 >= lo && u0 <= hi);
    }
}
