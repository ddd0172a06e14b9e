//! # tmnre
//!
//! Truncated marginal neural ratio estimation for simulation-based
//! Bayesian inference.
//!
//! Given a stochastic simulator with no tractable likelihood, this crate
//! estimates marginal posteriors over chosen parameter subsets by training
//! one small classifier per marginal to separate jointly simulated
//! (observation, parameter) pairs from scrambled ones. The classifier's
//! logit approximates the log likelihood-to-evidence ratio, which combined
//! with the prior gives:
//! - per-marginal posterior log-densities,
//! - importance-weighted and resampled posterior draws,
//! - truncation bounds that focus further simulation on the relevant
//!   region of parameter space.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tmnre::{
//!     MarginalIndex, Observation, Prior, TruncationDriver, TruncationOptions,
//! };
//!
//! // A uniform prior over two parameters; the simulator observes the
//! // first one with noise.
//! let prior = Prior::uniform(vec![-5.0, -5.0], vec![5.0, 5.0])?;
//! let marginals = MarginalIndex::new(vec![0, 1])?;
//! let driver = TruncationDriver::new(prior, marginals, 1, TruncationOptions::new())?;
//!
//! let outcome = driver.run(&target_observation, &mut my_simulator)?;
//! let samples = outcome.posterior.sample(1000, &target_observation, &mut rng)?;
//! ```
//!
//! One-shot (non-sequential) inference skips the driver: build a
//! [`Posteriors`] collection over a prior, `add` marginals, `train` on a
//! [`Dataset`] of simulations, then `sample` or `truncate` by hand.
//!
//! ## Determinism
//!
//! Sampling methods take a caller-supplied [`rand::Rng`]; training and the
//! driver derive all internal randomness from explicit seeds in their
//! option structs. There is no process-wide mutable state.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
mod constants;
mod error;
mod types;

// Functional modules
pub mod bound;
pub mod dataset;
pub mod driver;
pub mod marginal;
pub mod network;
pub mod posterior;
pub mod prior;
pub mod ratio;
pub mod samples;
pub mod train;

// Re-exports for public API
pub use bound::{truncate_bound, truncate_bound_default, Bound, CompositeBound, RectangleBound};
pub use constants::{DEFAULT_RATIO_THRESHOLD, DEFAULT_SEED};
pub use dataset::Dataset;
pub use driver::{
    TruncationDriver, TruncationOptions, TruncationOutcome, TruncationRound, TruncationStatus,
};
pub use error::{Error, Result};
pub use marginal::{Marginal, MarginalIndex, MarginalSpec};
pub use network::{Classifier, MlpNetwork, NetworkState};
pub use posterior::{MarginalPosterior, Posteriors, PosteriorsState};
pub use prior::{Prior, PriorFamily, PriorTruncator};
pub use ratio::{MarginalRatioEstimator, RatioEstimatorState};
pub use samples::{LogRatioSamples, PosteriorSamples, WeightedSamples};
pub use train::{TrainDiagnostics, TrainOptions};
pub use types::{Observation, ObservationBatch, Simulator};
