//! Sequential truncation rounds.
//!
//! Each round draws parameters from the current truncated prior, simulates
//! them, trains a fresh ratio estimator on every in-bound pair collected so
//! far, and extracts a tighter bound from the new estimator's log-ratios.
//! Rounds stop when the bound volume stops shrinking, when the round limit
//! is reached, or when extraction stalls for too long.

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::bound::Bound;
use crate::constants::{DEFAULT_RATIO_THRESHOLD, DEFAULT_SEED};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::marginal::MarginalIndex;
use crate::network::MlpNetwork;
use crate::posterior::MarginalPosterior;
use crate::prior::{Prior, PriorTruncator};
use crate::ratio::MarginalRatioEstimator;
use crate::train::TrainOptions;
use crate::types::{Observation, Simulator};

/// Options for the sequential truncation loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncationOptions {
    /// New simulations drawn per round.
    pub simulations_per_round: usize,

    /// Fresh truncated-prior draws used for bound extraction.
    pub bound_samples: usize,

    /// Hard cap on rounds.
    pub max_rounds: usize,

    /// Relative volume shrinkage below which a round counts as converged.
    ///
    /// A round with `1 - new_volume / old_volume < tolerance` stops the
    /// loop with [`TruncationStatus::Converged`].
    pub convergence_tolerance: f64,

    /// Consecutive stalled rounds tolerated before giving up.
    pub grace_rounds: usize,

    /// Log-ratio threshold for rectangle extraction.
    pub ratio_threshold: f64,

    /// Per-round classifier training options.
    pub train: TrainOptions,

    /// Seed for sampling, simulation ordering, and network init.
    pub seed: u64,
}

impl Default for TruncationOptions {
    fn default() -> Self {
        Self {
            simulations_per_round: 1000,
            bound_samples: 1000,
            max_rounds: 10,
            convergence_tolerance: 0.1,
            grace_rounds: 3,
            ratio_threshold: DEFAULT_RATIO_THRESHOLD,
            train: TrainOptions::default(),
            seed: DEFAULT_SEED,
        }
    }
}

impl TruncationOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// A small configuration for tests and smoke runs.
    pub fn quick() -> Self {
        Self {
            simulations_per_round: 300,
            bound_samples: 300,
            max_rounds: 3,
            train: TrainOptions::quick(),
            ..Self::default()
        }
    }

    /// Set the simulations drawn per round.
    pub fn simulations_per_round(mut self, n: usize) -> Self {
        assert!(n > 1, "simulations_per_round must exceed one");
        self.simulations_per_round = n;
        self
    }

    /// Set the draws used for bound extraction.
    pub fn bound_samples(mut self, n: usize) -> Self {
        assert!(n > 0, "bound_samples must be positive");
        self.bound_samples = n;
        self
    }

    /// Set the round limit.
    pub fn max_rounds(mut self, n: usize) -> Self {
        assert!(n > 0, "max_rounds must be positive");
        self.max_rounds = n;
        self
    }

    /// Set the convergence tolerance.
    pub fn convergence_tolerance(mut self, tolerance: f64) -> Self {
        assert!(
            tolerance > 0.0 && tolerance < 1.0,
            "convergence_tolerance must be in (0, 1)"
        );
        self.convergence_tolerance = tolerance;
        self
    }

    /// Set the stalled-round grace window.
    pub fn grace_rounds(mut self, n: usize) -> Self {
        assert!(n > 0, "grace_rounds must be positive");
        self.grace_rounds = n;
        self
    }

    /// Set the rectangle-extraction threshold.
    pub fn ratio_threshold(mut self, threshold: f64) -> Self {
        assert!(
            threshold > 0.0 && threshold < 1.0,
            "ratio_threshold must be in (0, 1)"
        );
        self.ratio_threshold = threshold;
        self
    }

    /// Set the per-round training options.
    pub fn train(mut self, options: TrainOptions) -> Self {
        self.train = options;
        self
    }

    /// Set the driver seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Check the option set as a whole.
    pub fn validate(&self) -> Result<()> {
        if self.simulations_per_round < 2 {
            return Err(Error::Configuration {
                parameter: "simulations_per_round".to_string(),
                reason: "must exceed one".to_string(),
            });
        }
        if self.bound_samples == 0 {
            return Err(Error::Configuration {
                parameter: "bound_samples".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_rounds == 0 {
            return Err(Error::Configuration {
                parameter: "max_rounds".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(self.convergence_tolerance > 0.0 && self.convergence_tolerance < 1.0) {
            return Err(Error::Configuration {
                parameter: "convergence_tolerance".to_string(),
                reason: "must be in (0, 1)".to_string(),
            });
        }
        if self.grace_rounds == 0 {
            return Err(Error::Configuration {
                parameter: "grace_rounds".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(self.ratio_threshold > 0.0 && self.ratio_threshold < 1.0) {
            return Err(Error::Configuration {
                parameter: "ratio_threshold".to_string(),
                reason: "must be in (0, 1)".to_string(),
            });
        }
        self.train.validate()
    }
}

/// Why the truncation loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TruncationStatus {
    /// Volume shrinkage fell below the tolerance.
    Converged,
    /// The round limit was reached while still shrinking.
    MaxRounds,
    /// Bound extraction stalled for the whole grace window.
    NotConverging,
}

/// Summary of one completed round.
#[derive(Debug, Clone, PartialEq)]
pub struct TruncationRound {
    /// Zero-based round index.
    pub index: usize,
    /// New simulations drawn this round.
    pub n_simulations: usize,
    /// In-bound pairs the round's estimator trained on.
    pub n_training: usize,
    /// Bound volume after the round.
    pub volume: f64,
}

/// Result of a truncation run.
#[derive(Debug, Clone)]
pub struct TruncationOutcome {
    /// Why the loop stopped.
    pub status: TruncationStatus,
    /// The last trained estimator paired with the final bound.
    pub posterior: MarginalPosterior<MlpNetwork>,
    /// Every simulated pair accumulated across rounds.
    pub dataset: Dataset,
    /// Per-round summaries, in order.
    pub rounds: Vec<TruncationRound>,
}

impl TruncationOutcome {
    /// The final bound.
    pub fn bound(&self) -> &Bound {
        self.posterior.bound()
    }

    /// Bound volume after each round.
    pub fn volume_history(&self) -> Vec<f64> {
        self.rounds.iter().map(|r| r.volume).collect()
    }
}

/// Runs sequential simulate-train-truncate rounds for a fixed target
/// observation.
#[derive(Debug, Clone)]
pub struct TruncationDriver {
    prior: Prior,
    marginals: MarginalIndex,
    obs_len: usize,
    options: TruncationOptions,
}

impl TruncationDriver {
    /// Create a driver for the given prior and marginals.
    ///
    /// `obs_len` is the flattened length of the simulator's observations.
    pub fn new(
        prior: Prior,
        marginals: MarginalIndex,
        obs_len: usize,
        options: TruncationOptions,
    ) -> Result<Self> {
        options.validate()?;
        marginals.validate_against(prior.n_parameters())?;
        if obs_len == 0 {
            return Err(Error::Configuration {
                parameter: "obs_len".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(Self {
            prior,
            marginals,
            obs_len,
            options,
        })
    }

    /// Run the loop against one target observation.
    ///
    /// Each round appends fresh simulations to the cumulative dataset and
    /// trains a fresh estimator on the pairs inside the current bound, so
    /// earlier rounds' simulations keep contributing once the bound has
    /// shrunk around them.
    pub fn run(
        &self,
        observation: &Observation,
        simulator: &mut impl Simulator,
    ) -> Result<TruncationOutcome> {
        if observation.flat_len() != self.obs_len {
            return Err(Error::Configuration {
                parameter: "observation".to_string(),
                reason: format!(
                    "observation flattens to {} features, driver expects {}",
                    observation.flat_len(),
                    self.obs_len
                ),
            });
        }

        let d = self.prior.n_parameters();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(self.options.seed);
        let mut dataset = Dataset::new(d)?;
        let mut bound = Bound::unit_cube(d);
        let mut rounds = Vec::new();
        let mut stalled = 0usize;
        let mut status = TruncationStatus::MaxRounds;
        let mut posterior: Option<MarginalPosterior<MlpNetwork>> = None;

        for round in 0..self.options.max_rounds {
            let truncator = PriorTruncator::new(self.prior.clone(), bound.clone())?;
            let (u, v) =
                truncator.sample_with_u(self.options.simulations_per_round, &mut rng)?;
            dataset.append_pending(u, v)?;
            dataset.simulate_missing(simulator)?;

            let in_bound = dataset.filtered(&bound)?;
            let round_seed = self.options.seed.wrapping_add(round as u64);
            let mut estimator =
                MarginalRatioEstimator::new(self.marginals.clone(), d, self.obs_len, round_seed)?;
            estimator.train(&in_bound, &self.options.train.clone().seed(round_seed))?;

            let round_posterior =
                MarginalPosterior::with_truncator(estimator, truncator)?;
            let old_volume = bound.volume();
            let extracted = round_posterior.truncate(
                observation,
                self.options.bound_samples,
                self.options.ratio_threshold,
                &mut rng,
            );

            match extracted {
                Ok(new_bound) => {
                    let volume = new_bound.volume();
                    let shrinkage = 1.0 - volume / old_volume;
                    tracing::info!(
                        round,
                        volume,
                        shrinkage,
                        n_training = in_bound.len(),
                        "completed truncation round"
                    );
                    rounds.push(TruncationRound {
                        index: round,
                        n_simulations: self.options.simulations_per_round,
                        n_training: in_bound.len(),
                        volume,
                    });
                    posterior = Some(round_posterior.with_bound(new_bound.clone())?);
                    bound = new_bound;
                    stalled = 0;
                    if shrinkage < self.options.convergence_tolerance {
                        status = TruncationStatus::Converged;
                        break;
                    }
                }
                Err(Error::DegenerateBound { reason }) => {
                    // A bad extraction round keeps the old bound; more
                    // simulations next round may recover.
                    stalled += 1;
                    tracing::warn!(round, stalled, %reason, "bound extraction stalled");
                    rounds.push(TruncationRound {
                        index: round,
                        n_simulations: self.options.simulations_per_round,
                        n_training: in_bound.len(),
                        volume: old_volume,
                    });
                    posterior = Some(round_posterior);
                    if stalled >= self.options.grace_rounds {
                        status = TruncationStatus::NotConverging;
                        break;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        let posterior = posterior.ok_or_else(|| Error::Configuration {
            parameter: "max_rounds".to_string(),
            reason: "no truncation round completed".to_string(),
        })?;
        Ok(TruncationOutcome {
            status,
            posterior,
            dataset,
            rounds,
        })
    }
}
