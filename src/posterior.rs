//! Marginal posteriors and the estimator collection.
//!
//! A [`MarginalPosterior`] combines one ratio estimator with a truncated
//! prior: log-densities add the estimated log-ratio to the restricted
//! prior density, sampling importance-weights truncated-prior draws, and
//! truncation extracts a tighter bound from fresh evaluations.
//!
//! [`Posteriors`] manages several estimators over one shared truncator and
//! handles persistence of the whole inference state.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::bound::{truncate_bound, Bound, MarginalLogRatios};
use crate::constants::{DEFAULT_EVAL_BATCH, DEFAULT_RATIO_THRESHOLD};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::marginal::{Marginal, MarginalIndex, MarginalSpec};
use crate::network::{Classifier, MlpNetwork};
use crate::prior::{Prior, PriorTruncator};
use crate::ratio::{MarginalRatioEstimator, RatioEstimatorState};
use crate::samples::{default_names, PosteriorSamples, WeightedSamples};
use crate::train::{TrainDiagnostics, TrainOptions};
use crate::types::Observation;

/// One ratio estimator paired with a truncated prior.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginalPosterior<C: Classifier = MlpNetwork> {
    estimator: MarginalRatioEstimator<C>,
    truncator: PriorTruncator,
}

impl<C: Classifier> MarginalPosterior<C> {
    /// Pair an estimator with an untruncated prior.
    pub fn new(estimator: MarginalRatioEstimator<C>, prior: Prior) -> Result<Self> {
        Self::with_truncator(estimator, PriorTruncator::untruncated(prior))
    }

    /// Pair an estimator with an explicit prior truncator.
    pub fn with_truncator(
        estimator: MarginalRatioEstimator<C>,
        truncator: PriorTruncator,
    ) -> Result<Self> {
        if estimator.n_parameters() != truncator.n_parameters() {
            return Err(Error::Configuration {
                parameter: "truncator".to_string(),
                reason: format!(
                    "prior covers {} parameters, estimator expects {}",
                    truncator.n_parameters(),
                    estimator.n_parameters()
                ),
            });
        }
        Ok(Self {
            estimator,
            truncator,
        })
    }

    /// Replace the default `v0, v1, ...` display names.
    pub fn with_parameter_names(mut self, names: Vec<String>) -> Result<Self> {
        self.estimator.set_parameter_names(names)?;
        Ok(self)
    }

    /// The underlying estimator.
    pub fn estimator(&self) -> &MarginalRatioEstimator<C> {
        &self.estimator
    }

    /// Mutable access for training.
    pub fn estimator_mut(&mut self) -> &mut MarginalRatioEstimator<C> {
        &mut self.estimator
    }

    /// The active prior truncator.
    pub fn truncator(&self) -> &PriorTruncator {
        &self.truncator
    }

    /// The active truncation bound.
    pub fn bound(&self) -> &Bound {
        self.truncator.bound()
    }

    /// Display names for the full parameter vector.
    pub fn parameter_names(&self) -> &[String] {
        self.estimator.parameter_names()
    }

    /// The same posterior restricted to a different bound.
    pub fn with_bound(&self, bound: Bound) -> Result<Self>
    where
        C: Clone,
    {
        let truncator = PriorTruncator::new(self.truncator.prior().clone(), bound)?;
        Ok(Self {
            estimator: self.estimator.clone(),
            truncator,
        })
    }

    /// Unnormalized-posterior log-density per marginal.
    ///
    /// For each marginal this is the estimated log-ratio plus the truncated
    /// marginal prior density: the prior restricted to the marginal's
    /// dimensions, renormalized by the bound's restricted volume, `-inf`
    /// outside the bound. One value per row of `v` for every marginal.
    pub fn log_prob(
        &self,
        observation: &Observation,
        v: &DMatrix<f64>,
    ) -> Result<BTreeMap<Marginal, DVector<f64>>> {
        self.log_prob_batched(observation, v, DEFAULT_EVAL_BATCH)
    }

    /// [`log_prob`](Self::log_prob) with an explicit evaluation batch size.
    pub fn log_prob_batched(
        &self,
        observation: &Observation,
        v: &DMatrix<f64>,
        batch_size: usize,
    ) -> Result<BTreeMap<Marginal, DVector<f64>>> {
        let ratios = self.estimator.log_ratios_batched(observation, v, batch_size)?;
        let u = self.truncator.prior().cdf(v);
        let bound = self.truncator.bound();

        let mut out = BTreeMap::new();
        for (marginal, samples) in ratios {
            let dims = marginal.indices();
            let v_sub = DMatrix::from_fn(v.nrows(), dims.len(), |r, c| v[(r, dims[c])]);
            let prior_lp = self.truncator.prior().log_prob_dims(&v_sub, dims);
            let log_restricted = bound.restricted_volume(dims).ln();

            let values = DVector::from_fn(v.nrows(), |row, _| {
                let inside = dims.iter().all(|&d| {
                    let (lo, hi) = bound.interval(d);
                    u[(row, d)] >= lo && u[(row, d)] <= hi
                });
                if inside {
                    samples.logratios[row] + prior_lp[row] - log_restricted
                } else {
                    f64::NEG_INFINITY
                }
            });
            out.insert(marginal, values);
        }
        Ok(out)
    }

    /// Draw from the truncated prior and weight each draw per marginal.
    pub fn weighted_sample<R: Rng>(
        &self,
        n: usize,
        observation: &Observation,
        rng: &mut R,
    ) -> Result<WeightedSamples> {
        self.weighted_sample_batched(n, observation, DEFAULT_EVAL_BATCH, rng)
    }

    /// [`weighted_sample`](Self::weighted_sample) with an explicit
    /// evaluation batch size.
    pub fn weighted_sample_batched<R: Rng>(
        &self,
        n: usize,
        observation: &Observation,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<WeightedSamples> {
        let v = self.truncator.sample(n, rng)?;
        let ratios = self.estimator.log_ratios_batched(observation, &v, batch_size)?;
        let weights = ratios
            .into_iter()
            .map(|(marginal, samples)| (marginal, samples.weights()))
            .collect();
        Ok(WeightedSamples {
            v,
            weights,
            parameter_names: self.estimator.parameter_names().to_vec(),
        })
    }

    /// Equally weighted posterior draws per marginal, alongside the raw
    /// truncated-prior draws they were resampled from.
    pub fn sample<R: Rng>(
        &self,
        n: usize,
        observation: &Observation,
        rng: &mut R,
    ) -> Result<PosteriorSamples> {
        self.sample_batched(n, observation, DEFAULT_EVAL_BATCH, rng)
    }

    /// [`sample`](Self::sample) with an explicit evaluation batch size.
    pub fn sample_batched<R: Rng>(
        &self,
        n: usize,
        observation: &Observation,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<PosteriorSamples> {
        let weighted = self.weighted_sample_batched(n, observation, batch_size, rng)?;
        let mut samples = BTreeMap::new();
        for marginal in weighted.weights.keys() {
            samples.insert(marginal.clone(), weighted.resample(marginal, n, rng)?);
        }
        Ok(PosteriorSamples {
            v: weighted.v,
            samples,
            parameter_names: weighted.parameter_names,
        })
    }

    /// Extract a tighter bound from fresh truncated-prior evaluations.
    pub fn truncate<R: Rng>(
        &self,
        observation: &Observation,
        n_samples: usize,
        threshold: f64,
        rng: &mut R,
    ) -> Result<Bound> {
        if !self.estimator.supports_rectangle_extraction() {
            return Err(Error::UnsupportedOperation {
                operation: "truncate".to_string(),
                reason: "a classifier in this estimator does not support rectangle extraction"
                    .to_string(),
            });
        }
        let (u, v) = self.truncator.sample_with_u(n_samples, rng)?;
        let ratios = self.estimator.log_ratios(observation, &v)?;
        let logratios: MarginalLogRatios = ratios
            .into_iter()
            .map(|(marginal, samples)| (marginal, samples.logratios))
            .collect();
        truncate_bound(&u, &logratios, threshold, self.truncator.bound())
    }
}

/// Serializable snapshot of a [`Posteriors`] collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorsState {
    /// The shared prior.
    pub prior: Prior,
    /// The shared truncation bound.
    pub bound: Bound,
    /// Display names for the full parameter vector.
    pub parameter_names: Vec<String>,
    /// Every registered estimator, keyed by its marginal index.
    pub estimators: Vec<RatioEstimatorState>,
}

/// Several ratio estimators over one shared prior truncator.
#[derive(Debug, Clone, PartialEq)]
pub struct Posteriors<C: Classifier = MlpNetwork> {
    truncator: PriorTruncator,
    estimators: BTreeMap<MarginalIndex, MarginalRatioEstimator<C>>,
    parameter_names: Vec<String>,
}

impl<C: Classifier> Posteriors<C> {
    /// Start a collection over an untruncated prior.
    pub fn new(prior: Prior) -> Self {
        let parameter_names = default_names(prior.n_parameters());
        Self {
            truncator: PriorTruncator::untruncated(prior),
            estimators: BTreeMap::new(),
            parameter_names,
        }
    }

    /// Replace the default `v0, v1, ...` display names.
    pub fn with_parameter_names(mut self, names: Vec<String>) -> Result<Self> {
        if names.len() != self.truncator.n_parameters() {
            return Err(Error::Configuration {
                parameter: "parameter_names".to_string(),
                reason: format!(
                    "{} names for {} parameters",
                    names.len(),
                    self.truncator.n_parameters()
                ),
            });
        }
        for estimator in self.estimators.values_mut() {
            estimator.set_parameter_names(names.clone())?;
        }
        self.parameter_names = names;
        Ok(self)
    }

    /// The shared prior truncator.
    pub fn truncator(&self) -> &PriorTruncator {
        &self.truncator
    }

    /// The marginal indices with registered estimators.
    pub fn marginal_indices(&self) -> impl Iterator<Item = &MarginalIndex> {
        self.estimators.keys()
    }

    /// A registered estimator.
    pub fn estimator(&self, index: &MarginalIndex) -> Option<&MarginalRatioEstimator<C>> {
        self.estimators.get(index)
    }

    /// Register a caller-built estimator under its marginal index.
    ///
    /// The collection's parameter names take precedence over whatever the
    /// estimator carried.
    pub fn add_estimator(&mut self, mut estimator: MarginalRatioEstimator<C>) -> Result<()> {
        if estimator.n_parameters() != self.truncator.n_parameters() {
            return Err(Error::Configuration {
                parameter: "estimator".to_string(),
                reason: format!(
                    "estimator covers {} parameters, prior has {}",
                    estimator.n_parameters(),
                    self.truncator.n_parameters()
                ),
            });
        }
        estimator.set_parameter_names(self.parameter_names.clone())?;
        self.estimators
            .insert(estimator.marginals().clone(), estimator);
        Ok(())
    }

    /// Restrict the shared prior to a new bound.
    pub fn set_bound(&mut self, bound: Bound) -> Result<()> {
        self.truncator = PriorTruncator::new(self.truncator.prior().clone(), bound)?;
        Ok(())
    }

    /// Train the estimator registered under `index`.
    pub fn train(
        &mut self,
        index: &MarginalIndex,
        dataset: &Dataset,
        options: &TrainOptions,
    ) -> Result<&BTreeMap<Marginal, TrainDiagnostics>>
    where
        C: Clone,
    {
        let estimator = self.estimators.get_mut(index).ok_or_else(|| {
            Error::InvalidMarginal {
                reason: format!("no estimator registered for {index}"),
            }
        })?;
        estimator.train(dataset, options)
    }

    /// Train every registered estimator on the same dataset.
    pub fn train_all(&mut self, dataset: &Dataset, options: &TrainOptions) -> Result<()>
    where
        C: Clone,
    {
        for estimator in self.estimators.values_mut() {
            estimator.train(dataset, options)?;
        }
        Ok(())
    }

    /// Diagnostics from the last training run of one estimator.
    pub fn train_diagnostics(
        &self,
        index: &MarginalIndex,
    ) -> Option<&BTreeMap<Marginal, TrainDiagnostics>> {
        self.estimators.get(index).map(|e| e.diagnostics())
    }

    /// The posterior view of one registered estimator.
    pub fn posterior(&self, index: &MarginalIndex) -> Result<MarginalPosterior<C>>
    where
        C: Clone,
    {
        let estimator = self.estimators.get(index).ok_or_else(|| {
            Error::InvalidMarginal {
                reason: format!("no estimator registered for {index}"),
            }
        })?;
        MarginalPosterior::with_truncator(estimator.clone(), self.truncator.clone())
    }

    /// Weighted draws covering every registered marginal.
    ///
    /// One shared set of truncated-prior draws is weighted by every
    /// estimator, so all marginals refer to the same `v` rows.
    pub fn weighted_sample<R: Rng>(
        &self,
        n: usize,
        observation: &Observation,
        rng: &mut R,
    ) -> Result<WeightedSamples> {
        let v = self.truncator.sample(n, rng)?;
        let mut weights = BTreeMap::new();
        for estimator in self.estimators.values() {
            for (marginal, samples) in estimator.log_ratios(observation, &v)? {
                weights.insert(marginal, samples.weights());
            }
        }
        Ok(WeightedSamples {
            v,
            weights,
            parameter_names: self.parameter_names.clone(),
        })
    }

    /// Equally weighted posterior draws covering every registered marginal,
    /// alongside the raw truncated-prior draws they were resampled from.
    pub fn sample<R: Rng>(
        &self,
        n: usize,
        observation: &Observation,
        rng: &mut R,
    ) -> Result<PosteriorSamples> {
        let weighted = self.weighted_sample(n, observation, rng)?;
        let mut samples = BTreeMap::new();
        for marginal in weighted.weights.keys() {
            samples.insert(marginal.clone(), weighted.resample(marginal, n, rng)?);
        }
        Ok(PosteriorSamples {
            v: weighted.v,
            samples,
            parameter_names: weighted.parameter_names,
        })
    }

    /// Extract a bound from the log-ratios of every registered estimator.
    pub fn truncate<R: Rng>(
        &self,
        observation: &Observation,
        n_samples: usize,
        threshold: f64,
        rng: &mut R,
    ) -> Result<Bound> {
        if self.estimators.is_empty() {
            return Err(Error::UnsupportedOperation {
                operation: "truncate".to_string(),
                reason: "no estimators registered".to_string(),
            });
        }
        if !self
            .estimators
            .values()
            .all(MarginalRatioEstimator::supports_rectangle_extraction)
        {
            return Err(Error::UnsupportedOperation {
                operation: "truncate".to_string(),
                reason: "a classifier in this collection does not support rectangle extraction"
                    .to_string(),
            });
        }
        let (u, v) = self.truncator.sample_with_u(n_samples, rng)?;
        let mut logratios: MarginalLogRatios = BTreeMap::new();
        for estimator in self.estimators.values() {
            for (marginal, samples) in estimator.log_ratios(observation, &v)? {
                logratios.insert(marginal, samples.logratios);
            }
        }
        truncate_bound(&u, &logratios, threshold, self.truncator.bound())
    }

    /// Truncate with the default ratio threshold.
    pub fn truncate_default<R: Rng>(
        &self,
        observation: &Observation,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<Bound> {
        self.truncate(observation, n_samples, DEFAULT_RATIO_THRESHOLD, rng)
    }

    /// Snapshot the full collection state.
    pub fn state_dict(&self) -> PosteriorsState {
        PosteriorsState {
            prior: self.truncator.prior().clone(),
            bound: self.truncator.bound().clone(),
            parameter_names: self.parameter_names.clone(),
            estimators: self
                .estimators
                .values()
                .map(MarginalRatioEstimator::state)
                .collect(),
        }
    }

    /// Rebuild a collection from a snapshot.
    pub fn from_state_dict(state: &PosteriorsState) -> Result<Self> {
        let truncator = PriorTruncator::new(state.prior.clone(), state.bound.clone())?;
        let mut estimators = BTreeMap::new();
        for estimator_state in &state.estimators {
            let estimator = MarginalRatioEstimator::<C>::from_state(estimator_state)?;
            estimators.insert(estimator.marginals().clone(), estimator);
        }
        let mut posteriors = Self {
            truncator,
            estimators,
            parameter_names: state.parameter_names.clone(),
        };
        if posteriors.parameter_names.len() != posteriors.truncator.n_parameters() {
            posteriors.parameter_names = default_names(posteriors.truncator.n_parameters());
        }
        Ok(posteriors)
    }

    /// Serialize the collection to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), &self.state_dict())?;
        tracing::info!(path = %path.as_ref().display(), "saved inference state");
        Ok(())
    }

    /// Deserialize a collection from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let state: PosteriorsState = serde_json::from_reader(BufReader::new(file))?;
        Self::from_state_dict(&state)
    }
}

impl Posteriors<MlpNetwork> {
    /// Register a default-network estimator for a marginal specification.
    pub fn add(&mut self, spec: impl Into<MarginalSpec>, obs_len: usize, seed: u64) -> Result<()> {
        let marginals = MarginalIndex::new(spec)?;
        let estimator = MarginalRatioEstimator::new(
            marginals,
            self.truncator.n_parameters(),
            obs_len,
            seed,
        )?;
        self.add_estimator(estimator)
    }
}
