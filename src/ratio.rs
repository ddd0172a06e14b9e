//! Marginal likelihood-to-evidence ratio estimation.
//!
//! One binary classifier per marginal group is trained to separate jointly
//! simulated (observation, parameter) pairs from pairs whose parameters
//! were scrambled across the batch. A trained classifier's logit estimates
//! `log p(x|v_marginal) / p(x)`, which is all the posterior machinery
//! downstream needs.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_EVAL_BATCH;
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::marginal::{Marginal, MarginalIndex};
use crate::network::{Classifier, MlpNetwork, NetworkState};
use crate::samples::{default_names, LogRatioSamples};
use crate::train::{TrainDiagnostics, TrainOptions};
use crate::types::Observation;

/// Serializable snapshot of a [`MarginalRatioEstimator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioEstimatorState {
    /// The estimated marginals, in canonical order.
    pub marginals: MarginalIndex,
    /// Full parameter dimensionality.
    pub n_parameters: usize,
    /// Flattened observation length.
    pub obs_len: usize,
    /// Whether the networks have been trained.
    pub trained: bool,
    /// One network snapshot per marginal, in canonical order.
    pub networks: Vec<NetworkState>,
    /// Training diagnostics from the last completed run.
    ///
    /// Serialized as a sequence of pairs: JSON map keys must be strings,
    /// and [`Marginal`] serializes as a list of indices.
    #[serde(with = "diagnostics_as_pairs")]
    pub diagnostics: BTreeMap<Marginal, TrainDiagnostics>,
    /// Display names for the full parameter vector.
    pub parameter_names: Vec<String>,
}

mod diagnostics_as_pairs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<Marginal, TrainDiagnostics>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(map.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<BTreeMap<Marginal, TrainDiagnostics>, D::Error> {
        let pairs = Vec::<(Marginal, TrainDiagnostics)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// A set of per-marginal ratio classifiers sharing one observation layout.
#[derive(Debug, Clone, PartialEq)]
pub struct MarginalRatioEstimator<C: Classifier = MlpNetwork> {
    marginals: MarginalIndex,
    n_parameters: usize,
    obs_len: usize,
    networks: Vec<C>,
    trained: bool,
    diagnostics: BTreeMap<Marginal, TrainDiagnostics>,
    parameter_names: Vec<String>,
}

impl MarginalRatioEstimator<MlpNetwork> {
    /// Create an estimator with a default network per marginal.
    ///
    /// Each network takes the flattened observation concatenated with the
    /// marginal's parameter values; initialization is deterministic in
    /// `seed`.
    pub fn new(
        marginals: MarginalIndex,
        n_parameters: usize,
        obs_len: usize,
        seed: u64,
    ) -> Result<Self> {
        marginals.validate_against(n_parameters)?;
        if obs_len == 0 {
            return Err(Error::Configuration {
                parameter: "obs_len".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let networks = marginals
            .iter()
            .enumerate()
            .map(|(i, marginal)| {
                MlpNetwork::with_defaults(obs_len + marginal.len(), seed.wrapping_add(i as u64))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            marginals,
            n_parameters,
            obs_len,
            networks,
            trained: false,
            diagnostics: BTreeMap::new(),
            parameter_names: default_names(n_parameters),
        })
    }
}

impl<C: Classifier> MarginalRatioEstimator<C> {
    /// Create an estimator around caller-supplied classifiers, one per
    /// marginal in canonical order.
    pub fn with_classifiers(
        marginals: MarginalIndex,
        n_parameters: usize,
        obs_len: usize,
        networks: Vec<C>,
    ) -> Result<Self> {
        marginals.validate_against(n_parameters)?;
        if networks.len() != marginals.len() {
            return Err(Error::Configuration {
                parameter: "networks".to_string(),
                reason: format!(
                    "{} classifiers for {} marginals",
                    networks.len(),
                    marginals.len()
                ),
            });
        }
        for (marginal, network) in marginals.iter().zip(&networks) {
            let expected = obs_len + marginal.len();
            if network.n_features() != expected {
                return Err(Error::Configuration {
                    parameter: "networks".to_string(),
                    reason: format!(
                        "marginal {marginal}: classifier takes {} features, expected {expected}",
                        network.n_features()
                    ),
                });
            }
        }
        Ok(Self {
            marginals,
            n_parameters,
            obs_len,
            networks,
            trained: false,
            diagnostics: BTreeMap::new(),
            parameter_names: default_names(n_parameters),
        })
    }

    /// The marginals this estimator covers.
    pub fn marginals(&self) -> &MarginalIndex {
        &self.marginals
    }

    /// Full parameter dimensionality.
    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    /// Flattened observation length expected by every classifier.
    pub fn obs_len(&self) -> usize {
        self.obs_len
    }

    /// Whether a training run has completed.
    pub fn is_trained(&self) -> bool {
        self.trained
    }

    /// Diagnostics from the last completed training run.
    pub fn diagnostics(&self) -> &BTreeMap<Marginal, TrainDiagnostics> {
        &self.diagnostics
    }

    /// Display names for the full parameter vector.
    pub fn parameter_names(&self) -> &[String] {
        &self.parameter_names
    }

    /// Replace the parameter display names.
    ///
    /// One name per parameter dimension, in order.
    pub fn set_parameter_names(&mut self, names: Vec<String>) -> Result<()> {
        if names.len() != self.n_parameters {
            return Err(Error::Configuration {
                parameter: "parameter_names".to_string(),
                reason: format!(
                    "{} names for {} parameters",
                    names.len(),
                    self.n_parameters
                ),
            });
        }
        self.parameter_names = names;
        Ok(())
    }

    /// Whether every classifier's logits support rectangle extraction.
    pub fn supports_rectangle_extraction(&self) -> bool {
        self.networks
            .iter()
            .all(Classifier::supports_rectangle_extraction)
    }

    /// Train every classifier on the dataset's completed pairs.
    ///
    /// Joint rows keep each observation with its own parameters (label 1);
    /// contrast rows pair it with another row's parameters via a seeded
    /// cyclic derangement (label 0). Training is atomic: classifiers are
    /// cloned, fitted, and committed only if every marginal succeeds, so a
    /// failure leaves the estimator unchanged.
    pub fn train(
        &mut self,
        dataset: &Dataset,
        options: &TrainOptions,
    ) -> Result<&BTreeMap<Marginal, TrainDiagnostics>>
    where
        C: Clone,
    {
        options.validate()?;
        if dataset.n_parameters() != self.n_parameters {
            return Err(Error::Configuration {
                parameter: "dataset".to_string(),
                reason: format!(
                    "dataset has {} parameters, estimator expects {}",
                    dataset.n_parameters(),
                    self.n_parameters
                ),
            });
        }
        let x = dataset.observation_matrix()?;
        if x.ncols() != self.obs_len {
            return Err(Error::Configuration {
                parameter: "dataset".to_string(),
                reason: format!(
                    "observations flatten to {} features, estimator expects {}",
                    x.ncols(),
                    self.obs_len
                ),
            });
        }
        let n = x.nrows();
        if n < 2 {
            return Err(Error::Configuration {
                parameter: "dataset".to_string(),
                reason: "training requires at least two simulated pairs".to_string(),
            });
        }

        use rand::seq::SliceRandom;
        use rand::SeedableRng;
        let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(options.effective_seed());

        // Cyclic shift of a shuffled order: every contrast row gets
        // parameters from a different sample.
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(&mut rng);
        let mut scrambled = vec![0usize; n];
        for i in 0..n {
            scrambled[order[i]] = order[(i + 1) % n];
        }

        let mut labels = DVector::zeros(2 * n);
        for i in 0..n {
            labels[i] = 1.0;
        }

        let v = dataset.v();
        let mut fitted = Vec::with_capacity(self.networks.len());
        let mut diagnostics = BTreeMap::new();
        for (group_index, (marginal, network)) in
            self.marginals.iter().zip(&self.networks).enumerate()
        {
            let dims = marginal.indices();
            let width = self.obs_len + dims.len();
            let features = DMatrix::from_fn(2 * n, width, |row, col| {
                let sample = row % n;
                if col < self.obs_len {
                    x[(sample, col)]
                } else {
                    let source = if row < n { sample } else { scrambled[sample] };
                    v[(source, dims[col - self.obs_len])]
                }
            });

            let mut candidate = network.clone();
            let per_marginal = options
                .clone()
                .seed(options.effective_seed().wrapping_add(group_index as u64));
            let diag = candidate.fit(&features, &labels, &per_marginal)?;
            tracing::info!(
                marginal = %marginal,
                epochs = diag.train_loss.len(),
                best_epoch = diag.best_epoch,
                "trained ratio classifier"
            );
            diagnostics.insert(marginal.clone(), diag);
            fitted.push(candidate);
        }

        self.networks = fitted;
        self.diagnostics = diagnostics;
        self.trained = true;
        Ok(&self.diagnostics)
    }

    /// Evaluate log-ratios for every marginal at the given parameters.
    ///
    /// `v` holds full-dimensional parameter rows; each classifier sees the
    /// flattened observation next to its marginal's slice of each row.
    /// Evaluation is batched internally; results do not depend on the
    /// batch size.
    pub fn log_ratios(
        &self,
        observation: &Observation,
        v: &DMatrix<f64>,
    ) -> Result<BTreeMap<Marginal, LogRatioSamples>> {
        self.log_ratios_batched(observation, v, DEFAULT_EVAL_BATCH)
    }

    /// [`log_ratios`](Self::log_ratios) with an explicit evaluation batch
    /// size, for callers tuning memory against throughput.
    pub fn log_ratios_batched(
        &self,
        observation: &Observation,
        v: &DMatrix<f64>,
        batch_size: usize,
    ) -> Result<BTreeMap<Marginal, LogRatioSamples>> {
        if batch_size == 0 {
            return Err(Error::Configuration {
                parameter: "batch_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !self.trained {
            return Err(Error::UnsupportedOperation {
                operation: "log_ratios".to_string(),
                reason: "estimator has not been trained".to_string(),
            });
        }
        let x = observation.flatten();
        if x.len() != self.obs_len {
            return Err(Error::Configuration {
                parameter: "observation".to_string(),
                reason: format!(
                    "observation flattens to {} features, estimator expects {}",
                    x.len(),
                    self.obs_len
                ),
            });
        }
        if v.ncols() != self.n_parameters {
            return Err(Error::Configuration {
                parameter: "v".to_string(),
                reason: format!(
                    "parameters have {} columns, estimator expects {}",
                    v.ncols(),
                    self.n_parameters
                ),
            });
        }

        let n = v.nrows();
        let mut out = BTreeMap::new();
        for (marginal, network) in self.marginals.iter().zip(&self.networks) {
            let dims = marginal.indices();
            let width = self.obs_len + dims.len();
            let mut logratios = DVector::zeros(n);

            let mut start = 0;
            while start < n {
                let len = (n - start).min(batch_size);
                let features = DMatrix::from_fn(len, width, |row, col| {
                    if col < self.obs_len {
                        x[col]
                    } else {
                        v[(start + row, dims[col - self.obs_len])]
                    }
                });
                let logits = network.forward(&features);
                logratios.rows_mut(start, len).copy_from(&logits);
                start += len;
            }

            let params = DMatrix::from_fn(n, dims.len(), |row, col| v[(row, dims[col])]);
            let names = dims
                .iter()
                .map(|&d| self.parameter_names[d].clone())
                .collect();
            out.insert(
                marginal.clone(),
                LogRatioSamples {
                    marginal: marginal.clone(),
                    params,
                    logratios,
                    parameter_names: names,
                },
            );
        }
        Ok(out)
    }

    /// Snapshot the estimator for serialization.
    pub fn state(&self) -> RatioEstimatorState {
        RatioEstimatorState {
            marginals: self.marginals.clone(),
            n_parameters: self.n_parameters,
            obs_len: self.obs_len,
            trained: self.trained,
            networks: self.networks.iter().map(Classifier::state).collect(),
            diagnostics: self.diagnostics.clone(),
            parameter_names: self.parameter_names.clone(),
        }
    }

    /// Rebuild an estimator from a snapshot.
    pub fn from_state(state: &RatioEstimatorState) -> Result<Self> {
        let networks = state
            .networks
            .iter()
            .map(C::from_state)
            .collect::<Result<Vec<_>>>()?;
        let mut estimator = Self::with_classifiers(
            state.marginals.clone(),
            state.n_parameters,
            state.obs_len,
            networks,
        )?;
        estimator.trained = state.trained;
        estimator.diagnostics = state.diagnostics.clone();
        estimator.set_parameter_names(state.parameter_names.clone())?;
        Ok(estimator)
    }
}
