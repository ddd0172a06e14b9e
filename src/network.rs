//! Binary classifiers over flattened (observation, parameter) features.
//!
//! A classifier is trained to separate jointly drawn pairs from pairs with
//! shuffled parameters; at the optimum its logit equals the log
//! likelihood-to-evidence ratio. The [`Classifier`] trait is the seam the
//! ratio estimator plugs into, and [`MlpNetwork`] is the built-in
//! implementation: a ReLU multilayer perceptron with per-feature input
//! standardization, trained with Adam.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::train::{bce_with_logits, sigmoid, split_indices, TrainDiagnostics, TrainOptions};

/// Default hidden-layer widths for the built-in network.
pub const DEFAULT_HIDDEN_LAYERS: [usize; 2] = [64, 64];

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;

/// Minimum standard deviation used when standardizing features.
const STD_FLOOR: f64 = 1e-12;

/// A trainable binary classifier mapping feature vectors to logits.
///
/// Implementations must be deterministic given the seed in
/// [`TrainOptions`], and must be able to round-trip their full state
/// through [`NetworkState`] for persistence.
pub trait Classifier: Sized {
    /// Input feature dimensionality.
    fn n_features(&self) -> usize;

    /// Compute one logit per row of `features`.
    fn forward(&self, features: &DMatrix<f64>) -> DVector<f64>;

    /// Train on labelled rows, mutating the classifier in place.
    fn fit(
        &mut self,
        features: &DMatrix<f64>,
        labels: &DVector<f64>,
        options: &TrainOptions,
    ) -> Result<TrainDiagnostics>;

    /// Snapshot the full state for serialization.
    fn state(&self) -> NetworkState;

    /// Rebuild a classifier from a snapshot.
    fn from_state(state: &NetworkState) -> Result<Self>;

    /// Whether logits from this classifier are meaningful enough for
    /// rectangle bound extraction.
    fn supports_rectangle_extraction(&self) -> bool {
        true
    }
}

/// Serializable snapshot of an [`MlpNetwork`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkState {
    /// Input dimensionality.
    pub n_features: usize,
    /// Hidden-layer widths.
    pub hidden: Vec<usize>,
    /// Weight matrices, output-by-input per layer.
    pub weights: Vec<DMatrix<f64>>,
    /// Bias vectors per layer.
    pub biases: Vec<DVector<f64>>,
    /// Per-feature standardization mean.
    pub feature_mean: DVector<f64>,
    /// Per-feature standardization scale.
    pub feature_std: DVector<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct Layer {
    weight: DMatrix<f64>,
    bias: DVector<f64>,
}

/// ReLU multilayer perceptron with a single logit output.
///
/// Inputs are standardized per feature with statistics fitted at training
/// time, so callers pass raw features everywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct MlpNetwork {
    n_features: usize,
    hidden: Vec<usize>,
    layers: Vec<Layer>,
    feature_mean: DVector<f64>,
    feature_std: DVector<f64>,
}

impl MlpNetwork {
    /// Create a network with the given hidden widths and seeded
    /// Xavier-uniform initial weights.
    pub fn new(n_features: usize, hidden: &[usize], seed: u64) -> Result<Self> {
        if n_features == 0 {
            return Err(Error::Configuration {
                parameter: "n_features".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if hidden.iter().any(|&w| w == 0) {
            return Err(Error::Configuration {
                parameter: "hidden".to_string(),
                reason: "hidden layer widths must be positive".to_string(),
            });
        }

        use rand::SeedableRng;
        let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(seed);

        let mut sizes = Vec::with_capacity(hidden.len() + 2);
        sizes.push(n_features);
        sizes.extend_from_slice(hidden);
        sizes.push(1);

        let layers = sizes
            .windows(2)
            .map(|pair| Layer::xavier(pair[0], pair[1], &mut rng))
            .collect();

        Ok(Self {
            n_features,
            hidden: hidden.to_vec(),
            layers,
            feature_mean: DVector::zeros(n_features),
            feature_std: DVector::from_element(n_features, 1.0),
        })
    }

    /// Create a network with the default hidden widths.
    pub fn with_defaults(n_features: usize, seed: u64) -> Result<Self> {
        Self::new(n_features, &DEFAULT_HIDDEN_LAYERS, seed)
    }

    /// Hidden-layer widths.
    pub fn hidden_layers(&self) -> &[usize] {
        &self.hidden
    }

    /// Standardize raw features row-wise into a column-per-sample matrix.
    fn standardize(&self, features: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(self.n_features, features.nrows(), |f, s| {
            (features[(s, f)] - self.feature_mean[f]) / self.feature_std[f]
        })
    }

    /// Forward pass over a column-per-sample batch, returning every
    /// pre-activation and activation for the backward pass.
    fn forward_cached(&self, input: DMatrix<f64>) -> (Vec<DMatrix<f64>>, Vec<DMatrix<f64>>) {
        let n_layers = self.layers.len();
        let mut pre = Vec::with_capacity(n_layers);
        let mut act = Vec::with_capacity(n_layers + 1);
        act.push(input);

        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = layer.weight.clone() * act.last().expect("non-empty activations");
            for mut column in z.column_iter_mut() {
                column += &layer.bias;
            }
            let a = if i + 1 == n_layers {
                z.clone()
            } else {
                z.map(|v| v.max(0.0))
            };
            pre.push(z);
            act.push(a);
        }
        (pre, act)
    }

    /// Logits for a subset of rows of a pre-standardized sample matrix.
    fn logits_for(&self, standardized: &DMatrix<f64>, rows: &[usize]) -> DVector<f64> {
        let batch = DMatrix::from_fn(self.n_features, rows.len(), |f, s| {
            standardized[(f, rows[s])]
        });
        let (_, act) = self.forward_cached(batch);
        act.last()
            .expect("non-empty activations")
            .row(0)
            .transpose()
    }

    /// Mean loss over a subset of rows.
    fn loss_for(&self, standardized: &DMatrix<f64>, labels: &DVector<f64>, rows: &[usize]) -> f64 {
        if rows.is_empty() {
            return f64::NAN;
        }
        let logits = self.logits_for(standardized, rows);
        let total: f64 = logits
            .iter()
            .zip(rows.iter())
            .map(|(&z, &r)| bce_with_logits(z, labels[r]))
            .sum();
        total / rows.len() as f64
    }
}

impl Layer {
    fn xavier<R: rand::Rng>(fan_in: usize, fan_out: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (fan_in + fan_out) as f64).sqrt();
        let weight =
            DMatrix::from_fn(fan_out, fan_in, |_, _| rng.random::<f64>() * 2.0 * limit - limit);
        Self {
            weight,
            bias: DVector::zeros(fan_out),
        }
    }
}

/// Per-layer first and second Adam moments.
struct AdamState {
    m_w: Vec<DMatrix<f64>>,
    v_w: Vec<DMatrix<f64>>,
    m_b: Vec<DVector<f64>>,
    v_b: Vec<DVector<f64>>,
    t: i32,
}

impl AdamState {
    fn new(layers: &[Layer]) -> Self {
        Self {
            m_w: layers
                .iter()
                .map(|l| DMatrix::zeros(l.weight.nrows(), l.weight.ncols()))
                .collect(),
            v_w: layers
                .iter()
                .map(|l| DMatrix::zeros(l.weight.nrows(), l.weight.ncols()))
                .collect(),
            m_b: layers.iter().map(|l| DVector::zeros(l.bias.len())).collect(),
            v_b: layers.iter().map(|l| DVector::zeros(l.bias.len())).collect(),
            t: 0,
        }
    }

    fn step(
        &mut self,
        layers: &mut [Layer],
        grads_w: &[DMatrix<f64>],
        grads_b: &[DVector<f64>],
        lr: f64,
    ) {
        self.t += 1;
        let bc1 = 1.0 - ADAM_BETA1.powi(self.t);
        let bc2 = 1.0 - ADAM_BETA2.powi(self.t);

        for (i, layer) in layers.iter_mut().enumerate() {
            for r in 0..layer.weight.nrows() {
                for c in 0..layer.weight.ncols() {
                    let g = grads_w[i][(r, c)];
                    let m = &mut self.m_w[i][(r, c)];
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    let v = &mut self.v_w[i][(r, c)];
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                    layer.weight[(r, c)] -=
                        lr * (*m / bc1) / ((*v / bc2).sqrt() + ADAM_EPS);
                }
            }
            for r in 0..layer.bias.len() {
                let g = grads_b[i][r];
                let m = &mut self.m_b[i][r];
                *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                let v = &mut self.v_b[i][r];
                *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                layer.bias[r] -= lr * (*m / bc1) / ((*v / bc2).sqrt() + ADAM_EPS);
            }
        }
    }
}

impl Classifier for MlpNetwork {
    fn n_features(&self) -> usize {
        self.n_features
    }

    fn forward(&self, features: &DMatrix<f64>) -> DVector<f64> {
        assert_eq!(
            features.ncols(),
            self.n_features,
            "feature dimensionality mismatch"
        );
        let (_, act) = self.forward_cached(self.standardize(features));
        act.last()
            .expect("non-empty activations")
            .row(0)
            .transpose()
    }

    fn fit(
        &mut self,
        features: &DMatrix<f64>,
        labels: &DVector<f64>,
        options: &TrainOptions,
    ) -> Result<TrainDiagnostics> {
        options.validate()?;
        if features.ncols() != self.n_features {
            return Err(Error::Configuration {
                parameter: "features".to_string(),
                reason: format!(
                    "expected {} features per row, got {}",
                    self.n_features,
                    features.ncols()
                ),
            });
        }
        if features.nrows() != labels.len() {
            return Err(Error::Configuration {
                parameter: "labels".to_string(),
                reason: format!(
                    "{} labels for {} feature rows",
                    labels.len(),
                    features.nrows()
                ),
            });
        }
        if features.nrows() < 2 {
            return Err(Error::Configuration {
                parameter: "features".to_string(),
                reason: "training requires at least two rows".to_string(),
            });
        }

        use rand::seq::SliceRandom;
        use rand::SeedableRng;
        let mut rng = rand_xoshiro::Xoshiro256PlusPlus::seed_from_u64(options.effective_seed());

        // Standardization statistics come from the full training input.
        let n = features.nrows();
        for f in 0..self.n_features {
            let column = features.column(f);
            let mean = column.iter().sum::<f64>() / n as f64;
            let var =
                column.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / n as f64;
            self.feature_mean[f] = mean;
            self.feature_std[f] = var.sqrt().max(STD_FLOOR);
        }
        let standardized = self.standardize(features);

        let (mut train_rows, val_rows) = split_indices(n, options.validation_fraction, &mut rng);

        let mut adam = AdamState::new(&self.layers);
        let mut lr = options.learning_rate;
        let mut best_loss = f64::INFINITY;
        let mut best_layers = self.layers.clone();
        let mut best_epoch = 0;
        let mut stall_stop = 0usize;
        let mut stall_sched = 0usize;
        let mut train_curve = Vec::new();
        let mut val_curve = Vec::new();

        for epoch in 0..options.max_epochs {
            train_rows.shuffle(&mut rng);
            let mut epoch_loss = 0.0;

            for chunk in train_rows.chunks(options.batch_size) {
                let b = chunk.len();
                let batch = DMatrix::from_fn(self.n_features, b, |f, s| {
                    standardized[(f, chunk[s])]
                });
                let (pre, act) = self.forward_cached(batch);
                let logits = pre.last().expect("non-empty layers").row(0);

                let mut batch_loss = 0.0;
                // dL/dz for sigmoid cross-entropy, averaged over the batch.
                let mut delta = DMatrix::zeros(1, b);
                for s in 0..b {
                    let z = logits[s];
                    let y = labels[chunk[s]];
                    batch_loss += bce_with_logits(z, y);
                    delta[(0, s)] = (sigmoid(z) - y) / b as f64;
                }
                epoch_loss += batch_loss;

                let n_layers = self.layers.len();
                let mut grads_w = vec![DMatrix::zeros(0, 0); n_layers];
                let mut grads_b = vec![DVector::zeros(0); n_layers];
                for l in (0..n_layers).rev() {
                    grads_w[l] = &delta * act[l].transpose();
                    grads_b[l] = DVector::from_iterator(
                        delta.nrows(),
                        delta.row_iter().map(|row| row.sum()),
                    );
                    if l > 0 {
                        let back = self.layers[l].weight.transpose() * &delta;
                        delta = back.zip_map(&pre[l - 1], |d, z| if z > 0.0 { d } else { 0.0 });
                    }
                }
                adam.step(&mut self.layers, &grads_w, &grads_b, lr);
            }

            let train_loss = epoch_loss / train_rows.len() as f64;
            let monitored = if val_rows.is_empty() {
                train_loss
            } else {
                self.loss_for(&standardized, labels, &val_rows)
            };
            train_curve.push(train_loss);
            val_curve.push(monitored);

            if monitored < best_loss {
                best_loss = monitored;
                best_layers = self.layers.clone();
                best_epoch = epoch;
                stall_stop = 0;
                stall_sched = 0;
            } else {
                stall_stop += 1;
                stall_sched += 1;
            }

            if stall_sched > options.scheduler_patience {
                lr *= options.scheduler_factor;
                stall_sched = 0;
                tracing::debug!(epoch, lr, "reduced learning rate on plateau");
            }
            if stall_stop >= options.early_stopping_patience {
                tracing::debug!(epoch, best_epoch, "early stopping");
                break;
            }
        }

        self.layers = best_layers;
        Ok(TrainDiagnostics {
            train_loss: train_curve,
            validation_loss: val_curve,
            best_epoch,
            final_learning_rate: lr,
        })
    }

    fn state(&self) -> NetworkState {
        NetworkState {
            n_features: self.n_features,
            hidden: self.hidden.clone(),
            weights: self.layers.iter().map(|l| l.weight.clone()).collect(),
            biases: self.layers.iter().map(|l| l.bias.clone()).collect(),
            feature_mean: self.feature_mean.clone(),
            feature_std: self.feature_std.clone(),
        }
    }

    fn from_state(state: &NetworkState) -> Result<Self> {
        let mut sizes = Vec::with_capacity(state.hidden.len() + 2);
        sizes.push(state.n_features);
        sizes.extend_from_slice(&state.hidden);
        sizes.push(1);

        if state.weights.len() != sizes.len() - 1 || state.biases.len() != sizes.len() - 1 {
            return Err(Error::Serialization {
                reason: format!(
                    "network state has {} weight matrices for {} layers",
                    state.weights.len(),
                    sizes.len() - 1
                ),
            });
        }
        for (i, pair) in sizes.windows(2).enumerate() {
            let w = &state.weights[i];
            if w.nrows() != pair[1] || w.ncols() != pair[0] || state.biases[i].len() != pair[1] {
                return Err(Error::Serialization {
                    reason: format!("layer {i} shapes do not match the declared architecture"),
                });
            }
        }
        if state.feature_mean.len() != state.n_features
            || state.feature_std.len() != state.n_features
        {
            return Err(Error::Serialization {
                reason: "standardization statistics do not match the feature count".to_string(),
            });
        }

        Ok(Self {
            n_features: state.n_features,
            hidden: state.hidden.clone(),
            layers: state
                .weights
                .iter()
                .zip(state.biases.iter())
                .map(|(w, b)| Layer {
                    weight: w.clone(),
                    bias: b.clone(),
                })
                .collect(),
            feature_mean: state.feature_mean.clone(),
            feature_std: state.feature_std.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn toy_problem(n: usize, seed: u64) -> (DMatrix<f64>, DVector<f64>) {
        // Two 2-D blobs separated along the first feature.
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut features = DMatrix::zeros(n, 2);
        let mut labels = DVector::zeros(n);
        for i in 0..n {
            let label = (i % 2) as f64;
            let shift = if label > 0.5 { 2.0 } else { -2.0 };
            features[(i, 0)] = shift + rng.random::<f64>() - 0.5;
            features[(i, 1)] = rng.random::<f64>() - 0.5;
            labels[i] = label;
        }
        (features, labels)
    }

    #[test]
    fn construction_rejects_bad_shapes() {
        assert!(MlpNetwork::new(0, &[8], 0).is_err());
        assert!(MlpNetwork::new(4, &[8, 0], 0).is_err());
        assert!(MlpNetwork::new(4, &[], 0).is_ok());
    }

    #[test]
    fn initialization_is_deterministic_per_seed() {
        let a = MlpNetwork::new(3, &[8], 11).expect("valid");
        let b = MlpNetwork::new(3, &[8], 11).expect("valid");
        let c = MlpNetwork::new(3, &[8], 12).expect("valid");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn forward_returns_one_logit_per_row() {
        let net = MlpNetwork::with_defaults(3, 0).expect("valid");
        let logits = net.forward(&DMatrix::zeros(5, 3));
        assert_eq!(logits.len(), 5);
        assert!(logits.iter().all(|z| z.is_finite()));
    }

    #[test]
    fn fit_separates_linearly_separable_blobs() {
        let (features, labels) = toy_problem(400, 5);
        let mut net = MlpNetwork::new(2, &[16], 0).expect("valid");
        let options = TrainOptions::quick().seed(1);
        let diag = net.fit(&features, &labels, &options).expect("training");

        assert!(!diag.train_loss.is_empty());
        let logits = net.forward(&features);
        let correct = logits
            .iter()
            .zip(labels.iter())
            .filter(|(&z, &y)| (z > 0.0) == (y > 0.5))
            .count();
        assert!(
            correct as f64 / labels.len() as f64 > 0.9,
            "classifier should separate the blobs, got {correct}/{}",
            labels.len()
        );
    }

    #[test]
    fn fit_is_deterministic_per_seed() {
        let (features, labels) = toy_problem(100, 5);
        let options = TrainOptions::quick().seed(9);

        let mut a = MlpNetwork::new(2, &[8], 3).expect("valid");
        let mut b = MlpNetwork::new(2, &[8], 3).expect("valid");
        a.fit(&features, &labels, &options).expect("training");
        b.fit(&features, &labels, &options).expect("training");
        assert_eq!(a, b);
    }

    #[test]
    fn fit_rejects_mismatched_labels() {
        let mut net = MlpNetwork::new(2, &[4], 0).expect("valid");
        let features = DMatrix::zeros(10, 2);
        let labels = DVector::zeros(9);
        assert!(net
            .fit(&features, &labels, &TrainOptions::quick())
            .is_err());
    }

    #[test]
    fn state_round_trip_preserves_logits() {
        let (features, labels) = toy_problem(100, 2);
        let mut net = MlpNetwork::new(2, &[8], 0).expect("valid");
        net.fit(&features, &labels, &TrainOptions::quick().seed(4))
            .expect("training");

        let restored = MlpNetwork::from_state(&net.state()).expect("valid state");
        assert_eq!(net.forward(&features), restored.forward(&features));
    }

    #[test]
    fn corrupt_state_is_rejected() {
        let net = MlpNetwork::new(2, &[8], 0).expect("valid");
        let mut state = net.state();
        state.hidden = vec![16];
        assert!(MlpNetwork::from_state(&state).is_err());
    }
}
