//! Training-loop collaborator: options, diagnostics, and loss helpers.
//!
//! The ratio-estimation core delegates optimizer stepping, early stopping,
//! and learning-rate scheduling to this module. Its contract: consume
//! (features, label) minibatches, report a scalar loss per epoch, stop when
//! validation loss plateaus, and leave the best-validation weights as the
//! final state.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::constants::DEFAULT_SEED;
use crate::error::{Error, Result};

/// Options for classifier training.
///
/// Defaults mirror the usual contrastive-training setup: batches of 64, a
/// 10% validation split, early stopping with patience 5, at most 30
/// epochs, Adam at 1e-3 with a reduce-on-plateau schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOptions {
    /// Minibatch size.
    pub batch_size: usize,

    /// Fraction of pairs held out for validation.
    ///
    /// With a split too small to populate, early stopping falls back to
    /// the training loss.
    pub validation_fraction: f64,

    /// Epochs without validation improvement before training stops.
    pub early_stopping_patience: usize,

    /// Hard cap on training epochs.
    pub max_epochs: usize,

    /// Initial Adam learning rate.
    pub learning_rate: f64,

    /// Multiplier applied to the learning rate on a plateau.
    pub scheduler_factor: f64,

    /// Epochs without improvement before the learning rate is reduced.
    pub scheduler_patience: usize,

    /// Seed for shuffling, splitting, and pair resampling.
    pub seed: Option<u64>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            validation_fraction: 0.1,
            early_stopping_patience: 5,
            max_epochs: 30,
            learning_rate: 1e-3,
            scheduler_factor: 0.1,
            scheduler_patience: 5,
            seed: None,
        }
    }
}

impl TrainOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// A short schedule for tests and smoke runs.
    pub fn quick() -> Self {
        Self {
            max_epochs: 8,
            early_stopping_patience: 8,
            batch_size: 32,
            ..Self::default()
        }
    }

    /// Set the minibatch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        assert!(size > 0, "batch_size must be positive");
        self.batch_size = size;
        self
    }

    /// Set the validation fraction.
    pub fn validation_fraction(mut self, fraction: f64) -> Self {
        assert!(
            (0.0..1.0).contains(&fraction),
            "validation_fraction must be in [0, 1)"
        );
        self.validation_fraction = fraction;
        self
    }

    /// Set the early-stopping patience.
    pub fn early_stopping_patience(mut self, epochs: usize) -> Self {
        self.early_stopping_patience = epochs;
        self
    }

    /// Set the maximum epoch count.
    pub fn max_epochs(mut self, epochs: usize) -> Self {
        assert!(epochs > 0, "max_epochs must be positive");
        self.max_epochs = epochs;
        self
    }

    /// Set the initial learning rate.
    pub fn learning_rate(mut self, lr: f64) -> Self {
        assert!(lr > 0.0, "learning_rate must be positive");
        self.learning_rate = lr;
        self
    }

    /// Set the plateau learning-rate factor.
    pub fn scheduler_factor(mut self, factor: f64) -> Self {
        assert!(
            factor > 0.0 && factor < 1.0,
            "scheduler_factor must be in (0, 1)"
        );
        self.scheduler_factor = factor;
        self
    }

    /// Set the scheduler patience.
    pub fn scheduler_patience(mut self, epochs: usize) -> Self {
        self.scheduler_patience = epochs;
        self
    }

    /// Set a deterministic seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// The effective seed, defaulting when unset.
    pub fn effective_seed(&self) -> u64 {
        self.seed.unwrap_or(DEFAULT_SEED)
    }

    /// Check the option set as a whole.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Configuration {
                parameter: "batch_size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.max_epochs == 0 {
            return Err(Error::Configuration {
                parameter: "max_epochs".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.validation_fraction) {
            return Err(Error::Configuration {
                parameter: "validation_fraction".to_string(),
                reason: "must be in [0, 1)".to_string(),
            });
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Configuration {
                parameter: "learning_rate".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if !(self.scheduler_factor > 0.0 && self.scheduler_factor < 1.0) {
            return Err(Error::Configuration {
                parameter: "scheduler_factor".to_string(),
                reason: "must be in (0, 1)".to_string(),
            });
        }
        Ok(())
    }
}

/// Loss curves and stopping information from one training run.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TrainDiagnostics {
    /// Mean training loss per epoch.
    pub train_loss: Vec<f64>,
    /// Validation loss per epoch (training loss when no split).
    pub validation_loss: Vec<f64>,
    /// Epoch whose weights were kept.
    pub best_epoch: usize,
    /// Learning rate at the end of training.
    pub final_learning_rate: f64,
}

/// Numerically stable binary cross-entropy with logits, per element.
///
/// `max(z, 0) - z*y + ln(1 + exp(-|z|))`; the optimum recovers the log
/// density ratio as the logit.
pub(crate) fn bce_with_logits(logit: f64, label: f64) -> f64 {
    logit.max(0.0) - logit * label + (-logit.abs()).exp().ln_1p()
}

/// Logistic sigmoid, saturating smoothly at the extremes.
pub(crate) fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Shuffle `0..n` and split off a validation tail.
///
/// Returns `(train, validation)` index sets; validation may be empty.
pub(crate) fn split_indices<R: Rng>(
    n: usize,
    validation_fraction: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    let n_val = ((n as f64) * validation_fraction).floor() as usize;
    let n_val = n_val.min(n.saturating_sub(1));
    let val = indices.split_off(n - n_val);
    (indices, val)
}
