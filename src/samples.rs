//! Containers for ratio evaluations and posterior draws.
//!
//! Evaluation produces per-marginal log-ratios attached to the parameter
//! draws they were computed at; weighting turns them into importance
//! weights against the truncated prior; resampling turns weighted draws
//! into equally weighted posterior samples.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use rand::distr::weighted::WeightedIndex;
use rand::prelude::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::marginal::Marginal;

/// Fallback display names `v0`, `v1`, ... for an unnamed parameter vector.
pub(crate) fn default_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("v{i}")).collect()
}

/// Log-ratio evaluations for one marginal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRatioSamples {
    /// The marginal these ratios belong to.
    pub marginal: Marginal,
    /// Parameter values restricted to the marginal's dimensions, one row
    /// per sample.
    pub params: DMatrix<f64>,
    /// Estimated log likelihood-to-evidence ratio per sample.
    pub logratios: DVector<f64>,
    /// Display names for the marginal's dimensions, in column order.
    pub parameter_names: Vec<String>,
}

impl LogRatioSamples {
    /// Number of evaluated samples.
    pub fn len(&self) -> usize {
        self.logratios.len()
    }

    /// Whether the container is empty.
    pub fn is_empty(&self) -> bool {
        self.logratios.len() == 0
    }

    /// Importance weights `exp(logratio - max)`, stable under large ratios.
    pub fn weights(&self) -> DVector<f64> {
        let max = self
            .logratios
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return DVector::zeros(self.logratios.len());
        }
        self.logratios.map(|lr| (lr - max).exp())
    }
}

/// Parameter draws with per-marginal importance weights.
///
/// `v` holds full-dimensional draws from the truncated prior; each
/// marginal's weights reweight those same rows toward its posterior.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSamples {
    /// Full parameter draws, one row per sample.
    pub v: DMatrix<f64>,
    /// Unnormalized importance weights per marginal.
    pub weights: BTreeMap<Marginal, DVector<f64>>,
    /// Display names for the full parameter vector.
    pub parameter_names: Vec<String>,
}

impl WeightedSamples {
    /// Number of underlying draws.
    pub fn len(&self) -> usize {
        self.v.nrows()
    }

    /// Whether any draws are present.
    pub fn is_empty(&self) -> bool {
        self.v.nrows() == 0
    }

    /// The marginals carrying weights.
    pub fn marginals(&self) -> impl Iterator<Item = &Marginal> {
        self.weights.keys()
    }

    /// Kish effective sample size for one marginal's weights.
    pub fn effective_sample_size(&self, marginal: &Marginal) -> Option<f64> {
        let w = self.weights.get(marginal)?;
        let sum: f64 = w.iter().sum();
        let sum_sq: f64 = w.iter().map(|x| x * x).sum();
        if sum_sq > 0.0 {
            Some(sum * sum / sum_sq)
        } else {
            Some(0.0)
        }
    }

    /// Resample `n` equally weighted draws for one marginal.
    ///
    /// Rows of the result hold only the marginal's dimensions.
    pub fn resample<R: Rng>(
        &self,
        marginal: &Marginal,
        n: usize,
        rng: &mut R,
    ) -> Result<DMatrix<f64>> {
        let weights = self.weights.get(marginal).ok_or_else(|| {
            Error::InvalidMarginal {
                reason: format!("no weights stored for marginal {marginal}"),
            }
        })?;
        let index = WeightedIndex::new(weights.iter().copied()).map_err(|e| {
            Error::DegenerateBound {
                reason: format!("marginal {marginal}: cannot resample, {e}"),
            }
        })?;

        let dims = marginal.indices();
        let mut out = DMatrix::zeros(n, dims.len());
        for row in 0..n {
            let pick = index.sample(rng);
            for (col, &dim) in dims.iter().enumerate() {
                out[(row, col)] = self.v[(pick, dim)];
            }
        }
        Ok(out)
    }
}

/// Equally weighted posterior draws, one matrix per marginal.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSamples {
    /// The raw truncated-prior draws the marginals were resampled from,
    /// one full-dimensional row per draw.
    pub v: DMatrix<f64>,
    /// Draws per marginal; each row is one sample over that marginal's
    /// dimensions.
    pub samples: BTreeMap<Marginal, DMatrix<f64>>,
    /// Display names for the full parameter vector.
    pub parameter_names: Vec<String>,
}

impl PosteriorSamples {
    /// Draws for one marginal.
    pub fn get(&self, marginal: &Marginal) -> Option<&DMatrix<f64>> {
        self.samples.get(marginal)
    }

    /// Per-dimension sample mean for one marginal.
    pub fn mean(&self, marginal: &Marginal) -> Option<DVector<f64>> {
        let draws = self.samples.get(marginal)?;
        if draws.nrows() == 0 {
            return None;
        }
        Some(draws.row_mean().transpose())
    }

    /// Per-dimension sample standard deviation for one marginal.
    pub fn std_dev(&self, marginal: &Marginal) -> Option<DVector<f64>> {
        let draws = self.samples.get(marginal)?;
        if draws.nrows() < 2 {
            return None;
        }
        let mean = draws.row_mean();
        let n = draws.nrows() as f64;
        let var = DVector::from_fn(draws.ncols(), |c, _| {
            draws
                .column(c)
                .iter()
                .map(|&x| (x - mean[c]) * (x - mean[c]))
                .sum::<f64>()
                / (n - 1.0)
        });
        Some(var.map(f64::sqrt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn weighted_fixture() -> (Marginal, WeightedSamples) {
        let marginal = Marginal::new(vec![1]).expect("valid");
        let v = DMatrix::from_row_slice(3, 2, &[0.0, 10.0, 0.0, 20.0, 0.0, 30.0]);
        let mut weights = BTreeMap::new();
        weights.insert(marginal.clone(), DVector::from_vec(vec![0.0, 0.0, 1.0]));
        let samples = WeightedSamples {
            v,
            weights,
            parameter_names: vec!["a".to_string(), "b".to_string()],
        };
        (marginal, samples)
    }

    #[test]
    fn weights_are_shift_invariant() {
        let marginal = Marginal::new(vec![0]).expect("valid");
        let a = LogRatioSamples {
            marginal: marginal.clone(),
            params: DMatrix::zeros(3, 1),
            logratios: DVector::from_vec(vec![0.0, -1.0, -2.0]),
            parameter_names: vec!["a".to_string()],
        };
        let b = LogRatioSamples {
            marginal,
            params: DMatrix::zeros(3, 1),
            logratios: DVector::from_vec(vec![100.0, 99.0, 98.0]),
            parameter_names: vec!["a".to_string()],
        };
        let wa = a.weights();
        let wb = b.weights();
        for i in 0..3 {
            assert!((wa[i] - wb[i]).abs() < 1e-12);
            assert!(wa[i].is_finite());
        }
        assert_eq!(wa[0], 1.0);
    }

    #[test]
    fn resample_follows_the_weights() {
        let (marginal, samples) = weighted_fixture();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let draws = samples.resample(&marginal, 50, &mut rng).expect("resample");

        // All weight on the third row, whose dimension-1 value is 30.
        assert_eq!(draws.nrows(), 50);
        assert_eq!(draws.ncols(), 1);
        assert!(draws.iter().all(|&x| (x - 30.0).abs() < 1e-12));
    }

    #[test]
    fn resample_unknown_marginal_fails() {
        let (_, samples) = weighted_fixture();
        let other = Marginal::new(vec![0]).expect("valid");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        assert!(samples.resample(&other, 10, &mut rng).is_err());
    }

    #[test]
    fn effective_sample_size_extremes() {
        let marginal = Marginal::new(vec![0]).expect("valid");
        let v = DMatrix::zeros(4, 1);

        let mut weights = BTreeMap::new();
        weights.insert(marginal.clone(), DVector::from_element(4, 0.25));
        let uniform = WeightedSamples {
            v: v.clone(),
            weights,
            parameter_names: vec!["a".to_string()],
        };
        assert!((uniform.effective_sample_size(&marginal).unwrap() - 4.0).abs() < 1e-12);

        let mut weights = BTreeMap::new();
        weights.insert(marginal.clone(), DVector::from_vec(vec![1.0, 0.0, 0.0, 0.0]));
        let degenerate = WeightedSamples {
            v,
            weights,
            parameter_names: vec!["a".to_string()],
        };
        assert!((degenerate.effective_sample_size(&marginal).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn posterior_summaries() {
        let marginal = Marginal::new(vec![0]).expect("valid");
        let mut samples = BTreeMap::new();
        samples.insert(
            marginal.clone(),
            DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]),
        );
        let posterior = PosteriorSamples {
            v: DMatrix::from_row_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]),
            samples,
            parameter_names: vec!["a".to_string()],
        };

        let mean = posterior.mean(&marginal).expect("mean");
        assert!((mean[0] - 2.5).abs() < 1e-12);
        let sd = posterior.std_dev(&marginal).expect("std");
        assert!((sd[0] - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
    }
}
