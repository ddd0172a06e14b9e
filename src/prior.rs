//! Priors over parameter space and their truncated variants.
//!
//! A [`Prior`] is a stateless bijection between the unit hypercube and
//! parameter space: `transform` maps cube coordinates through the
//! per-dimension inverse CDF, `cdf` inverts it exactly, and `log_prob`
//! sums independent per-dimension log-densities. Two families are built
//! in: independent uniform and independent diagonal normal.
//!
//! A [`PriorTruncator`] pairs a prior with a [`Bound`], rejection-sampling
//! proposals in cube space and renormalizing densities by the bound volume.

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::bound::Bound;
use crate::constants::{LOG_2PI, MAX_REJECTION_ROUNDS, U_EPS};
use crate::error::{Error, Result};

/// The built-in independent prior families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PriorFamily {
    /// Independent uniform over `[low_i, high_i]` per dimension.
    Uniform {
        /// Lower edges per dimension.
        low: DVector<f64>,
        /// Upper edges per dimension.
        high: DVector<f64>,
    },
    /// Independent normal with diagonal covariance.
    DiagonalNormal {
        /// Means per dimension.
        loc: DVector<f64>,
        /// Standard deviations per dimension.
        scale: DVector<f64>,
    },
}

/// Stateless bijection between `[0,1]^d` and parameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    family: PriorFamily,
}

impl Prior {
    /// Independent uniform prior over per-dimension ranges.
    pub fn uniform(low: Vec<f64>, high: Vec<f64>) -> Result<Self> {
        if low.is_empty() || low.len() != high.len() {
            return Err(Error::Configuration {
                parameter: "low/high".to_string(),
                reason: format!(
                    "uniform prior needs matching non-empty edges, got {} and {}",
                    low.len(),
                    high.len()
                ),
            });
        }
        for (i, (&lo, &hi)) in low.iter().zip(&high).enumerate() {
            if !lo.is_finite() || !hi.is_finite() || hi <= lo {
                return Err(Error::Configuration {
                    parameter: "low/high".to_string(),
                    reason: format!("dimension {i}: range [{lo}, {hi}] is empty or non-finite"),
                });
            }
        }
        Ok(Self {
            family: PriorFamily::Uniform {
                low: DVector::from_vec(low),
                high: DVector::from_vec(high),
            },
        })
    }

    /// Independent diagonal-normal prior.
    pub fn diagonal_normal(loc: Vec<f64>, scale: Vec<f64>) -> Result<Self> {
        if loc.is_empty() || loc.len() != scale.len() {
            return Err(Error::Configuration {
                parameter: "loc/scale".to_string(),
                reason: format!(
                    "diagonal normal prior needs matching non-empty parameters, got {} and {}",
                    loc.len(),
                    scale.len()
                ),
            });
        }
        for (i, (&m, &s)) in loc.iter().zip(&scale).enumerate() {
            if !m.is_finite() || !s.is_finite() || s <= 0.0 {
                return Err(Error::Configuration {
                    parameter: "loc/scale".to_string(),
                    reason: format!("dimension {i}: loc {m}, scale {s} invalid"),
                });
            }
        }
        Ok(Self {
            family: PriorFamily::DiagonalNormal {
                loc: DVector::from_vec(loc),
                scale: DVector::from_vec(scale),
            },
        })
    }

    /// The prior family and its parameters.
    pub fn family(&self) -> &PriorFamily {
        &self.family
    }

    /// Parameter-space dimensionality.
    pub fn n_parameters(&self) -> usize {
        match &self.family {
            PriorFamily::Uniform { low, .. } => low.len(),
            PriorFamily::DiagonalNormal { loc, .. } => loc.len(),
        }
    }

    /// Map unit-cube coordinates to parameter space (rows are samples).
    ///
    /// Cube coordinates are clamped away from exactly 0 and 1 before
    /// quantile inversion so the normal quantile stays finite.
    pub fn transform(&self, u: &DMatrix<f64>) -> DMatrix<f64> {
        let dims: Vec<usize> = (0..self.n_parameters()).collect();
        self.transform_dims(u, &dims)
    }

    /// Map unit-cube coordinates for a subset of dimensions.
    ///
    /// `u` has one column per entry of `dims`, in the same order.
    pub fn transform_dims(&self, u: &DMatrix<f64>, dims: &[usize]) -> DMatrix<f64> {
        let mut v = DMatrix::zeros(u.nrows(), dims.len());
        for (col, &dim) in dims.iter().enumerate() {
            for row in 0..u.nrows() {
                let uu = u[(row, col)].clamp(U_EPS, 1.0 - U_EPS);
                v[(row, col)] = match &self.family {
                    PriorFamily::Uniform { low, high } => {
                        low[dim] + uu * (high[dim] - low[dim])
                    }
                    PriorFamily::DiagonalNormal { loc, scale } => {
                        standard_normal().inverse_cdf(uu) * scale[dim] + loc[dim]
                    }
                };
            }
        }
        v
    }

    /// Map parameter values back to unit-cube coordinates.
    pub fn cdf(&self, v: &DMatrix<f64>) -> DMatrix<f64> {
        let mut u = DMatrix::zeros(v.nrows(), v.ncols());
        for dim in 0..v.ncols() {
            for row in 0..v.nrows() {
                let x = v[(row, dim)];
                u[(row, dim)] = match &self.family {
                    PriorFamily::Uniform { low, high } => {
                        ((x - low[dim]) / (high[dim] - low[dim])).clamp(0.0, 1.0)
                    }
                    PriorFamily::DiagonalNormal { loc, scale } => {
                        standard_normal().cdf((x - loc[dim]) / scale[dim])
                    }
                };
            }
        }
        u
    }

    /// Log-density summed across all dimensions (rows are samples).
    pub fn log_prob(&self, v: &DMatrix<f64>) -> DVector<f64> {
        let dims: Vec<usize> = (0..self.n_parameters()).collect();
        self.log_prob_dims(v, &dims)
    }

    /// Log-density over a subset of dimensions.
    ///
    /// `v_sub` has one column per entry of `dims`. Independence across
    /// dimensions makes the restriction exact.
    pub fn log_prob_dims(&self, v_sub: &DMatrix<f64>, dims: &[usize]) -> DVector<f64> {
        let mut out = DVector::zeros(v_sub.nrows());
        for row in 0..v_sub.nrows() {
            let mut total = 0.0;
            for (col, &dim) in dims.iter().enumerate() {
                let x = v_sub[(row, col)];
                total += match &self.family {
                    PriorFamily::Uniform { low, high } => {
                        if x >= low[dim] && x <= high[dim] {
                            -(high[dim] - low[dim]).ln()
                        } else {
                            f64::NEG_INFINITY
                        }
                    }
                    PriorFamily::DiagonalNormal { loc, scale } => {
                        let z = (x - loc[dim]) / scale[dim];
                        -0.5 * LOG_2PI - scale[dim].ln() - 0.5 * z * z
                    }
                };
            }
            out[row] = total;
        }
        out
    }
}

fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal parameters are valid")
}

/// A prior restricted to a truncation bound.
///
/// Sampling rejection-samples unit-cube proposals against the bound and
/// transforms accepted coordinates; densities are renormalized by the
/// bound volume and vanish outside the accepted region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorTruncator {
    prior: Prior,
    bound: Bound,
}

impl PriorTruncator {
    /// Pair a prior with a bound of matching dimensionality.
    pub fn new(prior: Prior, bound: Bound) -> Result<Self> {
        if prior.n_parameters() != bound.n_dims() {
            return Err(Error::Configuration {
                parameter: "bound".to_string(),
                reason: format!(
                    "bound covers {} dims, prior has {}",
                    bound.n_dims(),
                    prior.n_parameters()
                ),
            });
        }
        Ok(Self { prior, bound })
    }

    /// A truncator over the full unit cube (no truncation).
    pub fn untruncated(prior: Prior) -> Self {
        let bound = Bound::unit_cube(prior.n_parameters());
        Self { prior, bound }
    }

    /// The underlying prior.
    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    /// The active bound.
    pub fn bound(&self) -> &Bound {
        &self.bound
    }

    /// Parameter-space dimensionality.
    pub fn n_parameters(&self) -> usize {
        self.prior.n_parameters()
    }

    /// Draw `n` parameter samples from the truncated prior.
    pub fn sample<R: Rng>(&self, n: usize, rng: &mut R) -> Result<DMatrix<f64>> {
        self.sample_with_u(n, rng).map(|(_, v)| v)
    }

    /// Draw `n` samples, returning both cube coordinates and parameters.
    ///
    /// Cube coordinates feed truncation-rectangle extraction; parameters
    /// feed the simulator and the ratio networks. Proposal batches are
    /// retried until `n` are accepted, bounded by a maximum round count so
    /// a near-zero-volume bound fails loudly instead of spinning.
    pub fn sample_with_u<R: Rng>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<(DMatrix<f64>, DMatrix<f64>)> {
        let d = self.prior.n_parameters();
        if n == 0 {
            return Ok((DMatrix::zeros(0, d), DMatrix::zeros(0, d)));
        }
        let mut accepted: Vec<f64> = Vec::with_capacity(n * d);
        let mut count = 0usize;
        let mut proposal = vec![0.0_f64; d];

        for _round in 0..MAX_REJECTION_ROUNDS {
            // One proposal batch per round; volume ~ acceptance rate.
            for _ in 0..n.max(1) {
                for slot in proposal.iter_mut() {
                    *slot = rng.random();
                }
                if self.bound.contains(&proposal) {
                    accepted.extend_from_slice(&proposal);
                    count += 1;
                    if count == n {
                        let u = DMatrix::from_row_slice(n, d, &accepted);
                        let v = self.prior.transform(&u);
                        return Ok((u, v));
                    }
                }
            }
        }

        Err(Error::DegenerateBound {
            reason: format!(
                "rejection sampler accepted {count} of {n} samples after {MAX_REJECTION_ROUNDS} \
                 proposal rounds; bound volume is effectively zero"
            ),
        })
    }

    /// Log-density of the truncated prior (rows are samples).
    ///
    /// `prior.log_prob(v) - ln(volume)` inside the bound, `-inf` outside.
    pub fn log_prob(&self, v: &DMatrix<f64>) -> DVector<f64> {
        let u = self.prior.cdf(v);
        let base = self.prior.log_prob(v);
        let log_volume = self.bound.volume().ln();
        let mut out = DVector::zeros(v.nrows());
        let mut row_buf = vec![0.0_f64; u.ncols()];
        for row in 0..v.nrows() {
            for (col, slot) in row_buf.iter_mut().enumerate() {
                *slot = u[(row, col)];
            }
            out[row] = if self.bound.contains(&row_buf) {
                base[row] - log_volume
            } else {
                f64::NEG_INFINITY
            };
        }
        out
    }
}
