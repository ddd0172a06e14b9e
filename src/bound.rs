//! Truncation bounds over the unit hypercube.
//!
//! A bound is a region-of-support mask over `[0,1]^d` together with its
//! volume. The initial bound is the full cube (volume exactly 1). Each
//! truncation round replaces it with a rectangular or composite subregion
//! extracted from estimated log-ratios; the volume of the new region is
//! estimated with the nested Monte-Carlo estimator
//! `old_volume * acceptance_fraction`, which keeps posterior normalization
//! correct across rounds.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_RATIO_THRESHOLD;
use crate::error::{Error, Result};
use crate::marginal::Marginal;

/// Per-dimension `[low, high)` intervals covering every dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RectangleBound {
    intervals: Vec<(f64, f64)>,
    volume: f64,
}

impl RectangleBound {
    /// Build a rectangle from unit-cube intervals.
    ///
    /// The volume defaults to the analytic product of interval widths.
    pub fn new(intervals: Vec<(f64, f64)>) -> Result<Self> {
        let volume = validate_intervals(&intervals)?;
        Ok(Self { intervals, volume })
    }

    /// Build a rectangle with an externally estimated volume.
    ///
    /// Used when the volume comes from the nested Monte-Carlo estimator
    /// rather than the analytic interval product.
    pub fn with_volume(intervals: Vec<(f64, f64)>, volume: f64) -> Result<Self> {
        validate_intervals(&intervals)?;
        if !(volume > 0.0) || volume > 1.0 {
            return Err(Error::DegenerateBound {
                reason: format!("rectangle volume {volume} outside (0, 1]"),
            });
        }
        Ok(Self { intervals, volume })
    }

    /// The per-dimension intervals.
    pub fn intervals(&self) -> &[(f64, f64)] {
        &self.intervals
    }

    fn contains(&self, u: &[f64]) -> bool {
        self.intervals
            .iter()
            .zip(u)
            .all(|(&(lo, hi), &x)| x >= lo && x <= hi)
    }
}

/// Intersection of per-marginal rectangles.
///
/// Each member constrains only the dimensions of its marginal; a point is
/// accepted iff it lies inside every member's intervals. When two members
/// share a dimension the intersection applies, so the narrower interval
/// wins. The intersected per-dimension intervals are precomputed at
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeBound {
    members: Vec<(Marginal, Vec<(f64, f64)>)>,
    intersected: Vec<(f64, f64)>,
    volume: f64,
}

impl CompositeBound {
    /// Assemble a composite bound from per-marginal interval sets.
    ///
    /// `n_dims` is the full parameter dimensionality; dimensions no member
    /// constrains keep the full `[0, 1]` interval.
    pub fn new(
        n_dims: usize,
        members: Vec<(Marginal, Vec<(f64, f64)>)>,
        volume: f64,
    ) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::DegenerateBound {
                reason: "composite bound has no members".to_string(),
            });
        }
        let mut intersected = vec![(0.0_f64, 1.0_f64); n_dims];
        for (marginal, intervals) in &members {
            if marginal.len() != intervals.len() {
                return Err(Error::DegenerateBound {
                    reason: format!(
                        "marginal {marginal} supplies {} intervals for {} dimensions",
                        intervals.len(),
                        marginal.len()
                    ),
                });
            }
            for (&dim, &(lo, hi)) in marginal.indices().iter().zip(intervals) {
                if dim >= n_dims {
                    return Err(Error::DegenerateBound {
                        reason: format!("marginal dimension {dim} out of range for {n_dims} dims"),
                    });
                }
                let slot = &mut intersected[dim];
                slot.0 = slot.0.max(lo);
                slot.1 = slot.1.min(hi);
            }
        }
        validate_intervals(&intersected)?;
        if !(volume > 0.0) || volume > 1.0 {
            return Err(Error::DegenerateBound {
                reason: format!("composite volume {volume} outside (0, 1]"),
            });
        }
        Ok(Self {
            members,
            intersected,
            volume,
        })
    }

    /// The constituent marginals and their intervals.
    pub fn members(&self) -> &[(Marginal, Vec<(f64, f64)>)] {
        &self.members
    }

    fn contains(&self, u: &[f64]) -> bool {
        self.intersected
            .iter()
            .zip(u)
            .all(|(&(lo, hi), &x)| x >= lo && x <= hi)
    }
}

/// Region-of-support mask over the unit hypercube, plus its volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Bound {
    /// The full cube: accepts everything, volume exactly 1.
    UnitCube {
        /// Parameter dimensionality.
        n_dims: usize,
    },
    /// Axis-aligned box constraining every dimension.
    Rectangle(RectangleBound),
    /// Intersection of per-marginal rectangles.
    Composite(CompositeBound),
}

impl Bound {
    /// The initial full-cube bound.
    pub fn unit_cube(n_dims: usize) -> Self {
        Bound::UnitCube { n_dims }
    }

    /// A rectangular bound with the analytic interval-product volume.
    pub fn rectangle(intervals: Vec<(f64, f64)>) -> Result<Self> {
        RectangleBound::new(intervals).map(Bound::Rectangle)
    }

    /// Parameter dimensionality this bound applies to.
    pub fn n_dims(&self) -> usize {
        match self {
            Bound::UnitCube { n_dims } => *n_dims,
            Bound::Rectangle(rect) => rect.intervals.len(),
            Bound::Composite(comp) => comp.intersected.len(),
        }
    }

    /// Whether a unit-cube point lies inside the accepted region.
    pub fn contains(&self, u: &[f64]) -> bool {
        match self {
            Bound::UnitCube { .. } => u.iter().all(|&x| (0.0..=1.0).contains(&x)),
            Bound::Rectangle(rect) => rect.contains(u),
            Bound::Composite(comp) => comp.contains(u),
        }
    }

    /// Measure of the accepted region.
    ///
    /// For truncated bounds this is the nested Monte-Carlo estimate carried
    /// from construction, used to renormalize densities.
    pub fn volume(&self) -> f64 {
        match self {
            Bound::UnitCube { .. } => 1.0,
            Bound::Rectangle(rect) => rect.volume,
            Bound::Composite(comp) => comp.volume,
        }
    }

    /// The `[low, high]` interval constraining one dimension.
    pub fn interval(&self, dim: usize) -> (f64, f64) {
        match self {
            Bound::UnitCube { .. } => (0.0, 1.0),
            Bound::Rectangle(rect) => rect.intervals[dim],
            Bound::Composite(comp) => comp.intersected[dim],
        }
    }

    /// Analytic measure of the region restricted to a subset of dimensions.
    ///
    /// Marginal posterior evaluation normalizes per-marginal densities by
    /// the interval product over just that marginal's dimensions.
    pub fn restricted_volume(&self, dims: &[usize]) -> f64 {
        dims.iter()
            .map(|&d| {
                let (lo, hi) = self.interval(d);
                hi - lo
            })
            .product()
    }
}

/// Per-marginal log-ratio evaluations used for rectangle extraction.
pub type MarginalLogRatios = BTreeMap<Marginal, DVector<f64>>;

/// Derive a truncation bound from estimated log-ratios.
///
/// `u` holds unit-cube coordinates of samples drawn from the *old*
/// truncated prior (rows are samples); `logratios` holds each marginal's
/// estimated log-ratio per sample. For each marginal, samples whose ratio
/// is within `threshold` of the best sample's ratio define the minimal
/// axis-aligned rectangle over that marginal's dimensions. The rectangles
/// intersect into a composite bound whose volume is
/// `old.volume() * acceptance_fraction` over the input samples.
///
/// Fails with [`Error::DegenerateBound`] when a marginal's mask selects no
/// samples, when all log-ratios are non-finite, or when the intersection
/// collapses to zero width.
pub fn truncate_bound(
    u: &DMatrix<f64>,
    logratios: &MarginalLogRatios,
    threshold: f64,
    old: &Bound,
) -> Result<Bound> {
    let n = u.nrows();
    let n_dims = old.n_dims();
    if u.ncols() != n_dims {
        return Err(Error::Configuration {
            parameter: "u".to_string(),
            reason: format!("samples have {} columns, bound has {n_dims}", u.ncols()),
        });
    }
    if n == 0 {
        return Err(Error::DegenerateBound {
            reason: "no samples supplied for truncation".to_string(),
        });
    }
    if !(threshold > 0.0) || threshold >= 1.0 {
        return Err(Error::Configuration {
            parameter: "threshold".to_string(),
            reason: format!("ratio threshold {threshold} outside (0, 1)"),
        });
    }
    let log_threshold = threshold.ln();

    let mut members = Vec::with_capacity(logratios.len());
    for (marginal, ratios) in logratios {
        if ratios.len() != n {
            return Err(Error::Configuration {
                parameter: "logratios".to_string(),
                reason: format!(
                    "marginal {marginal} has {} ratios for {n} samples",
                    ratios.len()
                ),
            });
        }
        let max = ratios.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(Error::DegenerateBound {
                reason: format!("marginal {marginal}: no finite log-ratio among {n} samples"),
            });
        }

        // Keep samples whose ratio is within `threshold` of the peak.
        let kept: Vec<usize> = (0..n)
            .filter(|&i| ratios[i] - max > log_threshold)
            .collect();
        if kept.is_empty() {
            return Err(Error::DegenerateBound {
                reason: format!("marginal {marginal}: threshold mask selected zero samples"),
            });
        }

        let intervals: Vec<(f64, f64)> = marginal
            .indices()
            .iter()
            .map(|&dim| {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for &i in &kept {
                    let x = u[(i, dim)];
                    lo = lo.min(x);
                    hi = hi.max(x);
                }
                (lo, hi)
            })
            .collect();
        members.push((marginal.clone(), intervals));
    }

    if members.is_empty() {
        return Err(Error::DegenerateBound {
            reason: "no marginals supplied for truncation".to_string(),
        });
    }

    // Nested Monte-Carlo volume estimate: input samples come from the old
    // truncated prior, so the accepted fraction scales the old volume.
    let candidate = CompositeBound::new(n_dims, members.clone(), 1.0)?;
    let accepted = (0..n)
        .filter(|&i| {
            let row: Vec<f64> = u.row(i).iter().copied().collect();
            candidate.contains(&row)
        })
        .count();
    if accepted == 0 {
        return Err(Error::DegenerateBound {
            reason: "intersected bound accepts none of the input samples".to_string(),
        });
    }
    let volume = old.volume() * accepted as f64 / n as f64;

    tracing::debug!(
        accepted,
        total = n,
        volume,
        "extracted truncation bound from log-ratios"
    );

    if members.len() == 1 {
        // One marginal: a plain rectangle with [0,1] on unconstrained dims.
        let (marginal, intervals) = &members[0];
        let mut full = vec![(0.0, 1.0); n_dims];
        for (&dim, &iv) in marginal.indices().iter().zip(intervals) {
            full[dim] = iv;
        }
        Ok(Bound::Rectangle(RectangleBound::with_volume(full, volume)?))
    } else {
        Ok(Bound::Composite(CompositeBound::new(
            n_dims, members, volume,
        )?))
    }
}

/// Truncate with the default ratio threshold.
pub fn truncate_bound_default(
    u: &DMatrix<f64>,
    logratios: &MarginalLogRatios,
    old: &Bound,
) -> Result<Bound> {
    truncate_bound(u, logratios, DEFAULT_RATIO_THRESHOLD, old)
}

fn validate_intervals(intervals: &[(f64, f64)]) -> Result<f64> {
    if intervals.is_empty() {
        return Err(Error::DegenerateBound {
            reason: "bound has zero dimensions".to_string(),
        });
    }
    let mut volume = 1.0;
    for (dim, &(lo, hi)) in intervals.iter().enumerate() {
        if !lo.is_finite() || !hi.is_finite() || lo < 0.0 || hi > 1.0 {
            return Err(Error::DegenerateBound {
                reason: format!("dimension {dim}: interval [{lo}, {hi}] outside the unit cube"),
            });
        }
        if hi <= lo {
            return Err(Error::DegenerateBound {
                reason: format!("dimension {dim}: interval [{lo}, {hi}] has non-positive width"),
            });
        }
        volume *= hi - lo;
    }
    Ok(volume)
}
