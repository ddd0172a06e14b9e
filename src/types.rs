//! Observation types and common aliases.
//!
//! The forward model maps a batch of parameter vectors to a dictionary of
//! named, fixed-shape observation arrays. Internally the crate flattens the
//! dictionary into one feature vector per sample, concatenating keys in
//! sorted order so the layout is deterministic.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single observation: named arrays with fixed shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    fields: BTreeMap<String, DVector<f64>>,
}

impl Observation {
    /// Create an observation from named arrays.
    pub fn new(fields: BTreeMap<String, DVector<f64>>) -> Self {
        Self { fields }
    }

    /// Create an observation with a single field.
    pub fn single(key: impl Into<String>, values: DVector<f64>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(key.into(), values);
        Self { fields }
    }

    /// Field names in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Look up one field by name.
    pub fn get(&self, key: &str) -> Option<&DVector<f64>> {
        self.fields.get(key)
    }

    /// Total flattened length across all fields.
    pub fn flat_len(&self) -> usize {
        self.fields.values().map(DVector::len).sum()
    }

    /// Flatten all fields into one vector, keys in sorted order.
    pub fn flatten(&self) -> DVector<f64> {
        let mut out = Vec::with_capacity(self.flat_len());
        for values in self.fields.values() {
            out.extend_from_slice(values.as_slice());
        }
        DVector::from_vec(out)
    }

    /// Check that this observation has the same keys and shapes as another.
    pub fn layout_matches(&self, other: &Observation) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(other.fields.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.len() == vb.len())
    }
}

/// A batch of observations produced by one simulator call.
///
/// Each key maps to a matrix whose rows correspond to the rows of the
/// parameter batch passed to the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationBatch {
    fields: BTreeMap<String, DMatrix<f64>>,
    n_samples: usize,
}

impl ObservationBatch {
    /// Create a batch from named matrices, validating consistent row counts.
    pub fn new(fields: BTreeMap<String, DMatrix<f64>>) -> Result<Self> {
        let mut n_samples = None;
        for (key, values) in &fields {
            match n_samples {
                None => n_samples = Some(values.nrows()),
                Some(n) if n != values.nrows() => {
                    return Err(Error::Simulation {
                        reason: format!(
                            "observation field `{key}` has {} rows, expected {n}",
                            values.nrows()
                        ),
                    });
                }
                Some(_) => {}
            }
        }
        let n_samples = n_samples.ok_or_else(|| Error::Simulation {
            reason: "observation batch has no fields".to_string(),
        })?;
        Ok(Self { fields, n_samples })
    }

    /// Create a batch with a single field.
    pub fn single(key: impl Into<String>, values: DMatrix<f64>) -> Result<Self> {
        let mut fields = BTreeMap::new();
        fields.insert(key.into(), values);
        Self::new(fields)
    }

    /// Number of samples (rows) in the batch.
    pub fn len(&self) -> usize {
        self.n_samples
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.n_samples == 0
    }

    /// Extract the observation at one row.
    pub fn row(&self, index: usize) -> Observation {
        let fields = self
            .fields
            .iter()
            .map(|(key, values)| (key.clone(), values.row(index).transpose()))
            .collect();
        Observation::new(fields)
    }

    /// Split the batch into per-row observations.
    pub fn into_rows(self) -> Vec<Observation> {
        (0..self.n_samples).map(|i| self.row(i)).collect()
    }
}

/// The forward-model collaborator contract.
///
/// Maps a parameter batch (rows are samples) to a batch of observations.
/// Failures are reported as strings and wrapped in [`Error::Simulation`].
pub trait Simulator {
    /// Simulate observations for every row of `v`.
    fn simulate(&mut self, v: &DMatrix<f64>) -> std::result::Result<ObservationBatch, String>;
}

impl<F> Simulator for F
where
    F: FnMut(&DMatrix<f64>) -> std::result::Result<ObservationBatch, String>,
{
    fn simulate(&mut self, v: &DMatrix<f64>) -> std::result::Result<ObservationBatch, String> {
        self(v)
    }
}
