//! Storage for simulated training pairs.
//!
//! A dataset accumulates parameter draws (in both unit-cube and parameter
//! coordinates) together with their simulated observations. Parameters can
//! be appended before their simulations exist; training refuses to start
//! until every pending simulation is filled in.

use nalgebra::DMatrix;

use crate::bound::Bound;
use crate::error::{Error, Result};
use crate::types::{Observation, Simulator};

/// Parameter draws paired with (possibly pending) observations.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    n_parameters: usize,
    u: DMatrix<f64>,
    v: DMatrix<f64>,
    observations: Vec<Option<Observation>>,
}

impl Dataset {
    /// Create an empty dataset for the given parameter dimensionality.
    pub fn new(n_parameters: usize) -> Result<Self> {
        if n_parameters == 0 {
            return Err(Error::Configuration {
                parameter: "n_parameters".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(Self {
            n_parameters,
            u: DMatrix::zeros(0, n_parameters),
            v: DMatrix::zeros(0, n_parameters),
            observations: Vec::new(),
        })
    }

    /// Parameter dimensionality.
    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// Whether the dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Number of pairs still waiting for a simulation.
    pub fn n_pending(&self) -> usize {
        self.observations.iter().filter(|o| o.is_none()).count()
    }

    /// Whether any pair still needs simulating.
    pub fn requires_simulation(&self) -> bool {
        self.n_pending() > 0
    }

    /// Unit-cube coordinates, one row per pair.
    pub fn u(&self) -> &DMatrix<f64> {
        &self.u
    }

    /// Parameter values, one row per pair.
    pub fn v(&self) -> &DMatrix<f64> {
        &self.v
    }

    /// The observation stored for one pair, if simulated.
    pub fn observation(&self, index: usize) -> Option<&Observation> {
        self.observations.get(index).and_then(Option::as_ref)
    }

    /// Append parameter draws without observations.
    ///
    /// Rows of `u` and `v` correspond; observations stay pending until
    /// [`Dataset::simulate_missing`] fills them in.
    pub fn append_pending(&mut self, u: DMatrix<f64>, v: DMatrix<f64>) -> Result<()> {
        self.check_batch(&u, &v)?;
        let n_new = u.nrows();
        self.u = stack_rows(&self.u, &u);
        self.v = stack_rows(&self.v, &v);
        self.observations.extend((0..n_new).map(|_| None));
        Ok(())
    }

    /// Append parameter draws with their observations.
    pub fn append(
        &mut self,
        u: DMatrix<f64>,
        v: DMatrix<f64>,
        observations: Vec<Observation>,
    ) -> Result<()> {
        self.check_batch(&u, &v)?;
        if observations.len() != u.nrows() {
            return Err(Error::Simulation {
                reason: format!(
                    "{} observations for {} parameter rows",
                    observations.len(),
                    u.nrows()
                ),
            });
        }
        for obs in &observations {
            self.check_layout(obs)?;
        }
        self.u = stack_rows(&self.u, &u);
        self.v = stack_rows(&self.v, &v);
        self.observations.extend(observations.into_iter().map(Some));
        Ok(())
    }

    /// Run the simulator for every pending pair, returning how many were
    /// filled in.
    pub fn simulate_missing(&mut self, simulator: &mut impl Simulator) -> Result<usize> {
        let pending: Vec<usize> = self
            .observations
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.is_none().then_some(i))
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let batch = DMatrix::from_fn(pending.len(), self.n_parameters, |r, c| {
            self.v[(pending[r], c)]
        });
        let simulated = simulator
            .simulate(&batch)
            .map_err(|reason| Error::Simulation { reason })?;
        if simulated.len() != pending.len() {
            return Err(Error::Simulation {
                reason: format!(
                    "simulator returned {} rows for {} parameter rows",
                    simulated.len(),
                    pending.len()
                ),
            });
        }

        let rows = simulated.into_rows();
        for obs in &rows {
            self.check_layout(obs)?;
        }
        let n_filled = rows.len();
        for (index, obs) in pending.into_iter().zip(rows) {
            self.observations[index] = Some(obs);
        }
        tracing::debug!(n_filled, total = self.len(), "filled pending simulations");
        Ok(n_filled)
    }

    /// All observations, or [`Error::DataNotReady`] if any are pending.
    pub fn observations(&self) -> Result<Vec<&Observation>> {
        let missing = self.n_pending();
        if missing > 0 {
            return Err(Error::DataNotReady {
                missing,
                total: self.len(),
            });
        }
        Ok(self.observations.iter().flatten().collect())
    }

    /// Flattened observation features, one row per pair.
    ///
    /// Fails with [`Error::DataNotReady`] while simulations are pending.
    pub fn observation_matrix(&self) -> Result<DMatrix<f64>> {
        let observations = self.observations()?;
        let flat_len = observations
            .first()
            .map(|o| o.flat_len())
            .unwrap_or_default();
        let flattened: Vec<_> = observations.iter().map(|o| o.flatten()).collect();
        Ok(DMatrix::from_fn(flattened.len(), flat_len, |r, c| {
            flattened[r][c]
        }))
    }

    /// Restrict to pairs whose cube coordinates fall inside `bound`.
    pub fn filtered(&self, bound: &Bound) -> Result<Dataset> {
        if bound.n_dims() != self.n_parameters {
            return Err(Error::Configuration {
                parameter: "bound".to_string(),
                reason: format!(
                    "bound covers {} dimensions, dataset has {}",
                    bound.n_dims(),
                    self.n_parameters
                ),
            });
        }
        let kept: Vec<usize> = (0..self.len())
            .filter(|&i| {
                let row: Vec<f64> = self.u.row(i).iter().copied().collect();
                bound.contains(&row)
            })
            .collect();

        let u = DMatrix::from_fn(kept.len(), self.n_parameters, |r, c| self.u[(kept[r], c)]);
        let v = DMatrix::from_fn(kept.len(), self.n_parameters, |r, c| self.v[(kept[r], c)]);
        let observations = kept
            .iter()
            .map(|&i| self.observations[i].clone())
            .collect();
        Ok(Dataset {
            n_parameters: self.n_parameters,
            u,
            v,
            observations,
        })
    }

    fn check_batch(&self, u: &DMatrix<f64>, v: &DMatrix<f64>) -> Result<()> {
        if u.ncols() != self.n_parameters || v.ncols() != self.n_parameters {
            return Err(Error::Configuration {
                parameter: "v".to_string(),
                reason: format!(
                    "expected {} parameter columns, got u: {}, v: {}",
                    self.n_parameters,
                    u.ncols(),
                    v.ncols()
                ),
            });
        }
        if u.nrows() != v.nrows() {
            return Err(Error::Configuration {
                parameter: "v".to_string(),
                reason: format!("u has {} rows, v has {}", u.nrows(), v.nrows()),
            });
        }
        Ok(())
    }

    /// New observations must share key names and shapes with stored ones.
    fn check_layout(&self, obs: &Observation) -> Result<()> {
        if let Some(existing) = self.observations.iter().flatten().next() {
            if !existing.layout_matches(obs) {
                return Err(Error::Simulation {
                    reason: "observation layout differs from previously stored observations"
                        .to_string(),
                });
            }
        }
        Ok(())
    }
}

fn stack_rows(top: &DMatrix<f64>, bottom: &DMatrix<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(top.nrows() + bottom.nrows(), top.ncols(), |r, c| {
        if r < top.nrows() {
            top[(r, c)]
        } else {
            bottom[(r - top.nrows(), c)]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObservationBatch;
    use nalgebra::DVector;

    fn noisy_identity(v: &DMatrix<f64>) -> std::result::Result<ObservationBatch, String> {
        ObservationBatch::single("x", v.clone()).map_err(|e| e.to_string())
    }

    #[test]
    fn pending_pairs_block_feature_extraction() {
        let mut dataset = Dataset::new(2).expect("valid");
        dataset
            .append_pending(DMatrix::zeros(3, 2), DMatrix::zeros(3, 2))
            .expect("append");

        assert_eq!(dataset.n_pending(), 3);
        match dataset.observation_matrix() {
            Err(Error::DataNotReady { missing, total }) => {
                assert_eq!(missing, 3);
                assert_eq!(total, 3);
            }
            other => panic!("expected DataNotReady, got {other:?}"),
        }
    }

    #[test]
    fn simulate_missing_fills_only_pending_rows() {
        let mut dataset = Dataset::new(2).expect("valid");
        let v = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        let obs = ObservationBatch::single("x", v.clone())
            .expect("valid")
            .into_rows();
        dataset
            .append(DMatrix::zeros(2, 2), v, obs)
            .expect("append");
        dataset
            .append_pending(
                DMatrix::zeros(1, 2),
                DMatrix::from_row_slice(1, 2, &[5.0, 6.0]),
            )
            .expect("append");

        let filled = dataset
            .simulate_missing(&mut noisy_identity)
            .expect("simulate");
        assert_eq!(filled, 1);
        assert!(!dataset.requires_simulation());
        assert_eq!(
            dataset.observation(2).expect("filled").flatten().as_slice(),
            &[5.0, 6.0]
        );
    }

    #[test]
    fn observation_matrix_flattens_per_row() {
        let mut dataset = Dataset::new(2).expect("valid");
        let v = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        dataset
            .append_pending(DMatrix::zeros(2, 2), v)
            .expect("append");
        dataset
            .simulate_missing(&mut noisy_identity)
            .expect("simulate");

        let x = dataset.observation_matrix().expect("complete");
        assert_eq!(x, DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn layout_mismatch_is_rejected() {
        let mut dataset = Dataset::new(1).expect("valid");
        let v = DMatrix::from_row_slice(1, 1, &[1.0]);
        let obs = vec![Observation::single("x", DVector::from_vec(vec![1.0]))];
        dataset
            .append(DMatrix::zeros(1, 1), v.clone(), obs)
            .expect("append");

        let wrong = vec![Observation::single("y", DVector::from_vec(vec![1.0]))];
        assert!(dataset.append(DMatrix::zeros(1, 1), v, wrong).is_err());
    }

    #[test]
    fn filtering_keeps_rows_inside_the_bound() {
        let mut dataset = Dataset::new(1).expect("valid");
        let u = DMatrix::from_row_slice(4, 1, &[0.1, 0.4, 0.6, 0.9]);
        let v = u.clone();
        dataset.append_pending(u, v).expect("append");
        dataset
            .simulate_missing(&mut noisy_identity)
            .expect("simulate");

        let bound = Bound::rectangle(vec![(0.3, 0.7)]).expect("valid bound");
        let inside = dataset.filtered(&bound).expect("filter");
        assert_eq!(inside.len(), 2);
        assert_eq!(inside.u().as_slice(), &[0.4, 0.6]);
    }
}
