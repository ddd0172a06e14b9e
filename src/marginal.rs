//! Canonical marginal indices.
//!
//! Users describe which parameter subsets ("marginals") to estimate in a
//! few loose shapes: a bare index, a flat list of indices (each its own
//! 1-D marginal), or nested lists (each inner list one joint marginal).
//! This module normalizes all of them into one strict, hashable, ordered
//! representation that the rest of the crate uses as a map key. Nothing
//! downstream ever branches on the loose input shape again.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One parameter subset: sorted, de-duplicated indices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Marginal(Vec<usize>);

impl Marginal {
    /// Build a marginal from raw indices, sorting and de-duplicating.
    pub fn new(indices: impl Into<Vec<usize>>) -> Result<Self> {
        let mut indices = indices.into();
        if indices.is_empty() {
            return Err(Error::InvalidMarginal {
                reason: "marginal group must contain at least one parameter index".to_string(),
            });
        }
        indices.sort_unstable();
        indices.dedup();
        Ok(Self(indices))
    }

    /// The sorted parameter indices in this marginal.
    pub fn indices(&self) -> &[usize] {
        &self.0
    }

    /// Number of parameter dimensions this marginal covers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Marginals are never empty; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Largest parameter index referenced.
    pub fn max_index(&self) -> usize {
        *self.0.last().expect("marginal groups are non-empty")
    }
}

impl fmt::Display for Marginal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, idx) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{idx}")?;
        }
        write!(f, ")")
    }
}

/// Loose user input for marginal selection.
///
/// A bare index `k` means the 1-D marginal over parameter `k`. A flat list
/// `[a, b]` means two separate 1-D marginals. A nested list `[[a, b]]`
/// means one joint 2-D marginal over `a` and `b`.
#[derive(Debug, Clone)]
pub enum MarginalSpec {
    /// A single 1-D marginal.
    Single(usize),
    /// Several 1-D marginals, one per index.
    Flat(Vec<usize>),
    /// Explicit groups, each one joint marginal.
    Nested(Vec<Vec<usize>>),
}

impl From<usize> for MarginalSpec {
    fn from(index: usize) -> Self {
        MarginalSpec::Single(index)
    }
}

impl From<Vec<usize>> for MarginalSpec {
    fn from(indices: Vec<usize>) -> Self {
        MarginalSpec::Flat(indices)
    }
}

impl From<&[usize]> for MarginalSpec {
    fn from(indices: &[usize]) -> Self {
        MarginalSpec::Flat(indices.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for MarginalSpec {
    fn from(indices: [usize; N]) -> Self {
        MarginalSpec::Flat(indices.to_vec())
    }
}

impl From<Vec<Vec<usize>>> for MarginalSpec {
    fn from(groups: Vec<Vec<usize>>) -> Self {
        MarginalSpec::Nested(groups)
    }
}

impl From<&MarginalIndex> for MarginalSpec {
    fn from(index: &MarginalIndex) -> Self {
        MarginalSpec::Nested(index.groups().iter().map(|m| m.0.clone()).collect())
    }
}

/// Canonical, ordered set of marginals.
///
/// Immutable once constructed. Equal semantic inputs normalize to equal
/// values regardless of input order or nesting style, so this type is safe
/// to use as a map key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MarginalIndex(Vec<Marginal>);

impl MarginalIndex {
    /// Normalize loose input into the canonical form.
    ///
    /// Inner groups are sorted and de-duplicated; the outer sequence is
    /// sorted and de-duplicated as well, giving one canonical order.
    pub fn new(spec: impl Into<MarginalSpec>) -> Result<Self> {
        let groups: Vec<Vec<usize>> = match spec.into() {
            MarginalSpec::Single(index) => vec![vec![index]],
            MarginalSpec::Flat(indices) => {
                if indices.is_empty() {
                    return Err(Error::InvalidMarginal {
                        reason: "marginal specification is empty".to_string(),
                    });
                }
                indices.into_iter().map(|i| vec![i]).collect()
            }
            MarginalSpec::Nested(groups) => {
                if groups.is_empty() {
                    return Err(Error::InvalidMarginal {
                        reason: "marginal specification is empty".to_string(),
                    });
                }
                groups
            }
        };

        let mut marginals = groups
            .into_iter()
            .map(Marginal::new)
            .collect::<Result<Vec<_>>>()?;
        marginals.sort();
        marginals.dedup();
        Ok(Self(marginals))
    }

    /// Build a marginal index covering each of the first `n` parameters
    /// as its own 1-D marginal.
    pub fn each_of(n_parameters: usize) -> Result<Self> {
        Self::new((0..n_parameters).collect::<Vec<_>>())
    }

    /// The canonical groups, in order.
    pub fn groups(&self) -> &[Marginal] {
        &self.0
    }

    /// Number of marginals.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the index holds no marginals (never true after `new`).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the groups.
    pub fn iter(&self) -> impl Iterator<Item = &Marginal> {
        self.0.iter()
    }

    /// Largest parameter index referenced by any group.
    pub fn max_index(&self) -> usize {
        self.0
            .iter()
            .map(Marginal::max_index)
            .max()
            .expect("marginal indices are non-empty")
    }

    /// Check every referenced index against the parameter dimensionality.
    pub fn validate_against(&self, n_parameters: usize) -> Result<()> {
        let max = self.max_index();
        if max >= n_parameters {
            return Err(Error::InvalidMarginal {
                reason: format!(
                    "parameter index {max} out of range for {n_parameters}-dimensional prior"
                ),
            });
        }
        Ok(())
    }

    /// Union of all constrained parameter dimensions, sorted.
    pub fn constrained_dims(&self) -> Vec<usize> {
        let mut dims: Vec<usize> = self
            .0
            .iter()
            .flat_map(|m| m.indices().iter().copied())
            .collect();
        dims.sort_unstable();
        dims.dedup();
        dims
    }
}

impl fmt::Display for MarginalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, group) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{group}")?;
        }
        write!(f, "]")
    }
}
