//! Error types for inference operations.
//!
//! Construction-time misconfiguration, incomplete simulation data,
//! degenerate truncation bounds, and unsupported operations all fail fast
//! with a dedicated variant; none are silently coerced or retried, except
//! the bounded proposal loop inside the truncated-prior rejection sampler.

use std::fmt;

/// Errors raised by ratio estimation, truncation, and posterior sampling.
#[derive(Debug)]
pub enum Error {
    /// Malformed marginal index: empty groups, duplicate or out-of-range
    /// parameter indices.
    InvalidMarginal {
        /// Description of the malformation.
        reason: String,
    },

    /// Invalid configuration value detected at construction time.
    Configuration {
        /// Name of the offending parameter.
        parameter: String,
        /// Constraint that was violated.
        reason: String,
    },

    /// Training requested while some dataset rows have no simulation yet.
    DataNotReady {
        /// Number of rows still awaiting simulation.
        missing: usize,
        /// Total number of rows in the dataset.
        total: usize,
    },

    /// Truncation produced an empty or zero-volume region.
    ///
    /// Raised instead of returning a degenerate bound, since a zero volume
    /// corrupts every downstream density normalization.
    DegenerateBound {
        /// What made the bound degenerate.
        reason: String,
    },

    /// Operation not supported for this estimator configuration.
    UnsupportedOperation {
        /// The operation that was requested.
        operation: String,
        /// Why it cannot be performed.
        reason: String,
    },

    /// The forward-model collaborator reported a failure.
    Simulation {
        /// Error reported by the simulator.
        reason: String,
    },

    /// State-dict encode/decode failure.
    Serialization {
        /// Underlying serializer message.
        reason: String,
    },

    /// I/O failure while persisting or loading state.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidMarginal { reason } => {
                write!(f, "invalid marginal index: {reason}")
            }
            Error::Configuration { parameter, reason } => {
                write!(f, "invalid configuration for `{parameter}`: {reason}")
            }
            Error::DataNotReady { missing, total } => {
                write!(
                    f,
                    "dataset not ready for training: {missing} of {total} rows await simulation"
                )
            }
            Error::DegenerateBound { reason } => {
                write!(f, "degenerate truncation bound: {reason}")
            }
            Error::UnsupportedOperation { operation, reason } => {
                write!(f, "unsupported operation `{operation}`: {reason}")
            }
            Error::Simulation { reason } => {
                write!(f, "simulator failure: {reason}")
            }
            Error::Serialization { reason } => {
                write!(f, "state serialization failed: {reason}")
            }
            Error::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization {
            reason: err.to_string(),
        }
    }
}

/// Result alias for inference operations.
pub type Result<T> = std::result::Result<T, Error>;
