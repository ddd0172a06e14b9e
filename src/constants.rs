//! Numeric constants shared across the crate.

/// ln(2π), used in normal log-density computations.
pub const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Default likelihood-ratio threshold for rectangle extraction.
///
/// Samples whose estimated ratio falls below `threshold` times the best
/// sample's ratio are excluded from the truncation rectangle.
pub const DEFAULT_RATIO_THRESHOLD: f64 = 1e-6;

/// Clamp applied to unit-cube coordinates before quantile inversion.
///
/// The standard normal quantile diverges at 0 and 1; clamping keeps the
/// transform finite without measurably biasing samples.
pub const U_EPS: f64 = 1e-12;

/// Maximum proposal rounds for the truncated-prior rejection sampler.
///
/// Each round proposes a full batch; exhausting all rounds means the bound
/// volume is effectively zero relative to the proposal distribution.
pub const MAX_REJECTION_ROUNDS: usize = 1000;

/// Default seed used when callers do not supply one.
pub const DEFAULT_SEED: u64 = 42;

/// Default evaluation batch size for ratio evaluation.
pub const DEFAULT_EVAL_BATCH: usize = 100;
