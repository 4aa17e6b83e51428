//! Error types for mechanism evaluation and edge bookkeeping.

use thiserror::Error;

/// Errors that can occur while fitting, evaluating or restoring a mechanism.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in the future without breaking changes.
///
/// None of these are retried inside the crate. A structure-search driver decides
/// whether to abort the step or skip the offending edge. Clamping a sampled
/// noise variance up to the floor is not an error and never surfaces here.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MechanismError {
    /// Input/target rank or batch-size disagreement.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// An edge key string that cannot be decoded (missing `<-`, empty or duplicate ids).
    #[error("malformed edge key: {0}")]
    MalformedKey(String),

    /// An operation addressed an edge that was never created.
    #[error("unknown edge key: {0}")]
    UnknownEdgeKey(String),

    /// A parent id that has no column in the shared covariate table.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// A root mechanism holds exactly one posterior and cannot be fit to a batch of datasets.
    #[error("root mechanisms keep a single posterior; set_data expects exactly one dataset")]
    MultiplePosteriorSetsUnsupported,

    /// Configuration values outside their valid domain.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A parameter snapshot that does not describe a consistent mechanism.
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Numerical failure (non positive-definite covariance, NaN/Inf).
    #[error("numerical error: {0}")]
    Numerical(String),
}

pub type Result<T> = std::result::Result<T, MechanismError>;
