//! Error types and result utilities for the multichannel front-end.

use thiserror::Error;

/// Convenience type alias for results that may contain a [`FrontendError`].
pub type FrontendResult<T> = Result<T, FrontendError>;

/// Error types that can occur in the front-end processing components.
///
/// All errors are fatal for the call (or the construction) that produced them.
/// There is no retry logic anywhere in the crate: iteration counts are fixed
/// hyperparameters, so a failed call signals a configuration or input problem
/// that the caller has to resolve.
#[derive(Error, Debug)]
pub enum FrontendError {
    /// Invalid or unsupported option combination detected at construction.
    ///
    /// Examples: unknown filter type, unsupported magnitude reduction,
    /// unimplemented normalization, non-increasing mask threshold pair.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Runtime mismatch between the configured and the observed array shape.
    ///
    /// Examples: wrong channel count, mismatched batch or time dimension.
    #[error("Shape mismatch error: {0}")]
    Shape(String),

    /// Contractual violation on an input value.
    ///
    /// Examples: fewer than two sources for the mixture model estimator, or
    /// both/neither of two mutually exclusive inputs supplied.
    #[error("Invalid input error: {0}")]
    InvalidInput(String),

    /// Numerical failure, typically caused by ill-conditioned input.
    ///
    /// Examples: non-finite mask estimate after the EM iterations, failed
    /// Cholesky factorization of a correlation matrix.
    #[error("Numerical error: {0}")]
    Numerical(String),
}
