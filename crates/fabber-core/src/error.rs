//! Error types for the fabber engine.
//!
//! This module provides comprehensive error handling using [`thiserror`] for
//! automatic `Display` and `Error` trait implementations.
//!
//! # Error Hierarchy
//!
//! - [`FabberError`]: top-level error type covering option handling, data
//!   loading, dimension checks, and numerical failures
//! - [`FabberResult`]: convenient `Result` alias using `FabberError`
//!
//! Option and data errors abort a run before any voxel work begins.
//! Numerical errors inside a voxel update are recoverable at run level: the
//! voxel is marked failed, logged with its coordinates, and the run
//! continues (exiting non-zero at the end).

use std::path::PathBuf;
use thiserror::Error;

/// A specialized `Result` type for fabber operations.
pub type FabberResult<T> = Result<T, FabberError>;

/// Top-level error type for the fabber engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FabberError {
    /// An option was given an unknown key, wrong type, or forbidden value
    #[error("Invalid option value: --{key}={value} ({reason})")]
    InvalidOption {
        /// The offending option key
        key: String,
        /// The offending value as supplied
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A required option was not supplied
    #[error("Missing mandatory option: --{key}")]
    MissingOption {
        /// The key that was required
        key: String,
    },

    /// Voxel data was requested under a key that has no data attached
    #[error("Data not found: {key}")]
    DataNotFound {
        /// The data key (option name or filename)
        key: String,
    },

    /// A data file existed but could not be loaded or was malformed
    #[error("Failed to load data from '{path}': {reason}")]
    DataLoad {
        /// Path of the file being loaded
        path: PathBuf,
        /// Why loading failed
        reason: String,
    },

    /// Mismatch between mask, data, coordinates, or model dimensions
    #[error("Dimension mismatch in {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being checked
        context: String,
        /// Expected dimension description
        expected: String,
        /// Actual dimension description
        actual: String,
    },

    /// A numerical operation failed (non-SPD covariance, Cholesky failure,
    /// search divergence)
    #[error("Numerical failure: {context}")]
    Numerical {
        /// Description of the failing computation
        context: String,
    },

    /// A per-voxel update failed; carries the voxel index and coordinates
    #[error("Voxel {voxel} at ({x}, {y}, {z}) failed: {cause}")]
    VoxelFailed {
        /// Flat voxel index
        voxel: usize,
        /// Lattice x coordinate
        x: i32,
        /// Lattice y coordinate
        y: i32,
        /// Lattice z coordinate
        z: i32,
        /// Underlying cause
        cause: String,
    },

    /// Internal assertion breach (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error
        message: String,
    },

    /// An underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FabberError {
    /// Creates a new invalid-option error.
    #[must_use]
    pub fn invalid_option(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidOption {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new missing-option error.
    #[must_use]
    pub fn missing_option(key: impl Into<String>) -> Self {
        Self::MissingOption { key: key.into() }
    }

    /// Creates a new data-not-found error.
    #[must_use]
    pub fn data_not_found(key: impl Into<String>) -> Self {
        Self::DataNotFound { key: key.into() }
    }

    /// Creates a new data-load error.
    #[must_use]
    pub fn data_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DataLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new dimension-mismatch error.
    #[must_use]
    pub fn dimension_mismatch(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::DimensionMismatch {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a new numerical error.
    #[must_use]
    pub fn numerical(context: impl Into<String>) -> Self {
        Self::Numerical {
            context: context.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this error can be contained to a single voxel.
    ///
    /// Numerical failures mark the voxel as failed and let the sweep
    /// continue; everything else aborts the run.
    #[must_use]
    pub fn is_voxel_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Numerical { .. } | Self::VoxelFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_option_display() {
        let err = FabberError::invalid_option("spatial-dims", "7", "must be 0, 1, 2 or 3");
        let msg = err.to_string();
        assert!(msg.contains("--spatial-dims=7"));
        assert!(msg.contains("must be 0, 1, 2 or 3"));
    }

    #[test]
    fn test_voxel_failure_carries_coordinates() {
        let err = FabberError::VoxelFailed {
            voxel: 42,
            x: 1,
            y: 2,
            z: 3,
            cause: "covariance not positive definite".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("(1, 2, 3)"));
        assert!(msg.contains("not positive definite"));
    }

    #[test]
    fn test_recoverability_policy() {
        assert!(FabberError::numerical("cholesky failed").is_voxel_recoverable());
        assert!(!FabberError::missing_option("data").is_voxel_recoverable());
        assert!(!FabberError::data_not_found("mask").is_voxel_recoverable());
    }
}
