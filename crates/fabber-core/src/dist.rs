//! Scalar distribution parameters.
//!
//! [`DistParams`] describes a univariate Gaussian in terms of mean and
//! variance and is used for per-parameter priors and posteriors in *model
//! space*. [`GammaParams`] describes the Gamma distribution placed on the
//! observation-noise precision.

use serde::{Deserialize, Serialize};

use crate::error::{FabberError, FabberResult};

/// Mean and variance of a univariate Gaussian.
///
/// Immutable once constructed. The precision is derived rather than stored
/// so the two views can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DistParams {
    mean: f64,
    var: f64,
}

impl DistParams {
    /// Create distribution parameters from a mean and variance.
    ///
    /// Returns an error unless the variance is finite and positive.
    pub fn new(mean: f64, var: f64) -> FabberResult<Self> {
        if !var.is_finite() || var <= 0.0 {
            return Err(FabberError::numerical(format!(
                "distribution variance must be finite and positive, got {var}"
            )));
        }
        Ok(Self { mean, var })
    }

    /// The mean.
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// The variance.
    #[must_use]
    pub fn var(&self) -> f64 {
        self.var
    }

    /// The precision (reciprocal variance).
    #[must_use]
    pub fn prec(&self) -> f64 {
        1.0 / self.var
    }
}

impl Default for DistParams {
    /// A standard normal: mean 0, variance 1.
    fn default() -> Self {
        Self {
            mean: 0.0,
            var: 1.0,
        }
    }
}

/// Shape and scale of a Gamma distribution over a precision.
///
/// Invariant: both parameters are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GammaParams {
    /// Shape parameter c.
    pub shape: f64,
    /// Scale parameter s.
    pub scale: f64,
}

impl GammaParams {
    /// Create Gamma parameters, validating positivity.
    pub fn new(shape: f64, scale: f64) -> FabberResult<Self> {
        if !(shape > 0.0 && shape.is_finite() && scale > 0.0 && scale.is_finite()) {
            return Err(FabberError::numerical(format!(
                "Gamma parameters must be finite and positive, got shape={shape}, scale={scale}"
            )));
        }
        Ok(Self { shape, scale })
    }

    /// The mean c·s, which for a precision Gamma is E[φ].
    #[must_use]
    pub fn mean(&self) -> f64 {
        self.shape * self.scale
    }

    /// The variance c·s².
    #[must_use]
    pub fn var(&self) -> f64 {
        self.shape * self.scale * self.scale
    }
}
