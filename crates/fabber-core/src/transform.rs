//! Parameter transforms.
//!
//! Model parameters are internally modelled as Gaussian random variables
//! ("fabber space"). A [`ParamTransform`] is a monotone bijection between
//! that internal variable and the value the forward model actually consumes
//! ("model space"), used to keep parameters away from hard limits such as
//! negative values.
//!
//! Distribution parameters are mapped with a first-order delta-method
//! approximation: for fabber-space mean m and variance v the model-space
//! distribution is taken as mean T(m), variance (T′(m))²·v, and symmetrically
//! for the inverse direction.

use serde::{Deserialize, Serialize};

use crate::dist::DistParams;
use crate::error::{FabberError, FabberResult};

/// String code for the identity transform.
pub const TRANSFORM_CODE_IDENTITY: &str = "I";
/// String code for the log transform.
pub const TRANSFORM_CODE_LOG: &str = "L";
/// String code for the softplus transform.
pub const TRANSFORM_CODE_SOFTPLUS: &str = "S";

/// Argument magnitude beyond which softplus switches to its asymptotes.
const SOFTPLUS_ASYMPTOTE: f64 = 30.0;

/// A monotone bijection between fabber space and model space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamTransform {
    /// No transformation.
    Identity,
    /// Model value is exp of the fabber value (log-normal parameter).
    Log,
    /// Model value is log(1 + exp x): strictly positive, asymptotically
    /// linear, avoiding the rapid growth of the exponential.
    SoftPlus,
}

impl ParamTransform {
    /// Look up a transform by its string code ("I", "L" or "S").
    pub fn from_code(code: &str) -> FabberResult<Self> {
        match code {
            TRANSFORM_CODE_IDENTITY => Ok(Self::Identity),
            TRANSFORM_CODE_LOG => Ok(Self::Log),
            TRANSFORM_CODE_SOFTPLUS => Ok(Self::SoftPlus),
            other => Err(FabberError::invalid_option(
                "transform",
                other,
                "known transform codes are I, L, S",
            )),
        }
    }

    /// The string code of this transform.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Identity => TRANSFORM_CODE_IDENTITY,
            Self::Log => TRANSFORM_CODE_LOG,
            Self::SoftPlus => TRANSFORM_CODE_SOFTPLUS,
        }
    }

    /// Map a fabber-space value to model space.
    #[must_use]
    pub fn to_model(&self, x: f64) -> f64 {
        match self {
            Self::Identity => x,
            Self::Log => x.exp(),
            Self::SoftPlus => {
                if x > SOFTPLUS_ASYMPTOTE {
                    // log(1+e^x) -> x
                    x
                } else if x < -SOFTPLUS_ASYMPTOTE {
                    // log(1+e^x) -> e^x
                    x.exp()
                } else {
                    x.exp().ln_1p()
                }
            }
        }
    }

    /// Map a model-space value back to fabber space.
    #[must_use]
    pub fn to_fabber(&self, y: f64) -> f64 {
        match self {
            Self::Identity => y,
            Self::Log => y.ln(),
            Self::SoftPlus => {
                if y > SOFTPLUS_ASYMPTOTE {
                    // log(e^y - 1) -> y
                    y
                } else {
                    // log(e^y - 1), stable for small y via expm1
                    y.exp_m1().ln()
                }
            }
        }
    }

    /// Derivative dT/dx of the fabber-to-model map at fabber-space x.
    #[must_use]
    pub fn dto_model(&self, x: f64) -> f64 {
        match self {
            Self::Identity => 1.0,
            Self::Log => x.exp(),
            Self::SoftPlus => {
                // sigmoid(x), with asymptotic branches
                if x > SOFTPLUS_ASYMPTOTE {
                    1.0
                } else if x < -SOFTPLUS_ASYMPTOTE {
                    x.exp()
                } else {
                    1.0 / (1.0 + (-x).exp())
                }
            }
        }
    }

    /// Map fabber-space distribution parameters to model space by the
    /// delta method.
    pub fn to_model_dist(&self, params: DistParams) -> FabberResult<DistParams> {
        match self {
            Self::Identity => Ok(params),
            _ => {
                let slope = self.dto_model(params.mean());
                DistParams::new(self.to_model(params.mean()), slope * slope * params.var())
            }
        }
    }

    /// Map model-space distribution parameters to fabber space by the
    /// delta method.
    pub fn to_fabber_dist(&self, params: DistParams) -> FabberResult<DistParams> {
        match self {
            Self::Identity => Ok(params),
            _ => {
                let fab_mean = self.to_fabber(params.mean());
                let slope = self.dto_model(fab_mean);
                DistParams::new(fab_mean, params.var() / (slope * slope))
            }
        }
    }
}

impl Default for ParamTransform {
    fn default() -> Self {
        Self::Identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use proptest::prelude::*;

    #[test]
    fn test_code_round_trip() {
        for t in [
            ParamTransform::Identity,
            ParamTransform::Log,
            ParamTransform::SoftPlus,
        ] {
            assert_eq!(ParamTransform::from_code(t.code()).unwrap(), t);
        }
        assert!(ParamTransform::from_code("X").is_err());
    }

    #[test]
    fn test_log_round_trip() {
        let t = ParamTransform::Log;
        for x in [-5.0, -0.1, 0.0, 0.1, 3.0, 10.0] {
            assert_abs_diff_eq!(t.to_fabber(t.to_model(x)), x, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_softplus_round_trip_moderate_range() {
        let t = ParamTransform::SoftPlus;
        for x in [-20.0, -5.0, -0.5, 0.0, 0.5, 5.0, 20.0] {
            assert_abs_diff_eq!(t.to_fabber(t.to_model(x)), x, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_softplus_asymptotic_branches_do_not_overflow() {
        let t = ParamTransform::SoftPlus;
        assert_relative_eq!(t.to_model(500.0), 500.0);
        assert!(t.to_model(-500.0) > 0.0);
        assert_relative_eq!(t.to_fabber(500.0), 500.0);
        assert_relative_eq!(t.dto_model(500.0), 1.0);
    }

    #[test]
    fn test_delta_method_variance_log() {
        // Fabber-space N(0, 4) through exp: model mean exp(0)=1,
        // model var (exp(0))^2 * 4 = 4.
        let t = ParamTransform::Log;
        let model = t
            .to_model_dist(DistParams::new(0.0, 4.0).unwrap())
            .unwrap();
        assert_relative_eq!(model.mean(), 1.0);
        assert_relative_eq!(model.var(), 4.0);

        let back = t.to_fabber_dist(model).unwrap();
        assert_abs_diff_eq!(back.mean(), 0.0, epsilon = 1e-12);
        assert_relative_eq!(back.var(), 4.0, epsilon = 1e-12);
    }

    proptest! {
        #[test]
        fn prop_identity_round_trip_exact(x in -1e12f64..1e12) {
            let t = ParamTransform::Identity;
            prop_assert_eq!(t.to_fabber(t.to_model(x)), x);
        }

        #[test]
        fn prop_log_round_trip(x in -30.0f64..30.0) {
            let t = ParamTransform::Log;
            prop_assert!((t.to_fabber(t.to_model(x)) - x).abs() < 1e-10);
        }

        #[test]
        fn prop_softplus_round_trip(x in -20.0f64..20.0) {
            let t = ParamTransform::SoftPlus;
            prop_assert!((t.to_fabber(t.to_model(x)) - x).abs() < 1e-8);
        }

        #[test]
        fn prop_softplus_is_monotone(a in -40.0f64..40.0, b in -40.0f64..40.0) {
            let t = ParamTransform::SoftPlus;
            if a < b {
                prop_assert!(t.to_model(a) < t.to_model(b));
            }
        }
    }
}
