//! Observation-noise models.
//!
//! The noise precision φ carries a conjugate Gamma posterior q(φ) =
//! Gamma(c, s). The white model updates (c, s) directly from the residual;
//! the AR(1) model additionally maintains a Gaussian posterior over the
//! autoregression coefficient α and whitens the residual by (1 − αL) before
//! the Gamma update.
//!
//! Each model also contributes its closed-form terms to the variational
//! free energy: the expected log-likelihood, the expected log-prior of φ
//! (and α), and the negative entropy of q(φ) (and q(α)).

use nalgebra::{DMatrix, DVector};
use statrs::function::gamma::{digamma, ln_gamma};
use tracing::warn;

use fabber_core::{FabberError, FabberResult, GammaParams, RunOptions};

use std::f64::consts::PI;

/// Default vague prior shape for the noise precision.
const DEFAULT_NOISE_PRIOR_SHAPE: f64 = 1e-6;
/// Default vague prior scale for the noise precision.
const DEFAULT_NOISE_PRIOR_SCALE: f64 = 1e6;
/// Default prior variance of the AR(1) coefficient.
const DEFAULT_AR1_PRIOR_VAR: f64 = 1.0;
/// Stability bound on the AR(1) coefficient magnitude.
const AR1_ALPHA_LIMIT: f64 = 0.999;

/// tr(J·Σ·Jᵀ) without forming the T×T product.
fn trace_j_sigma_jt(jacobian: &DMatrix<f64>, covariance: &DMatrix<f64>) -> f64 {
    (jacobian * covariance).component_mul(jacobian).sum()
}

/// Per-voxel posterior over the observation noise.
#[derive(Debug, Clone)]
pub enum NoisePosterior {
    /// White Gaussian noise: q(φ) = Gamma(c, s).
    White {
        /// Fixed prior on φ
        prior: GammaParams,
        /// Current posterior on φ
        post: GammaParams,
    },
    /// AR(1) noise: q(φ) plus a Gaussian posterior over the AR coefficient.
    Ar1 {
        /// Fixed prior on φ
        prior: GammaParams,
        /// Current posterior on φ
        post: GammaParams,
        /// Prior variance of α (zero-mean prior)
        alpha_prior_var: f64,
        /// Posterior mean of α
        alpha_mean: f64,
        /// Posterior variance of α
        alpha_var: f64,
    },
}

impl NoisePosterior {
    /// Build the configured noise model from run options.
    ///
    /// `--noise` selects "white" (default) or "ar1";
    /// `--noise-prior-shape` / `--noise-prior-scale` set the Gamma prior.
    pub fn from_options(options: &RunOptions) -> FabberResult<Self> {
        let shape = options.get_f64_default("noise-prior-shape", DEFAULT_NOISE_PRIOR_SHAPE)?;
        let scale = options.get_f64_default("noise-prior-scale", DEFAULT_NOISE_PRIOR_SCALE)?;
        let prior = GammaParams::new(shape, scale)?;
        match options.get_str_default("noise", "white") {
            "white" => Ok(Self::White { prior, post: prior }),
            "ar1" => {
                let alpha_prior_var =
                    options.get_f64_default("ar1-alpha-var", DEFAULT_AR1_PRIOR_VAR)?;
                if alpha_prior_var <= 0.0 {
                    return Err(FabberError::invalid_option(
                        "ar1-alpha-var",
                        alpha_prior_var.to_string(),
                        "must be positive",
                    ));
                }
                Ok(Self::Ar1 {
                    prior,
                    post: prior,
                    alpha_prior_var,
                    alpha_mean: 0.0,
                    alpha_var: alpha_prior_var,
                })
            }
            other => Err(FabberError::invalid_option(
                "noise",
                other,
                "known noise models: white, ar1",
            )),
        }
    }

    /// Names of the available noise models.
    #[must_use]
    pub fn known_models() -> &'static [&'static str] {
        &["white", "ar1"]
    }

    /// E[φ] under the current posterior.
    #[must_use]
    pub fn precision_mean(&self) -> f64 {
        match self {
            Self::White { post, .. } | Self::Ar1 { post, .. } => post.mean(),
        }
    }

    /// Mean and standard deviation of the noise precision posterior.
    #[must_use]
    pub fn moments(&self) -> (f64, f64) {
        match self {
            Self::White { post, .. } | Self::Ar1 { post, .. } => {
                (post.mean(), post.var().sqrt())
            }
        }
    }

    /// The AR(1) coefficient posterior mean, if this is an AR(1) model.
    #[must_use]
    pub fn ar_coefficient(&self) -> Option<f64> {
        match self {
            Self::White { .. } => None,
            Self::Ar1 { alpha_mean, .. } => Some(*alpha_mean),
        }
    }

    /// Whiten a residual by (1 − αL); identity for white noise.
    fn whitened(&self, residual: &DVector<f64>) -> DVector<f64> {
        match self {
            Self::White { .. } => residual.clone(),
            Self::Ar1 { alpha_mean, .. } => {
                let t = residual.len();
                DVector::from_fn(t, |i, _| {
                    if i == 0 {
                        residual[0]
                    } else {
                        residual[i] - alpha_mean * residual[i - 1]
                    }
                })
            }
        }
    }

    /// Update the noise posterior from the residual r = y − ŷ(μ), the
    /// fabber-space Jacobian and the parameter covariance.
    pub fn update(
        &mut self,
        residual: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        covariance: &DMatrix<f64>,
    ) -> FabberResult<()> {
        let t = residual.len() as f64;
        let trace = trace_j_sigma_jt(jacobian, covariance);

        match self {
            Self::White { prior, post } => {
                let scale = 1.0
                    / (0.5 * residual.norm_squared() + 0.5 * trace + 1.0 / prior.scale);
                *post = GammaParams::new(prior.shape + t / 2.0, scale)?;
            }
            Self::Ar1 {
                prior,
                post,
                alpha_prior_var,
                alpha_mean,
                alpha_var,
            } => {
                // Gamma update on the whitened residual
                let white = {
                    let t_len = residual.len();
                    DVector::from_fn(t_len, |i, _| {
                        if i == 0 {
                            residual[0]
                        } else {
                            residual[i] - *alpha_mean * residual[i - 1]
                        }
                    })
                };
                let scale =
                    1.0 / (0.5 * white.norm_squared() + 0.5 * trace + 1.0 / prior.scale);
                *post = GammaParams::new(prior.shape + t / 2.0, scale)?;

                // Conditional Gaussian update of α from the residual
                // autocorrelation
                let phi = post.mean();
                let mut lag_sq = 0.0;
                let mut lag_cross = 0.0;
                for i in 1..residual.len() {
                    lag_sq += residual[i - 1] * residual[i - 1];
                    lag_cross += residual[i] * residual[i - 1];
                }
                let precision = 1.0 / *alpha_prior_var + phi * lag_sq;
                *alpha_var = 1.0 / precision;
                let mut mean = phi * lag_cross * *alpha_var;
                if mean.abs() >= AR1_ALPHA_LIMIT {
                    warn!(
                        "AR(1) coefficient update diverged (alpha={mean:.4}); \
                         clamping to |alpha| < {AR1_ALPHA_LIMIT}"
                    );
                    mean = mean.clamp(-AR1_ALPHA_LIMIT, AR1_ALPHA_LIMIT);
                }
                *alpha_mean = mean;
            }
        }
        Ok(())
    }

    /// Free-energy terms owned by the noise model:
    /// E[log p(y|θ,φ)] + E[log p(φ)] − E[log q(φ)], plus the α terms for
    /// AR(1).
    #[must_use]
    pub fn free_energy_terms(
        &self,
        residual: &DVector<f64>,
        jacobian: &DMatrix<f64>,
        covariance: &DMatrix<f64>,
    ) -> f64 {
        let t = residual.len() as f64;
        let (prior, post) = match self {
            Self::White { prior, post } | Self::Ar1 { prior, post, .. } => (prior, post),
        };
        let e_phi = post.mean();
        let e_log_phi = digamma(post.shape) + post.scale.ln();
        let white = self.whitened(residual);
        let trace = trace_j_sigma_jt(jacobian, covariance);

        // E[log p(y|θ,φ)] under the linearised model
        let log_lik = 0.5 * t * e_log_phi
            - 0.5 * t * (2.0 * PI).ln()
            - 0.5 * e_phi * (white.norm_squared() + trace);

        // E[log p(φ)] under the Gamma prior
        let log_prior = (prior.shape - 1.0) * e_log_phi - e_phi / prior.scale
            - prior.shape * prior.scale.ln()
            - ln_gamma(prior.shape);

        // Entropy of q(φ)
        let entropy = post.shape + post.scale.ln() + ln_gamma(post.shape)
            + (1.0 - post.shape) * digamma(post.shape);

        let mut total = log_lik + log_prior + entropy;

        if let Self::Ar1 {
            alpha_prior_var,
            alpha_mean,
            alpha_var,
            ..
        } = self
        {
            // −KL(q(α) ‖ p(α)) for Gaussian q and zero-mean Gaussian prior
            let kl = 0.5
                * ((alpha_var + alpha_mean * alpha_mean) / alpha_prior_var - 1.0
                    + (alpha_prior_var / alpha_var).ln());
            total -= kl;
        }

        total
    }
}
