//! The per-voxel Variational Bayes update.
//!
//! Coordinate ascent on a factorised posterior q(θ)·q(φ) under a forward
//! model linearised at the current posterior mean. One inner iteration:
//!
//! 1. lift the fabber-space mean to model space through the parameter
//!    transforms and linearise the model there, chaining the Jacobian back
//!    into fabber space;
//! 2. assemble the effective prior from the per-parameter prior system;
//! 3. update the posterior precision Λ ← Λ₀ + E[φ]·JᵀJ and mean
//!    μ ← Λ⁻¹(Λ₀μ₀ + E[φ]·Jᵀ(y − ŷ + Jμ));
//! 4. update the noise posterior from the new residual;
//! 5. evaluate the variational free energy in closed form.
//!
//! A free-energy decrease reverts the step and halves the mean toward its
//! previous value before retrying; a Cholesky failure abandons the voxel
//! with its last good state intact.

use nalgebra::{Cholesky, DMatrix, DVector};

use fabber_core::{
    FabberError, FabberResult, ForwardModel, MvnDist, ParamDef, ParamTransform,
};

use crate::convergence::{ConvergenceConfig, ConvergenceDetector, ConvergenceStatus};
use crate::noise::NoisePosterior;
use crate::prior::{assemble_priors, ParamPrior};

use std::f64::consts::PI;

/// Everything the inference loop tracks for one voxel.
#[derive(Debug, Clone)]
pub struct VoxelState {
    /// Fabber-space posterior over the model parameters
    pub mvn: MvnDist,
    /// Posterior over the observation noise
    pub noise: NoisePosterior,
    /// Free energy of the last accepted step
    pub free_energy: f64,
}

/// Initialise a voxel's posterior from the model's hard-coded
/// distributions, mapped into fabber space.
pub fn init_voxel_state(defs: &[ParamDef], noise: NoisePosterior) -> FabberResult<VoxelState> {
    let p = defs.len();
    let mut mean = DVector::zeros(p);
    let mut cov = DMatrix::zeros(p, p);
    for (i, def) in defs.iter().enumerate() {
        let fab = def.transform.to_fabber_dist(def.posterior)?;
        mean[i] = fab.mean();
        cov[(i, i)] = fab.var();
    }
    Ok(VoxelState {
        mvn: MvnDist::from_mean_covariance(mean, cov)?,
        noise,
        free_energy: f64::NEG_INFINITY,
    })
}

/// Model prediction and fabber-space Jacobian at a linearisation point.
#[derive(Debug, Clone)]
pub struct Linearisation {
    /// ŷ at the linearisation point
    pub prediction: DVector<f64>,
    /// Fabber-space Jacobian J = J_model · diag(T′(μ))
    pub jacobian: DMatrix<f64>,
}

/// Linearise the model at a fabber-space mean.
pub fn linearise(
    model: &dyn ForwardModel,
    transforms: &[ParamTransform],
    mu: &DVector<f64>,
) -> FabberResult<Linearisation> {
    let theta = DVector::from_fn(mu.len(), |i, _| transforms[i].to_model(mu[i]));
    let prediction = model.evaluate(&theta)?;
    let mut jacobian = model.jacobian(&theta)?;
    for (i, transform) in transforms.iter().enumerate() {
        let slope = transform.dto_model(mu[i]);
        jacobian.column_mut(i).scale_mut(slope);
    }
    Ok(Linearisation {
        prediction,
        jacobian,
    })
}

/// Residual of the data against the model evaluated at a fabber-space mean.
fn residual_at(
    model: &dyn ForwardModel,
    transforms: &[ParamTransform],
    mu: &DVector<f64>,
    y: &DVector<f64>,
) -> FabberResult<DVector<f64>> {
    let theta = DVector::from_fn(mu.len(), |i, _| transforms[i].to_model(mu[i]));
    Ok(y - model.evaluate(&theta)?)
}

/// E[log p(θ)] − E[log q(θ)] under a diagonal effective prior.
fn parameter_free_energy_terms(
    mu: &DVector<f64>,
    cov: &DMatrix<f64>,
    mu0: &DVector<f64>,
    lambda0: &DVector<f64>,
    log_det_cov: f64,
) -> f64 {
    let p = mu.len() as f64;
    let mut log_prior = -0.5 * p * (2.0 * PI).ln();
    for i in 0..mu.len() {
        let diff = mu[i] - mu0[i];
        log_prior += 0.5 * lambda0[i].ln();
        log_prior -= 0.5 * lambda0[i] * (diff * diff + cov[(i, i)]);
    }
    let entropy = 0.5 * p * (1.0 + (2.0 * PI).ln()) + 0.5 * log_det_cov;
    log_prior + entropy
}

/// One VB coordinate-ascent step for one voxel. Mutates `state` in place
/// and returns the new free energy.
///
/// `damping` (from the `lm` convergence policy) scales the diagonal of the
/// data term in the precision update; zero means no damping.
pub fn vb_step(
    model: &dyn ForwardModel,
    transforms: &[ParamTransform],
    priors: &[ParamPrior],
    y: &DVector<f64>,
    voxel: usize,
    state: &mut VoxelState,
    damping: f64,
) -> FabberResult<f64> {
    let mu = state.mvn.mean().clone();
    let cov = state.mvn.covariance()?.clone();

    let (mu0, lambda0) = assemble_priors(priors, voxel, &mu, &cov)?;
    let lin = linearise(model, transforms, &mu)?;
    let e_phi = state.noise.precision_mean();

    // Λ ← Λ₀ + E[φ]·JᵀJ, optionally Levenberg-damped on the diagonal
    let jt = lin.jacobian.transpose();
    let mut data_term = &jt * &lin.jacobian;
    if damping > 0.0 {
        for i in 0..data_term.nrows() {
            data_term[(i, i)] *= 1.0 + damping;
        }
    }
    let precision_new = DMatrix::from_diagonal(&lambda0) + e_phi * data_term;

    let chol = Cholesky::new(precision_new.clone()).ok_or_else(|| {
        FabberError::numerical("VB precision update produced a non-SPD matrix")
    })?;
    let mut cov_new = chol.inverse();
    // Symmetrise after the inversion
    for i in 0..cov_new.nrows() {
        for j in (i + 1)..cov_new.ncols() {
            let avg = 0.5 * (cov_new[(i, j)] + cov_new[(j, i)]);
            cov_new[(i, j)] = avg;
            cov_new[(j, i)] = avg;
        }
    }

    // μ ← Σ·(Λ₀μ₀ + E[φ]·Jᵀ·(y − ŷ + Jμ))
    let k = y - &lin.prediction + &lin.jacobian * &mu;
    let mu_new = &cov_new * (lambda0.component_mul(&mu0) + e_phi * (&jt * k));

    state.mvn.set_mean(mu_new.clone())?;
    state.mvn.set_covariance(cov_new.clone())?;

    // Noise update from the new residual, with Σ = Λ⁻¹
    let r = residual_at(model, transforms, &mu_new, y)?;
    state.noise.update(&r, &lin.jacobian, &cov_new)?;

    // Free energy
    let log_det_cov = state.mvn.log_det_covariance()?;
    let f = state.noise.free_energy_terms(&r, &lin.jacobian, &cov_new)
        + parameter_free_energy_terms(&mu_new, &cov_new, &mu0, &lambda0, log_det_cov);
    state.free_energy = f;
    Ok(f)
}

/// Run the full inner loop for one voxel until its convergence detector
/// stops it.
///
/// On a reverted step the posterior is restored and the mean halved toward
/// its previous value before retrying. On divergence or a numerical
/// failure the state is left at its last accepted value and the error is
/// returned for the caller to record.
pub fn fit_voxel(
    model: &dyn ForwardModel,
    transforms: &[ParamTransform],
    priors: &[ParamPrior],
    y: &DVector<f64>,
    voxel: usize,
    state: &mut VoxelState,
    config: &ConvergenceConfig,
) -> FabberResult<usize> {
    let mut detector = ConvergenceDetector::new(*config);
    loop {
        let saved = state.clone();
        let f = match vb_step(model, transforms, priors, y, voxel, state, detector.damping()) {
            Ok(f) => f,
            Err(e) => {
                *state = saved;
                return Err(e);
            }
        };
        match detector.check(f) {
            ConvergenceStatus::Continue => {}
            ConvergenceStatus::Converged => {
                // Trial mode can settle after a run of bad steps; keep the
                // last good state rather than the final rejected proposal
                if f < saved.free_energy - config.fchange_tol {
                    *state = saved;
                }
                break;
            }
            ConvergenceStatus::Reverted => {
                // Keep the last good posterior but restart the next trial
                // from a mean halved toward it
                let proposed = state.mvn.mean().clone();
                *state = saved;
                let halved = (state.mvn.mean() + proposed) * 0.5;
                state.mvn.set_mean(halved)?;
            }
            ConvergenceStatus::Diverged => {
                *state = saved;
                return Err(FabberError::numerical(format!(
                    "VB update diverged after {} iterations",
                    detector.iterations()
                )));
            }
        }
    }
    Ok(detector.iterations())
}
