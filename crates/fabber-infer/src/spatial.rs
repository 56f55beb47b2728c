//! Spatial Variational Bayes: the outer coordination loop.
//!
//! Couples voxels through per-parameter spatial priors. Each outer
//! iteration runs one VB coordinate-ascent step at every voxel, then
//! re-estimates the spatial hyper-parameters (ρ, δ) of every spatially
//! coupled parameter from cross-voxel statistics, and finally rewrites the
//! per-voxel prior contributions that the next sweep will consume.
//!
//! Two hyper-parameter updates are provided:
//!
//! - the Sahani-style smoothing update for the shrinkage priors `M`/`m`,
//!   maximising a 1-D evidence surrogate by bisection in log-δ;
//! - evidence optimisation for the `P`/`p` priors, a secant iteration on
//!   ∂(log evidence)/∂log δ over the parameter's posterior-without-prior
//!   distribution, with an optional brute-force grid search.
//!
//! ρ is solved analytically at each δ as V / (dᵀK⁻¹d + tr(K⁻¹·C)).

use nalgebra::{Cholesky, DMatrix, DVector};
use tracing::{debug, info, warn};

use fabber_core::{FabberError, FabberResult, OptionSpec, OptionType, ParamTransform, RunOptions};

use crate::convergence::ConvergenceConfig;
use crate::covariance::{CovarianceCache, DistanceMeasure};
use crate::neighbours::NeighbourGraph;
use crate::noise::NoisePosterior;
use crate::prior::{parse_prior_types, ParamPrior, PriorKind};
use crate::run::{
    build_param_priors, collect_outputs, run_plain_vb, FailedVoxel, InferenceMethod, RunContext,
    RunOutputs, VbMethod,
};
use crate::vb::{init_voxel_state, vb_step, VoxelState};

use std::f64::consts::PI;

/// Lower bound of the δ search range.
const DELTA_MIN: f64 = 0.05;
/// Upper bound of the δ search range.
const DELTA_MAX: f64 = 1e3;
/// Step used for finite-difference derivatives in log-δ.
const DERIV_STEP: f64 = 1e-3;
/// Bisection iterations for the smoothing-scale search.
const BISECTION_ITERATIONS: usize = 40;
/// Floor applied to the analytically solved ρ.
const RHO_FLOOR: f64 = 1e-10;
/// Floor on the data-only precision when separating a posterior from its
/// prior.
const DATA_PRECISION_FLOOR: f64 = 1e-10;

/// Configuration of the spatial coordinator.
#[derive(Debug, Clone)]
pub struct SpatialVbConfig {
    /// Number of spatial dimensions: 0 disables smoothing, 2 smooths in
    /// slices only, 3 by volume
    pub spatial_dims: usize,
    /// Voxel distance metric
    pub distance_measure: DistanceMeasure,
    /// Maximum ρ increase factor per outer step (≥ 1, or −1 for unlimited)
    pub spatial_speed: f64,
    /// Fixed δ; disables the δ search when present
    pub fixed_delta: Option<f64>,
    /// Fixed ρ; disables the ρ solution when present
    pub fixed_rho: Option<f64>,
    /// Initial δ guess for the searches
    pub delta_guess: f64,
    /// Whether (ρ, δ) are updated after the very first sweep
    pub update_first_iter: bool,
    /// Optimise all P/p parameters against a single shared δ
    pub use_sim_evidence: bool,
    /// Budget of evidence evaluations per δ search
    pub new_delta_evals: usize,
    /// Replace the secant search by an exhaustive log-grid search
    pub brute_force_delta: bool,
    /// Outer-loop convergence settings (iteration cap, |ΔF| tolerance,
    /// divergence budget)
    pub convergence: ConvergenceConfig,
}

impl SpatialVbConfig {
    /// Read the spatial configuration from run options.
    pub fn from_options(options: &RunOptions) -> FabberResult<Self> {
        let spatial_dims = options.get_int_default("spatial-dims", 3)?;
        if !(0..=3).contains(&spatial_dims) {
            return Err(FabberError::invalid_option(
                "spatial-dims",
                spatial_dims.to_string(),
                "must be 0, 1, 2 or 3",
            ));
        }
        let spatial_speed = options.get_f64_default("spatial-speed", -1.0)?;
        if spatial_speed != -1.0 && spatial_speed < 1.0 {
            return Err(FabberError::invalid_option(
                "spatial-speed",
                spatial_speed.to_string(),
                "must be at least 1, or -1 for unlimited",
            ));
        }
        let delta_guess = options.get_f64_default("delta-guess", 1.0)?;
        if delta_guess <= 0.0 {
            return Err(FabberError::invalid_option(
                "delta-guess",
                delta_guess.to_string(),
                "must be positive",
            ));
        }
        let fixed_delta = if options.have_key("fixed-delta") {
            Some(options.get_f64("fixed-delta")?)
        } else {
            None
        };
        let fixed_rho = if options.have_key("fixed-rho") {
            Some(options.get_f64("fixed-rho")?)
        } else {
            None
        };
        let new_delta_evals = options.get_int_default("new-delta-evals", 10)?;
        if new_delta_evals < 2 {
            return Err(FabberError::invalid_option(
                "new-delta-evals",
                new_delta_evals.to_string(),
                "must be at least 2",
            ));
        }
        Ok(Self {
            spatial_dims: spatial_dims as usize,
            distance_measure: DistanceMeasure::from_option(
                options.get_str_default("distance-measure", "dist1"),
            )?,
            spatial_speed,
            fixed_delta,
            fixed_rho,
            delta_guess,
            update_first_iter: options.get_bool("update-first-iter")?,
            use_sim_evidence: options.get_bool("use-sim-evidence")?,
            new_delta_evals: new_delta_evals as usize,
            brute_force_delta: options.get_bool("brute-force-delta-search")?,
            convergence: ConvergenceConfig::from_options(options)?,
        })
    }
}

/// Per-voxel, per-parameter statistics feeding a hyper-parameter update.
struct SpatialStats {
    /// Mean vector across voxels (fabber space)
    means: DVector<f64>,
    /// Variance (covariance-ratio diagonal) across voxels
    variances: DVector<f64>,
}

/// q(δ) = dᵀK⁻¹d + tr(K⁻¹·C) with C the diagonal supplied to the cache.
fn evidence_denominator(
    cache: &mut CovarianceCache,
    means: &DVector<f64>,
    delta: f64,
) -> FabberResult<f64> {
    let quad = {
        let kinv = cache.cinv(delta)?;
        (kinv * means).dot(means)
    };
    let (_, trace) = cache.ci_codist_ci(delta)?;
    Ok(quad + trace)
}

/// The analytic ρ at a given δ: V / q(δ).
fn solve_rho(cache: &mut CovarianceCache, means: &DVector<f64>, delta: f64) -> FabberResult<f64> {
    let q = evidence_denominator(cache, means, delta)?;
    Ok((means.len() as f64 / q).max(RHO_FLOOR))
}

/// The 1-D evidence surrogate maximised by the Sahani smoothing update.
fn smoothing_surrogate(
    cache: &mut CovarianceCache,
    means: &DVector<f64>,
    log_delta: f64,
) -> FabberResult<f64> {
    let delta = log_delta.exp();
    let v = means.len() as f64;
    let q = evidence_denominator(cache, means, delta)?;
    let log_det_k = cache.log_det_kernel(delta)?;
    Ok(0.5 * (v * (v / q).ln() - log_det_k - v))
}

/// Sahani-style smoothing update for the shrinkage priors.
///
/// Maximises the evidence surrogate by bisection on its derivative in
/// log-δ over a bounded range, then solves ρ analytically. The cache must
/// already hold the covariance-ratio diagonal for this parameter.
pub fn optimize_smoothing_scale(
    cache: &mut CovarianceCache,
    means: &DVector<f64>,
    fixed_delta: Option<f64>,
) -> FabberResult<(f64, f64)> {
    if let Some(delta) = fixed_delta {
        return Ok((delta, solve_rho(cache, means, delta)?));
    }

    let deriv = |cache: &mut CovarianceCache, x: f64| -> FabberResult<f64> {
        let up = smoothing_surrogate(cache, means, x + DERIV_STEP)?;
        let down = smoothing_surrogate(cache, means, x - DERIV_STEP)?;
        Ok((up - down) / (2.0 * DERIV_STEP))
    };

    let mut lo = DELTA_MIN.ln();
    let mut hi = DELTA_MAX.ln();
    let g_lo = deriv(cache, lo)?;
    let g_hi = deriv(cache, hi)?;

    let log_delta = if g_lo <= 0.0 {
        // Surrogate is falling at the lower bound: boundary maximum
        lo
    } else if g_hi >= 0.0 {
        hi
    } else {
        for _ in 0..BISECTION_ITERATIONS {
            let mid = 0.5 * (lo + hi);
            if deriv(cache, mid)? > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    };

    let delta = log_delta.exp();
    let rho = solve_rho(cache, means, delta)?;
    Ok((delta, rho))
}

/// log evidence for the P/p priors at a given δ, with ρ solved
/// analytically.
///
/// The evidence is ∫ Πᵥ N(mᵥ | θᵥ, sᵥ) · N(θ | 0, K(δ)/ρ) dθ
/// = N(m | 0, K(δ)/ρ + diag(s)).
fn penny_evidence(
    cache: &mut CovarianceCache,
    means: &DVector<f64>,
    variances: &DVector<f64>,
    delta: f64,
) -> FabberResult<(f64, f64)> {
    let v = means.len();
    let rho = solve_rho(cache, means, delta)?;
    let mut s = cache.kernel(delta) / rho;
    for i in 0..v {
        s[(i, i)] += variances[i];
    }
    let chol = Cholesky::new(s).ok_or_else(|| {
        FabberError::numerical(format!(
            "evidence covariance not positive definite at delta={delta}"
        ))
    })?;
    let log_det = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();
    let solved = chol.solve(means);
    let log_evidence =
        -0.5 * (log_det + means.dot(&solved) + v as f64 * (2.0 * PI).ln());
    Ok((log_evidence, rho))
}

/// Evidence optimisation for the P/p priors: secant iteration on
/// ∂(log evidence)/∂log δ, with a budget of evidence evaluations and an
/// optional exhaustive grid search.
pub fn optimize_evidence(
    cache: &mut CovarianceCache,
    means: &DVector<f64>,
    variances: &DVector<f64>,
    guess: f64,
    max_evals: usize,
    brute_force: bool,
    fixed_delta: Option<f64>,
) -> FabberResult<(f64, f64)> {
    if let Some(delta) = fixed_delta {
        let (_, rho) = penny_evidence(cache, means, variances, delta)?;
        return Ok((delta, rho));
    }

    if brute_force {
        return grid_search_delta(cache, means, variances, max_evals);
    }

    // Seed from a previously cached δ near the guess if one exists
    let guess = cache
        .get_cached_in_range(guess / 4.0, guess * 4.0)
        .unwrap_or(guess)
        .clamp(DELTA_MIN, DELTA_MAX);

    fn deriv(
        cache: &mut CovarianceCache,
        means: &DVector<f64>,
        variances: &DVector<f64>,
        x: f64,
        evals: &mut usize,
    ) -> FabberResult<f64> {
        *evals += 2;
        let (up, _) = penny_evidence(cache, means, variances, (x + DERIV_STEP).exp())?;
        let (down, _) = penny_evidence(cache, means, variances, (x - DERIV_STEP).exp())?;
        Ok((up - down) / (2.0 * DERIV_STEP))
    }

    let (lo, hi) = (DELTA_MIN.ln(), DELTA_MAX.ln());
    let mut evals = 0usize;
    let mut x_prev = guess.ln();
    let mut x = (x_prev + 0.5).clamp(lo, hi);
    let mut g_prev = deriv(cache, means, variances, x_prev, &mut evals)?;
    let mut g = deriv(cache, means, variances, x, &mut evals)?;

    while evals < max_evals {
        let denom = g - g_prev;
        if denom.abs() < 1e-12 {
            break;
        }
        let x_next = (x - g * (x - x_prev) / denom).clamp(lo, hi);
        if !x_next.is_finite() {
            warn!("delta search produced a non-finite step; keeping delta={}", x.exp());
            break;
        }
        if (x_next - x).abs() < 1e-4 {
            x = x_next;
            break;
        }
        x_prev = x;
        g_prev = g;
        x = x_next;
        g = deriv(cache, means, variances, x, &mut evals)?;
    }

    let delta = x.exp();
    let (_, rho) = penny_evidence(cache, means, variances, delta)?;
    Ok((delta, rho))
}

/// Exhaustive log-spaced grid search over δ.
fn grid_search_delta(
    cache: &mut CovarianceCache,
    means: &DVector<f64>,
    variances: &DVector<f64>,
    points: usize,
) -> FabberResult<(f64, f64)> {
    let points = points.max(4);
    let (lo, hi) = (DELTA_MIN.ln(), DELTA_MAX.ln());
    let mut best = (f64::NEG_INFINITY, DELTA_MIN, RHO_FLOOR);
    for i in 0..points {
        let delta = (lo + (hi - lo) * i as f64 / (points - 1) as f64).exp();
        let (log_evidence, rho) = penny_evidence(cache, means, variances, delta)?;
        if log_evidence > best.0 {
            best = (log_evidence, delta, rho);
        }
    }
    Ok((best.1, best.2))
}

/// Shared-δ evidence optimisation across several parameters
/// (`--use-sim-evidence`): maximises the summed log evidence on a grid and
/// returns the shared δ plus each parameter's analytic ρ.
fn optimize_evidence_simultaneous(
    cache: &mut CovarianceCache,
    stats: &[(usize, SpatialStats)],
    points: usize,
) -> FabberResult<(f64, Vec<(usize, f64)>)> {
    let points = points.max(4);
    let (lo, hi) = (DELTA_MIN.ln(), DELTA_MAX.ln());
    let mut best_delta = DELTA_MIN;
    let mut best_total = f64::NEG_INFINITY;
    for i in 0..points {
        let delta = (lo + (hi - lo) * i as f64 / (points - 1) as f64).exp();
        let mut total = 0.0;
        for (_, stat) in stats {
            cache.set_covariance_ratio_diagonal(&stat.variances)?;
            let (log_evidence, _) = penny_evidence(cache, &stat.means, &stat.variances, delta)?;
            total += log_evidence;
        }
        if total > best_total {
            best_total = total;
            best_delta = delta;
        }
    }
    let mut rhos = Vec::with_capacity(stats.len());
    for (param, stat) in stats {
        cache.set_covariance_ratio_diagonal(&stat.variances)?;
        let (_, rho) = penny_evidence(cache, &stat.means, &stat.variances, best_delta)?;
        rhos.push((*param, rho));
    }
    Ok((best_delta, rhos))
}

/// Rewrite the per-voxel contributions of a shrinkage prior from the
/// current posterior means and the neighbour graph.
fn regenerate_shrinkage_prior(
    prior: &mut ParamPrior,
    graph: &NeighbourGraph,
    means: &DVector<f64>,
) {
    let v = means.len();
    let dirichlet = prior.kind == PriorKind::SpatialMDirichlet;
    let mut prior_means = DVector::zeros(v);
    let mut prior_precs = DVector::zeros(v);
    for voxel in 0..v {
        let neighbours = graph.first(voxel);
        let count = if dirichlet {
            graph.expected_first_count()
        } else {
            neighbours.len()
        };
        if !neighbours.is_empty() {
            prior_means[voxel] =
                neighbours.iter().map(|&u| means[u]).sum::<f64>() / neighbours.len() as f64;
        }
        prior_precs[voxel] = prior.rho * count as f64;
    }
    prior.set_spatial(prior_means, prior_precs);
}

/// Rewrite the per-voxel contributions of a P/p prior from a kernel
/// inverse: the conditional Gaussian of each voxel given all others.
fn regenerate_penny_prior(prior: &mut ParamPrior, kinv: &DMatrix<f64>, means: &DVector<f64>) {
    let v = means.len();
    let mut prior_means = DVector::zeros(v);
    let mut prior_precs = DVector::zeros(v);
    for voxel in 0..v {
        let diag = kinv[(voxel, voxel)];
        prior_precs[voxel] = prior.rho * diag;
        if diag.abs() > f64::MIN_POSITIVE {
            let mut cross = 0.0;
            for u in 0..v {
                if u != voxel {
                    cross += kinv[(voxel, u)] * means[u];
                }
            }
            prior_means[voxel] = -cross / diag;
        }
    }
    prior.set_spatial(prior_means, prior_precs);
}

/// Inverse of the kernel restricted to first-order neighbourhoods, for the
/// `p` prior.
fn first_order_kernel_inverse(
    cache: &CovarianceCache,
    graph: &NeighbourGraph,
    delta: f64,
) -> FabberResult<DMatrix<f64>> {
    let mut k = cache.kernel(delta);
    let v = k.nrows();
    for i in 0..v {
        for j in 0..v {
            if i != j && !graph.first(i).contains(&j) {
                k[(i, j)] = 0.0;
            }
        }
    }
    if let Some(chol) = Cholesky::new(k.clone()) {
        return Ok(chol.inverse());
    }
    // The masked kernel can lose positive definiteness; retry with jitter
    for i in 0..v {
        k[(i, i)] += 1e-6;
    }
    Cholesky::new(k)
        .map(|c| c.inverse())
        .ok_or_else(|| {
            FabberError::numerical(format!(
                "first-order kernel approximation not positive definite at delta={delta}"
            ))
        })
}

/// The spatial VB inference method.
#[derive(Debug, Default)]
pub struct SpatialVbMethod;

impl SpatialVbMethod {
    /// Extract per-parameter cross-voxel statistics from the states.
    fn gather_stats(
        states: &mut [VoxelState],
        param: usize,
    ) -> FabberResult<SpatialStats> {
        let v = states.len();
        let mut means = DVector::zeros(v);
        let mut variances = DVector::zeros(v);
        for (voxel, state) in states.iter_mut().enumerate() {
            means[voxel] = state.mvn.mean()[param];
            variances[voxel] = state.mvn.covariance()?[(param, param)];
        }
        Ok(SpatialStats { means, variances })
    }

    /// The "posterior without its prior" marginal for a P/p parameter:
    /// subtract the prior precision used in the last sweep from the
    /// posterior marginal.
    fn gather_data_only_stats(
        states: &mut [VoxelState],
        prior: &ParamPrior,
        param: usize,
    ) -> FabberResult<SpatialStats> {
        let v = states.len();
        let mut means = DVector::zeros(v);
        let mut variances = DVector::zeros(v);
        for (voxel, state) in states.iter_mut().enumerate() {
            let post_mean = state.mvn.mean()[param];
            let post_var = state.mvn.covariance()?[(param, param)];
            let eff = prior.effective(voxel, post_mean, post_var)?;
            let post_prec = 1.0 / post_var.max(DATA_PRECISION_FLOOR);
            let data_prec = (post_prec - eff.precision).max(DATA_PRECISION_FLOOR);
            means[voxel] = (post_prec * post_mean - eff.precision * eff.mean) / data_prec;
            variances[voxel] = 1.0 / data_prec;
        }
        Ok(SpatialStats { means, variances })
    }

    /// Apply the per-step ρ speed limit.
    fn clamp_rho(old_rho: f64, new_rho: f64, speed: f64) -> f64 {
        if speed > 0.0 && new_rho > old_rho * speed {
            old_rho * speed
        } else {
            new_rho
        }
    }

    /// Update (ρ, δ) for every spatial parameter from the sweep snapshot.
    #[allow(clippy::too_many_arguments)]
    fn update_hyperparameters(
        &self,
        cfg: &SpatialVbConfig,
        cache: &mut CovarianceCache,
        priors: &mut [ParamPrior],
        states: &mut [VoxelState],
    ) -> FabberResult<()> {
        // Simultaneous evidence optimisation shares one δ across every
        // P/p parameter
        if cfg.use_sim_evidence {
            let mut penny_stats = Vec::new();
            for (p, prior) in priors.iter().enumerate() {
                if matches!(
                    prior.kind,
                    PriorKind::SpatialP | PriorKind::SpatialPFirstOrder
                ) {
                    penny_stats.push((p, Self::gather_data_only_stats(states, prior, p)?));
                }
            }
            if !penny_stats.is_empty() {
                let (delta, rhos) = optimize_evidence_simultaneous(
                    cache,
                    &penny_stats,
                    cfg.new_delta_evals,
                )?;
                for (p, rho) in rhos {
                    let delta = cfg.fixed_delta.unwrap_or(delta);
                    let rho = cfg.fixed_rho.unwrap_or(rho);
                    priors[p].delta = delta;
                    priors[p].rho =
                        Self::clamp_rho(priors[p].rho, rho, cfg.spatial_speed);
                }
            }
        }

        for p in 0..priors.len() {
            let kind = priors[p].kind;
            match kind {
                PriorKind::SpatialM | PriorKind::SpatialMDirichlet => {
                    let stats = Self::gather_stats(states, p)?;
                    cache.set_covariance_ratio_diagonal(&stats.variances)?;
                    let (delta, rho) =
                        optimize_smoothing_scale(cache, &stats.means, cfg.fixed_delta)?;
                    let rho = cfg.fixed_rho.unwrap_or(rho);
                    let old_rho = priors[p].rho;
                    priors[p].delta = delta;
                    priors[p].rho = Self::clamp_rho(old_rho, rho, cfg.spatial_speed);
                    debug!(
                        "parameter {p}: smoothing update delta={delta:.4} rho={:.4}",
                        priors[p].rho
                    );
                }
                PriorKind::SpatialP | PriorKind::SpatialPFirstOrder
                    if !cfg.use_sim_evidence =>
                {
                    let stats = Self::gather_data_only_stats(states, &priors[p], p)?;
                    cache.set_covariance_ratio_diagonal(&stats.variances)?;
                    let (delta, rho) = optimize_evidence(
                        cache,
                        &stats.means,
                        &stats.variances,
                        priors[p].delta,
                        cfg.new_delta_evals,
                        cfg.brute_force_delta,
                        cfg.fixed_delta,
                    )?;
                    let rho = cfg.fixed_rho.unwrap_or(rho);
                    let old_rho = priors[p].rho;
                    priors[p].delta = delta;
                    priors[p].rho = Self::clamp_rho(old_rho, rho, cfg.spatial_speed);
                    debug!(
                        "parameter {p}: evidence update delta={delta:.4} rho={:.4}",
                        priors[p].rho
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Rewrite every spatial prior's per-voxel contributions from the
    /// current posterior snapshot.
    fn regenerate_spatial_priors(
        &self,
        cache: &mut CovarianceCache,
        graph: &NeighbourGraph,
        priors: &mut [ParamPrior],
        states: &mut [VoxelState],
    ) -> FabberResult<()> {
        for p in 0..priors.len() {
            let kind = priors[p].kind;
            if !kind.is_spatial() {
                continue;
            }
            let stats = Self::gather_stats(states, p)?;
            match kind {
                PriorKind::SpatialM | PriorKind::SpatialMDirichlet => {
                    regenerate_shrinkage_prior(&mut priors[p], graph, &stats.means);
                }
                PriorKind::SpatialP => {
                    let kinv = cache.cinv(priors[p].delta)?.clone();
                    regenerate_penny_prior(&mut priors[p], &kinv, &stats.means);
                }
                PriorKind::SpatialPFirstOrder => {
                    let kinv = first_order_kernel_inverse(cache, graph, priors[p].delta)?;
                    regenerate_penny_prior(&mut priors[p], &kinv, &stats.means);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl InferenceMethod for SpatialVbMethod {
    fn description(&self) -> String {
        "Variational Bayes with spatial priors coupling neighbouring voxels".into()
    }

    fn options(&self) -> Vec<OptionSpec> {
        let mut opts = VbMethod::common_options();
        opts.extend(vec![
            OptionSpec { name: "spatial-dims", otype: OptionType::Int, description: "Number of spatial dimensions: 0 = no smoothing, 2 = slice only, 3 = volume", required: false, default: "3" },
            OptionSpec { name: "distance-measure", otype: OptionType::Str, description: "Voxel distance metric: dist1 (Euclidean), dist2 (squared Euclidean), mdist (Manhattan)", required: false, default: "dist1" },
            OptionSpec { name: "spatial-speed", otype: OptionType::Float, description: "Maximum spatial precision increase factor per outer step; -1 for unlimited", required: false, default: "-1" },
            OptionSpec { name: "fixed-delta", otype: OptionType::Float, description: "Fix the spatial correlation length instead of optimising it", required: false, default: "" },
            OptionSpec { name: "fixed-rho", otype: OptionType::Float, description: "Fix the spatial precision magnitude instead of optimising it", required: false, default: "" },
            OptionSpec { name: "delta-guess", otype: OptionType::Float, description: "Initial guess for the spatial correlation length", required: false, default: "1.0" },
            OptionSpec { name: "update-first-iter", otype: OptionType::Bool, description: "Update spatial hyper-parameters after the very first sweep", required: false, default: "" },
            OptionSpec { name: "use-sim-evidence", otype: OptionType::Bool, description: "Optimise all evidence-based spatial priors against a single shared delta", required: false, default: "" },
            OptionSpec { name: "new-delta-evals", otype: OptionType::Int, description: "Budget of evidence evaluations per delta search", required: false, default: "10" },
            OptionSpec { name: "brute-force-delta-search", otype: OptionType::Bool, description: "Replace the secant delta search by an exhaustive grid search", required: false, default: "" },
        ]);
        opts
    }

    fn run(&mut self, ctx: &RunContext) -> FabberResult<RunOutputs> {
        let cfg = SpatialVbConfig::from_options(&ctx.options)?;
        let model = &*ctx.model;
        let defs = model.param_defs();
        let transforms: Vec<ParamTransform> = defs.iter().map(|d| d.transform).collect();
        let kinds = parse_prior_types(
            ctx.options.get_str_default("param-spatial-priors", ""),
            defs.len(),
            PriorKind::SpatialM,
        )?;
        let mut priors = build_param_priors(&defs, &kinds, &ctx.options, &ctx.data)?;

        // Seed the spatial hyper-parameters
        for prior in priors.iter_mut().filter(|p| p.kind.is_spatial()) {
            prior.delta = cfg.fixed_delta.unwrap_or(cfg.delta_guess);
            prior.rho = cfg.fixed_rho.unwrap_or(1.0);
        }

        // With spatial coupling disabled the method reduces exactly to the
        // independent per-voxel fit
        if cfg.spatial_dims == 0 || !kinds.iter().any(PriorKind::is_spatial) {
            info!("no spatial coupling requested; running independent per-voxel VB");
            let (mut states, failed) = run_plain_vb(ctx, &priors, &cfg.convergence)?;
            return collect_outputs(model, &defs, &mut states, &ctx.data, failed);
        }

        let graph = NeighbourGraph::build(ctx.data.coords(), cfg.spatial_dims)?;
        let mut cache = CovarianceCache::new(ctx.data.coords(), cfg.distance_measure);

        let noise = NoisePosterior::from_options(&ctx.options)?;
        let n_voxels = ctx.data.n_voxels();
        let mut states: Vec<VoxelState> = (0..n_voxels)
            .map(|_| init_voxel_state(&defs, noise.clone()))
            .collect::<FabberResult<_>>()?;
        let mut failed: Vec<FailedVoxel> = Vec::new();
        let mut failed_mask = vec![false; n_voxels];

        let mut prev_total_f = f64::NEG_INFINITY;
        let mut last_stable_f = f64::NEG_INFINITY;
        let mut decreases = 0usize;

        for outer in 0..cfg.convergence.max_iterations {
            if ctx.cancel.is_cancelled() {
                info!("spatial VB cancelled at outer iteration {outer}");
                break;
            }

            // 1. One VB step at every voxel, priors held fixed
            for v in 0..n_voxels {
                if failed_mask[v] {
                    continue;
                }
                let y = ctx.data.voxel_timeseries(v);
                match vb_step(model, &transforms, &priors, &y, v, &mut states[v], 0.0) {
                    Ok(_) => {}
                    Err(e) if e.is_voxel_recoverable() => {
                        let [x, y_c, z] = ctx.data.coord(v);
                        warn!("voxel {v} at ({x}, {y_c}, {z}) failed: {e}");
                        failed_mask[v] = true;
                        failed.push(FailedVoxel {
                            index: v,
                            coord: ctx.data.coord(v),
                            cause: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
            }

            // 2. Aggregate free energy drives the outer convergence
            let total_f: f64 = states
                .iter()
                .filter(|s| s.free_energy.is_finite())
                .map(|s| s.free_energy)
                .sum();
            info!("outer iteration {outer}: total free energy {total_f:.6}");

            if outer > 0 {
                let delta_f = total_f - prev_total_f;
                if delta_f < -cfg.convergence.fchange_tol {
                    decreases += 1;
                    if decreases > cfg.convergence.max_trials {
                        return Err(FabberError::numerical(format!(
                            "spatial VB diverged: free energy fell for {decreases} \
                             consecutive outer steps (last stable {last_stable_f:.6})"
                        )));
                    }
                } else {
                    decreases = 0;
                    last_stable_f = total_f;
                }
                if delta_f.abs() < cfg.convergence.fchange_tol {
                    info!("outer loop converged after {} iterations", outer + 1);
                    prev_total_f = total_f;
                    break;
                }
            } else {
                last_stable_f = total_f;
            }
            prev_total_f = total_f;

            // 3. Re-estimate (ρ, δ), gated on the first iteration
            if outer > 0 || cfg.update_first_iter {
                self.update_hyperparameters(&cfg, &mut cache, &mut priors, &mut states)?;
            }

            // 4. Rewrite the spatial prior contributions for the next sweep
            self.regenerate_spatial_priors(&mut cache, &graph, &mut priors, &mut states)?;
        }

        collect_outputs(model, &defs, &mut states, &ctx.data, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use fabber_core::{RunOptions, VoxelData};
    use fabber_models::builtin_registry;
    use nalgebra::DMatrix;

    use crate::run::CancelToken;

    fn context_for(
        data: DMatrix<f64>,
        extent: [usize; 3],
        extra: &[(&str, &str)],
    ) -> RunContext {
        let mut options = RunOptions::new();
        options.set("model", "trivial");
        for (k, v) in extra {
            options.set(*k, *v);
        }
        let data = VoxelData::from_matrix(data, extent).unwrap();
        let mut model = builtin_registry()
            .create(options.get_str("model").unwrap())
            .unwrap();
        model.initialize(&options, data.n_timepoints()).unwrap();
        RunContext {
            options,
            data,
            model,
            cancel: CancelToken::new(),
        }
    }

    fn line_cache(n: i32) -> CovarianceCache {
        let coords: Vec<[i32; 3]> = (0..n).map(|x| [x, 0, 0]).collect();
        CovarianceCache::new(&coords, DistanceMeasure::Euclidean)
    }

    #[test]
    fn test_smoothing_scale_prefers_long_delta_for_smooth_field() {
        let mut cache = line_cache(8);
        // A smooth (nearly constant) mean field and small variances
        let smooth = DVector::from_fn(8, |i, _| 1.0 + 0.01 * i as f64);
        let variances = DVector::from_element(8, 0.01);
        cache.set_covariance_ratio_diagonal(&variances).unwrap();
        let (delta_smooth, _) = optimize_smoothing_scale(&mut cache, &smooth, None).unwrap();

        let mut cache2 = line_cache(8);
        // A rough, sign-alternating field
        let rough = DVector::from_fn(8, |i, _| if i % 2 == 0 { 1.0 } else { -1.0 });
        cache2.set_covariance_ratio_diagonal(&variances).unwrap();
        let (delta_rough, _) = optimize_smoothing_scale(&mut cache2, &rough, None).unwrap();

        assert!(
            delta_smooth > delta_rough,
            "smooth field should prefer longer correlation: {delta_smooth} vs {delta_rough}"
        );
    }

    #[test]
    fn test_fixed_delta_skips_search_and_solves_rho() {
        let mut cache = line_cache(4);
        let means = DVector::from_element(4, 1.0);
        let variances = DVector::from_element(4, 0.1);
        cache.set_covariance_ratio_diagonal(&variances).unwrap();
        let (delta, rho) = optimize_smoothing_scale(&mut cache, &means, Some(2.5)).unwrap();
        assert_relative_eq!(delta, 2.5);
        assert!(rho > 0.0);
    }

    #[test]
    fn test_evidence_search_stays_in_bounds() {
        let mut cache = line_cache(6);
        let means = DVector::from_fn(6, |i, _| (i as f64 * 0.7).sin());
        let variances = DVector::from_element(6, 0.5);
        cache.set_covariance_ratio_diagonal(&variances).unwrap();
        let (delta, rho) =
            optimize_evidence(&mut cache, &means, &variances, 1.0, 10, false, None).unwrap();
        assert!((DELTA_MIN..=DELTA_MAX).contains(&delta));
        assert!(rho > 0.0);
    }

    #[test]
    fn test_brute_force_matches_grid_argmax() {
        let mut cache = line_cache(6);
        let means = DVector::from_element(6, 0.5);
        let variances = DVector::from_element(6, 0.2);
        cache.set_covariance_ratio_diagonal(&variances).unwrap();
        let (delta, _) =
            optimize_evidence(&mut cache, &means, &variances, 1.0, 12, true, None).unwrap();
        // The grid candidates are log-spaced over the search bounds
        assert!((DELTA_MIN..=DELTA_MAX).contains(&delta));
    }

    #[test]
    fn test_shrinkage_prior_regeneration() {
        let coords: Vec<[i32; 3]> = (0..3).map(|x| [x, 0, 0]).collect();
        let graph = NeighbourGraph::build(&coords, 1).unwrap();
        let mut prior = ParamPrior::new(
            PriorKind::SpatialM,
            fabber_core::DistParams::new(0.0, 1e6).unwrap(),
        );
        prior.rho = 2.0;
        let means = DVector::from_row_slice(&[1.0, 2.0, 4.0]);
        regenerate_shrinkage_prior(&mut prior, &graph, &means);

        let spatial_means = prior.spatial_means.as_ref().unwrap();
        let spatial_precs = prior.spatial_precisions.as_ref().unwrap();
        // Middle voxel averages its two neighbours
        assert_relative_eq!(spatial_means[1], 2.5);
        // Edge voxels see their single neighbour
        assert_relative_eq!(spatial_means[0], 2.0);
        // Precision scales with neighbour count
        assert_relative_eq!(spatial_precs[0], 2.0);
        assert_relative_eq!(spatial_precs[1], 4.0);
    }

    #[test]
    fn test_dirichlet_variant_uses_expected_count_at_edges() {
        let coords: Vec<[i32; 3]> = (0..3).map(|x| [x, 0, 0]).collect();
        let graph = NeighbourGraph::build(&coords, 1).unwrap();
        let mut prior = ParamPrior::new(
            PriorKind::SpatialMDirichlet,
            fabber_core::DistParams::new(0.0, 1e6).unwrap(),
        );
        prior.rho = 1.0;
        let means = DVector::from_row_slice(&[1.0, 1.0, 1.0]);
        regenerate_shrinkage_prior(&mut prior, &graph, &means);
        let precs = prior.spatial_precisions.as_ref().unwrap();
        // Every voxel gets the lattice-expected count 2·dims = 2
        assert_relative_eq!(precs[0], 2.0);
        assert_relative_eq!(precs[1], 2.0);
        assert_relative_eq!(precs[2], 2.0);
    }

    #[test]
    fn test_penny_prior_conditional_means() {
        let mut cache = line_cache(3);
        let kinv = cache.cinv(1.0).unwrap().clone();
        let mut prior = ParamPrior::new(
            PriorKind::SpatialP,
            fabber_core::DistParams::new(0.0, 1e6).unwrap(),
        );
        prior.rho = 1.0;
        // A constant field: each voxel's conditional mean under the GP
        // prior should be pulled toward its neighbours' (equal) values
        let means = DVector::from_element(3, 3.0);
        regenerate_penny_prior(&mut prior, &kinv, &means);
        let spatial_means = prior.spatial_means.as_ref().unwrap();
        for v in 0..3 {
            assert!(
                (spatial_means[v] - 3.0).abs() < 1.5,
                "conditional mean should be near the field value"
            );
        }
        let precs = prior.spatial_precisions.as_ref().unwrap();
        for v in 0..3 {
            assert_relative_eq!(precs[v], kinv[(v, v)]);
        }
    }

    #[test]
    fn test_identical_voxels_get_identical_posteriors() {
        // Two voxels with identical data under a spatial-M prior must end
        // with identical posteriors
        let mut data = DMatrix::zeros(8, 2);
        for t in 0..8 {
            data[(t, 0)] = 2.0 + 0.1 * t as f64;
            data[(t, 1)] = 2.0 + 0.1 * t as f64;
        }
        let ctx = context_for(
            data,
            [2, 1, 1],
            &[
                ("method", "spatialvb"),
                ("spatial-dims", "1"),
                ("fixed-rho", "1"),
                ("max-iterations", "8"),
            ],
        );
        let outputs = SpatialVbMethod.run(&ctx).unwrap();
        assert!(outputs.failed.is_empty());
        assert_abs_diff_eq!(
            outputs.means[(0, 0)],
            outputs.means[(0, 1)],
            epsilon = 1e-10
        );
        assert_abs_diff_eq!(
            outputs.stds[(0, 0)],
            outputs.stds[(0, 1)],
            epsilon = 1e-10
        );
    }

    #[test]
    fn test_spatial_dims_zero_matches_plain_vb() {
        let mut data = DMatrix::zeros(10, 3);
        for v in 0..3 {
            for t in 0..10 {
                data[(t, v)] = 1.0 + v as f64;
            }
        }
        let spatial_ctx = context_for(
            data.clone(),
            [3, 1, 1],
            &[("method", "spatialvb"), ("spatial-dims", "0")],
        );
        let spatial = SpatialVbMethod.run(&spatial_ctx).unwrap();

        let vb_ctx = context_for(data, [3, 1, 1], &[("method", "vb")]);
        let plain = crate::run::VbMethod.run(&vb_ctx).unwrap();

        for v in 0..3 {
            assert_abs_diff_eq!(
                spatial.means[(0, v)],
                plain.means[(0, v)],
                epsilon = 1e-12
            );
            assert_abs_diff_eq!(
                spatial.free_energy[(0, v)],
                plain.free_energy[(0, v)],
                epsilon = 1e-12
            );
        }
    }

    #[test]
    fn test_config_validation() {
        let mut opts = RunOptions::new();
        opts.set("spatial-speed", "0.5");
        assert!(SpatialVbConfig::from_options(&opts).is_err());

        let mut opts = RunOptions::new();
        opts.set("spatial-dims", "5");
        assert!(SpatialVbConfig::from_options(&opts).is_err());

        let mut opts = RunOptions::new();
        opts.set("delta-guess", "-1");
        assert!(SpatialVbConfig::from_options(&opts).is_err());
    }

    #[test]
    fn test_rho_speed_clamp() {
        assert_relative_eq!(SpatialVbMethod::clamp_rho(1.0, 100.0, 2.0), 2.0);
        assert_relative_eq!(SpatialVbMethod::clamp_rho(1.0, 1.5, 2.0), 1.5);
        // Unlimited
        assert_relative_eq!(SpatialVbMethod::clamp_rho(1.0, 100.0, -1.0), 100.0);
    }
}
