//! Run orchestration: inference methods, sweeps, and result assembly.
//!
//! An [`InferenceMethod`] consumes a [`RunContext`] (options, data and a
//! configured forward model) and produces [`RunOutputs`]: per-voxel
//! posterior summaries in model space, noise moments, free energy, model
//! fit, residuals, and the packed final MVN.
//!
//! Numerical failures inside a voxel mark that voxel failed (logged with
//! its coordinates) and leave its posterior at the last good state while
//! the sweep continues. The run is reported unsuccessful if any voxel
//! failed.

use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nalgebra::{DMatrix, DVector};
use tracing::error;

use fabber_core::{
    load_image_vector, write_volume, FabberError, FabberResult, ForwardModel, OptionSpec,
    OptionType, ParamDef, ParamTransform, RunOptions, SaveFlags, VoxelData,
};

use crate::convergence::ConvergenceConfig;
use crate::noise::NoisePosterior;
use crate::prior::{parse_prior_types, ParamPrior, PriorKind};
use crate::spatial::SpatialVbMethod;
use crate::vb::{fit_voxel, init_voxel_state, linearise, VoxelState};

/// Cooperative cancellation checked at voxel boundaries and at the start
/// of each outer iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that has not been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// Percentage progress on stdout, updated in place.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    last: i64,
    enabled: bool,
}

impl ProgressReporter {
    /// A reporter that prints to stdout.
    #[must_use]
    pub fn stdout() -> Self {
        Self {
            last: -1,
            enabled: true,
        }
    }

    /// A silent reporter, for tests and embedding.
    #[must_use]
    pub fn silent() -> Self {
        Self {
            last: -1,
            enabled: false,
        }
    }

    /// Report that `voxel` of `n_voxels` is done.
    pub fn progress(&mut self, voxel: usize, n_voxels: usize) {
        if !self.enabled {
            return;
        }
        let percent = if n_voxels == 0 {
            100
        } else {
            (100 * voxel / n_voxels) as i64
        };
        if percent > self.last {
            self.last = percent;
            print!("\r{percent}%");
            let _ = std::io::stdout().flush();
            if percent == 100 {
                println!();
            }
        }
    }
}

/// Everything an inference method needs for a run.
pub struct RunContext {
    /// The option store
    pub options: RunOptions,
    /// Masked voxel data and coordinates
    pub data: VoxelData,
    /// The configured forward model
    pub model: Box<dyn ForwardModel>,
    /// Cooperative cancellation token
    pub cancel: CancelToken,
}

/// A voxel whose update failed, with its coordinates and cause.
#[derive(Debug, Clone)]
pub struct FailedVoxel {
    /// Flat voxel index
    pub index: usize,
    /// Lattice coordinates
    pub coord: [i32; 3],
    /// Failure description
    pub cause: String,
}

/// Per-voxel results of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutputs {
    /// Model parameter names, in order
    pub param_names: Vec<String>,
    /// P×V posterior means, model space
    pub means: DMatrix<f64>,
    /// P×V posterior standard deviations, model space
    pub stds: DMatrix<f64>,
    /// P×V z-statistics (mean / std)
    pub zstats: DMatrix<f64>,
    /// 1×V noise precision posterior means
    pub noise_mean: DMatrix<f64>,
    /// 1×V noise precision posterior standard deviations
    pub noise_std: DMatrix<f64>,
    /// 1×V final free energy
    pub free_energy: DMatrix<f64>,
    /// T×V model prediction at the posterior mean
    pub model_fit: DMatrix<f64>,
    /// T×V residuals (data − model fit)
    pub residuals: DMatrix<f64>,
    /// Packed final MVN, (P+1)(P+2)/2 rows × V
    pub final_mvn: DMatrix<f64>,
    /// Voxels that failed during inference
    pub failed: Vec<FailedVoxel>,
}

/// A named inference method.
pub trait InferenceMethod: Send {
    /// One-line description, shown by `--help --method=<name>`.
    fn description(&self) -> String;

    /// The options this method accepts.
    fn options(&self) -> Vec<OptionSpec>;

    /// Run inference over every voxel.
    fn run(&mut self, ctx: &RunContext) -> FabberResult<RunOutputs>;
}

/// Factory function producing an inference method instance.
pub type MethodFactory = fn() -> Box<dyn InferenceMethod>;

/// Registry of inference methods keyed by name.
#[derive(Default)]
pub struct MethodRegistry {
    factories: std::collections::BTreeMap<String, MethodFactory>,
}

impl MethodRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a method name.
    pub fn register(&mut self, name: impl Into<String>, factory: MethodFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate a method by name.
    pub fn create(&self, name: &str) -> FabberResult<Box<dyn InferenceMethod>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                FabberError::invalid_option(
                    "method",
                    name,
                    format!("unknown method; known methods: {}", self.names().join(", ")),
                )
            })
    }

    /// Names of all registered methods, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

/// The built-in inference methods.
#[must_use]
pub fn builtin_methods() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("vb", || Box::new(VbMethod::default()));
    registry.register("spatialvb", || Box::new(SpatialVbMethod::default()));
    registry
}

/// Build the per-parameter prior system from the model definitions and the
/// prior-type string, loading image volumes where requested.
///
/// Base priors and image means are mapped into fabber space through each
/// parameter's transform.
pub fn build_param_priors(
    defs: &[ParamDef],
    kinds: &[PriorKind],
    options: &RunOptions,
    data: &VoxelData,
) -> FabberResult<Vec<ParamPrior>> {
    let mut priors = Vec::with_capacity(defs.len());
    for (def, &kind) in defs.iter().zip(kinds) {
        let base = def.transform.to_fabber_dist(def.prior)?;
        let mut prior = ParamPrior::new(kind, base);
        if kind == PriorKind::Image {
            let key = format!("prior-image-{}", def.name);
            let file = options.get_str(&key)?;
            let model_means = load_image_vector(Path::new(file), data)?;
            let fabber_means = model_means.map(|m| def.transform.to_fabber(m));
            prior = prior.with_image_means(fabber_means);
        }
        priors.push(prior);
    }
    Ok(priors)
}

/// Run an independent per-voxel VB fit over every voxel.
///
/// Shared by the `vb` method and by the spatial coordinator when spatial
/// coupling is disabled.
pub fn run_plain_vb(
    ctx: &RunContext,
    priors: &[ParamPrior],
    config: &ConvergenceConfig,
) -> FabberResult<(Vec<VoxelState>, Vec<FailedVoxel>)> {
    let model = &*ctx.model;
    let defs = model.param_defs();
    let transforms: Vec<ParamTransform> = defs.iter().map(|d| d.transform).collect();
    let noise = NoisePosterior::from_options(&ctx.options)?;
    let n_voxels = ctx.data.n_voxels();

    let mut states = Vec::with_capacity(n_voxels);
    let mut failed = Vec::new();
    let mut progress = ProgressReporter::stdout();

    for v in 0..n_voxels {
        let mut state = init_voxel_state(&defs, noise.clone())?;
        if ctx.cancel.is_cancelled() {
            // Leave remaining voxels at their initial state so outputs
            // stay dimensionally consistent
            states.push(state);
            continue;
        }
        let y = ctx.data.voxel_timeseries(v);
        match fit_voxel(model, &transforms, priors, &y, v, &mut state, config) {
            Ok(_iterations) => {}
            Err(e) if e.is_voxel_recoverable() => {
                let [x, y_c, z] = ctx.data.coord(v);
                error!("voxel {v} at ({x}, {y_c}, {z}) failed: {e}");
                failed.push(FailedVoxel {
                    index: v,
                    coord: ctx.data.coord(v),
                    cause: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
        states.push(state);
        progress.progress(v + 1, n_voxels);
    }
    Ok((states, failed))
}

/// Summarise per-voxel states into run outputs.
pub fn collect_outputs(
    model: &dyn ForwardModel,
    defs: &[ParamDef],
    states: &mut [VoxelState],
    data: &VoxelData,
    failed: Vec<FailedVoxel>,
) -> FabberResult<RunOutputs> {
    let p = defs.len();
    let v = states.len();
    let t = data.n_timepoints();
    let transforms: Vec<ParamTransform> = defs.iter().map(|d| d.transform).collect();

    let mut means = DMatrix::zeros(p, v);
    let mut stds = DMatrix::zeros(p, v);
    let mut zstats = DMatrix::zeros(p, v);
    let mut noise_mean = DMatrix::zeros(1, v);
    let mut noise_std = DMatrix::zeros(1, v);
    let mut free_energy = DMatrix::zeros(1, v);
    let mut model_fit = DMatrix::zeros(t, v);
    let mut residuals = DMatrix::zeros(t, v);
    let packed_len = (p + 1) * (p + 2) / 2;
    let mut final_mvn = DMatrix::zeros(packed_len, v);

    for (voxel, state) in states.iter_mut().enumerate() {
        let fab_mean = state.mvn.mean().clone();
        let cov = state.mvn.covariance()?.clone();
        for i in 0..p {
            let fab = fabber_core::DistParams::new(fab_mean[i], cov[(i, i)].max(f64::MIN_POSITIVE))?;
            let model_dist = transforms[i].to_model_dist(fab)?;
            means[(i, voxel)] = model_dist.mean();
            let std = model_dist.var().sqrt();
            stds[(i, voxel)] = std;
            zstats[(i, voxel)] = if std > 0.0 { model_dist.mean() / std } else { 0.0 };
        }

        let (nm, ns) = state.noise.moments();
        noise_mean[(0, voxel)] = nm;
        noise_std[(0, voxel)] = ns;
        free_energy[(0, voxel)] = state.free_energy;

        let lin = linearise(model, &transforms, &fab_mean)?;
        let y = data.voxel_timeseries(voxel);
        for row in 0..t {
            model_fit[(row, voxel)] = lin.prediction[row];
            residuals[(row, voxel)] = y[row] - lin.prediction[row];
        }

        let packed = state.mvn.pack_symmatrix()?;
        for row in 0..packed_len {
            final_mvn[(row, voxel)] = packed[row];
        }
    }

    Ok(RunOutputs {
        param_names: defs.iter().map(|d| d.name.clone()).collect(),
        means,
        stds,
        zstats,
        noise_mean,
        noise_std,
        free_energy,
        model_fit,
        residuals,
        final_mvn,
        failed,
    })
}

/// Write the selected outputs to the output directory.
pub fn write_outputs(
    dir: &Path,
    outputs: &RunOutputs,
    data: &VoxelData,
    flags: &SaveFlags,
) -> FabberResult<()> {
    for (i, name) in outputs.param_names.iter().enumerate() {
        let row = |m: &DMatrix<f64>| DMatrix::from_fn(1, m.ncols(), |_, c| m[(i, c)]);
        if flags.mean {
            write_volume(dir, &format!("mean_{name}"), &row(&outputs.means), data)?;
        }
        if flags.std {
            write_volume(dir, &format!("std_{name}"), &row(&outputs.stds), data)?;
        }
        if flags.zstat {
            write_volume(dir, &format!("zstat_{name}"), &row(&outputs.zstats), data)?;
        }
    }
    if flags.noise_mean {
        write_volume(dir, "noise_mean", &outputs.noise_mean, data)?;
    }
    if flags.noise_std {
        write_volume(dir, "noise_std", &outputs.noise_std, data)?;
    }
    if flags.free_energy {
        write_volume(dir, "freeEnergy", &outputs.free_energy, data)?;
    }
    if flags.model_fit {
        write_volume(dir, "modelfit", &outputs.model_fit, data)?;
    }
    if flags.residuals {
        write_volume(dir, "residuals", &outputs.residuals, data)?;
    }
    if flags.mvn {
        write_volume(dir, "finalMVN", &outputs.final_mvn, data)?;
    }

    let names_path = dir.join("paramnames.txt");
    let mut file = std::fs::File::create(&names_path)
        .map_err(|e| FabberError::data_load(&names_path, e.to_string()))?;
    for name in &outputs.param_names {
        writeln!(file, "{name}").map_err(|e| FabberError::data_load(&names_path, e.to_string()))?;
    }
    Ok(())
}

/// The plain per-voxel VB method.
#[derive(Debug, Default)]
pub struct VbMethod;

impl VbMethod {
    /// Options shared by every VB-family method.
    pub(crate) fn common_options() -> Vec<OptionSpec> {
        vec![
            OptionSpec { name: "convergence", otype: OptionType::Str, description: "Convergence policy: maxits, fchange, trialmode or lm", required: false, default: "trialmode" },
            OptionSpec { name: "max-iterations", otype: OptionType::Int, description: "Maximum number of VB iterations", required: false, default: "10" },
            OptionSpec { name: "fchange", otype: OptionType::Float, description: "Free-energy change tolerance for convergence", required: false, default: "0.01" },
            OptionSpec { name: "max-trials", otype: OptionType::Int, description: "Maximum reverted trials before giving up on a step", required: false, default: "10" },
            OptionSpec { name: "noise-prior-shape", otype: OptionType::Float, description: "Shape of the Gamma prior on the noise precision", required: false, default: "1e-6" },
            OptionSpec { name: "noise-prior-scale", otype: OptionType::Float, description: "Scale of the Gamma prior on the noise precision", required: false, default: "1e6" },
            OptionSpec { name: "ar1-alpha-var", otype: OptionType::Float, description: "Prior variance of the AR(1) coefficient", required: false, default: "1.0" },
            OptionSpec { name: "param-spatial-priors", otype: OptionType::Str, description: "Prior type per parameter, one character each (N, I, A; spatial types M, m, P, p with --method=spatialvb). A trailing + repeats the final character", required: false, default: "" },
            OptionSpec { name: "prior-image-<param>", otype: OptionType::Image, description: "Image supplying the voxelwise prior mean for a parameter with an I prior", required: false, default: "" },
        ]
    }
}

impl InferenceMethod for VbMethod {
    fn description(&self) -> String {
        "Variational Bayes inference, each voxel fitted independently".into()
    }

    fn options(&self) -> Vec<OptionSpec> {
        Self::common_options()
    }

    fn run(&mut self, ctx: &RunContext) -> FabberResult<RunOutputs> {
        let defs = ctx.model.param_defs();
        let kinds = parse_prior_types(
            ctx.options.get_str_default("param-spatial-priors", ""),
            defs.len(),
            PriorKind::Normal,
        )?;
        if kinds.iter().any(PriorKind::is_spatial) {
            return Err(FabberError::invalid_option(
                "param-spatial-priors",
                ctx.options.get_str_default("param-spatial-priors", ""),
                "spatial prior types require --method=spatialvb",
            ));
        }
        let priors = build_param_priors(&defs, &kinds, &ctx.options, &ctx.data)?;
        let config = ConvergenceConfig::from_options(&ctx.options)?;
        let (mut states, failed) = run_plain_vb(ctx, &priors, &config)?;
        collect_outputs(&*ctx.model, &defs, &mut states, &ctx.data, failed)
    }
}
