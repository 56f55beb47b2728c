//! # Fabber Inference
//!
//! Variational Bayes inference for the fabber model-fitting engine.
//!
//! The per-voxel core ([`vb`]) performs coordinate ascent on a factorised
//! posterior q(θ)·q(φ) under a linearised forward model, with pluggable
//! [`prior`]s, [`noise`] models and [`convergence`] policies. The spatial
//! extension ([`spatial`]) couples voxels by re-estimating per-parameter
//! spatial hyper-parameters (ρ, δ) between sweeps, backed by the
//! [`neighbours`] graph and the δ-keyed [`covariance`] cache.
//!
//! Inference methods are constructed by name through
//! [`run::builtin_methods`]:
//!
//! - `vb`: every voxel fitted independently
//! - `spatialvb`: voxels coupled through spatial priors
//!
//! ## Example
//!
//! ```rust,no_run
//! use fabber_core::{RunOptions, VoxelData};
//! use fabber_infer::run::{builtin_methods, CancelToken, RunContext};
//! use fabber_models::builtin_registry;
//! use nalgebra::DMatrix;
//!
//! let mut options = RunOptions::new();
//! options.set("model", "poly");
//! options.set("degree", "2");
//!
//! let data = VoxelData::from_matrix(DMatrix::zeros(10, 4), [2, 2, 1]).unwrap();
//! let mut model = builtin_registry().create("poly").unwrap();
//! model.initialize(&options, data.n_timepoints()).unwrap();
//!
//! let ctx = RunContext { options, data, model, cancel: CancelToken::new() };
//! let outputs = builtin_methods().create("vb").unwrap().run(&ctx).unwrap();
//! ```

#![forbid(unsafe_code)]

pub mod convergence;
pub mod covariance;
pub mod neighbours;
pub mod noise;
pub mod prior;
pub mod run;
pub mod spatial;
pub mod vb;

pub use convergence::{ConvergenceConfig, ConvergenceDetector, ConvergencePolicy, ConvergenceStatus};
pub use covariance::{CovarianceCache, DeltaKey, DistanceMeasure};
pub use neighbours::NeighbourGraph;
pub use noise::NoisePosterior;
pub use prior::{parse_prior_types, ParamPrior, PriorKind};
pub use run::{
    builtin_methods, CancelToken, FailedVoxel, InferenceMethod, MethodRegistry, RunContext,
    RunOutputs, VbMethod,
};
pub use spatial::{SpatialVbConfig, SpatialVbMethod};
pub use vb::{fit_voxel, init_voxel_state, vb_step, VoxelState};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
