//! # Fabber Core
//!
//! Core types for the fabber Bayesian model-fitting engine.
//!
//! This crate provides the foundational building blocks used throughout the
//! fabber workspace:
//!
//! - **Distributions**: [`DistParams`] and [`GammaParams`] for scalar
//!   distribution parameters, and [`MvnDist`] for the multivariate Gaussian
//!   with lazily synchronised covariance/precision representations.
//!
//! - **Transforms**: [`ParamTransform`] bijections between the internally
//!   Gaussian "fabber space" and the parameter domain the forward model
//!   consumes.
//!
//! - **Run options**: the [`RunOptions`] `--key=value` store, parameter-file
//!   parsing, and output-directory resolution.
//!
//! - **Forward models**: the [`ForwardModel`] trait and the name-keyed
//!   [`ModelRegistry`] factory.
//!
//! - **Voxel data**: masked flattening of 4-D volumes into the T×V data
//!   matrix the inference engine operates on, and reinflation of results.
//!
//! ## Example
//!
//! ```rust
//! use fabber_core::{DistParams, ParamTransform};
//!
//! // A log-normal parameter: Gaussian in fabber space, positive in model space
//! let fabber_space = DistParams::new(0.0, 1.0).unwrap();
//! let model_space = ParamTransform::Log.to_model_dist(fabber_space).unwrap();
//! assert!(model_space.mean() > 0.0);
//! ```

#![forbid(unsafe_code)]

pub mod dist;
pub mod error;
pub mod io;
pub mod model;
pub mod mvn;
pub mod options;
pub mod transform;

pub use dist::{DistParams, GammaParams};
pub use error::{FabberError, FabberResult};
pub use io::{load_image_vector, load_voxel_data, write_volume, DataOrder, VoxelData};
pub use model::{ForwardModel, ModelFactory, ModelRegistry, ParamDef};
pub use mvn::MvnDist;
pub use options::{core_option_specs, OptionSpec, OptionType, RunOptions, SaveFlags};
pub use transform::ParamTransform;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::dist::{DistParams, GammaParams};
    pub use crate::error::{FabberError, FabberResult};
    pub use crate::io::VoxelData;
    pub use crate::model::{ForwardModel, ModelRegistry, ParamDef};
    pub use crate::mvn::MvnDist;
    pub use crate::options::RunOptions;
    pub use crate::transform::ParamTransform;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_valid() {
        assert!(!VERSION.is_empty());
    }
}
