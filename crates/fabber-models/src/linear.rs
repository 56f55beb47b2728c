//! Linear forward model: a weighted sum of regressors.
//!
//! The prediction is ŷ = X·θ where X is a T×P design matrix supplied as a
//! 2-D `.npy` file via `--design=<file>`. Without a design file the model
//! has a single constant regressor, making it equivalent to fitting the
//! data mean.

use std::fs::File;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;

use fabber_core::{
    DistParams, FabberError, FabberResult, ForwardModel, OptionSpec, OptionType, ParamDef,
    ParamTransform, RunOptions,
};

/// Forward model predicting a linear combination of design-matrix columns.
#[derive(Debug)]
pub struct LinearModel {
    design: DMatrix<f64>,
}

impl Default for LinearModel {
    fn default() -> Self {
        Self {
            design: DMatrix::zeros(0, 0),
        }
    }
}

impl LinearModel {
    /// Create an unconfigured linear model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn load_design(path: &Path, n_timepoints: usize) -> FabberResult<DMatrix<f64>> {
        if !path.exists() {
            return Err(FabberError::data_not_found(path.display().to_string()));
        }
        let file = File::open(path).map_err(|e| FabberError::data_load(path, e.to_string()))?;
        let arr = Array2::<f64>::read_npy(file)
            .map_err(|e| FabberError::data_load(path, e.to_string()))?;
        if arr.nrows() != n_timepoints {
            return Err(FabberError::dimension_mismatch(
                format!("design matrix '{}'", path.display()),
                format!("{n_timepoints} rows"),
                format!("{} rows", arr.nrows()),
            ));
        }
        Ok(DMatrix::from_fn(arr.nrows(), arr.ncols(), |i, j| {
            arr[[i, j]]
        }))
    }
}

impl ForwardModel for LinearModel {
    fn description(&self) -> String {
        "Model in which the data is a linear combination of design regressors".into()
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec {
            name: "design",
            otype: OptionType::Matrix,
            description: "T x P design matrix as a 2d .npy file. Default is a single constant regressor",
            required: false,
            default: "",
        }]
    }

    fn initialize(&mut self, options: &RunOptions, n_timepoints: usize) -> FabberResult<()> {
        let design_file = options.get_str_default("design", "");
        self.design = if design_file.is_empty() {
            DMatrix::from_element(n_timepoints, 1, 1.0)
        } else {
            Self::load_design(Path::new(design_file), n_timepoints)?
        };
        Ok(())
    }

    fn param_defs(&self) -> Vec<ParamDef> {
        let prior = DistParams::new(0.0, 1e6).expect("vague prior is valid");
        let posterior = DistParams::new(0.0, 10.0).expect("initial posterior is valid");
        (0..self.design.ncols())
            .map(|i| ParamDef {
                name: format!("beta{i}"),
                transform: ParamTransform::Identity,
                prior,
                posterior,
            })
            .collect()
    }

    fn evaluate(&self, params: &DVector<f64>) -> FabberResult<DVector<f64>> {
        if params.len() != self.design.ncols() {
            return Err(FabberError::dimension_mismatch(
                "linear model parameters",
                self.design.ncols().to_string(),
                params.len().to_string(),
            ));
        }
        Ok(&self.design * params)
    }

    fn jacobian(&self, _params: &DVector<f64>) -> FabberResult<DMatrix<f64>> {
        Ok(self.design.clone())
    }
}
