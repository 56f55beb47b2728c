//! The trivial forward model: one parameter, constant prediction.
//!
//! Useful as a reference model and for exercising the inference machinery:
//! fitting it to data estimates the data mean with posterior variance
//! 1/(T·E[φ]).

use nalgebra::{DMatrix, DVector};

use fabber_core::{
    DistParams, FabberResult, ForwardModel, ParamDef, ParamTransform, RunOptions,
};

/// Forward model predicting a constant value at every timepoint.
#[derive(Debug, Default)]
pub struct TrivialModel {
    n_timepoints: usize,
}

impl TrivialModel {
    /// Create an unconfigured trivial model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ForwardModel for TrivialModel {
    fn description(&self) -> String {
        "Model in which the data is a constant value".into()
    }

    fn initialize(&mut self, _options: &RunOptions, n_timepoints: usize) -> FabberResult<()> {
        self.n_timepoints = n_timepoints;
        Ok(())
    }

    fn param_defs(&self) -> Vec<ParamDef> {
        let prior = DistParams::new(0.0, 1e6).expect("vague prior is valid");
        let posterior = DistParams::new(0.0, 10.0).expect("initial posterior is valid");
        vec![ParamDef {
            name: "value".into(),
            transform: ParamTransform::Identity,
            prior,
            posterior,
        }]
    }

    fn evaluate(&self, params: &DVector<f64>) -> FabberResult<DVector<f64>> {
        Ok(DVector::from_element(self.n_timepoints, params[0]))
    }

    fn jacobian(&self, _params: &DVector<f64>) -> FabberResult<DMatrix<f64>> {
        Ok(DMatrix::from_element(self.n_timepoints, 1, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_prediction() {
        let mut model = TrivialModel::new();
        model.initialize(&RunOptions::new(), 4).unwrap();

        let pred = model.evaluate(&DVector::from_row_slice(&[2.5])).unwrap();
        assert_eq!(pred.len(), 4);
        assert_relative_eq!(pred[3], 2.5);

        let jac = model.jacobian(&DVector::from_row_slice(&[2.5])).unwrap();
        assert_eq!(jac.shape(), (4, 1));
        assert_relative_eq!(jac[(0, 0)], 1.0);
    }
}
