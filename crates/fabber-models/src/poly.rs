//! Polynomial forward model.
//!
//! Fits data to c₀ + c₁t + c₂t² + … with t = 1..T, up to the degree given
//! by the required `--degree` option.

use nalgebra::{DMatrix, DVector};

use fabber_core::{
    DistParams, FabberResult, ForwardModel, OptionSpec, OptionType, ParamDef, ParamTransform,
    RunOptions,
};

/// Forward model fitting a simple polynomial function of the timepoint
/// index.
#[derive(Debug, Default)]
pub struct PolynomialModel {
    degree: usize,
    n_timepoints: usize,
}

impl PolynomialModel {
    /// Create an unconfigured polynomial model.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ForwardModel for PolynomialModel {
    fn description(&self) -> String {
        "Model which fits data to a simple polynomial function: c0 + c1x + c2x^2 ... etc".into()
    }

    fn options(&self) -> Vec<OptionSpec> {
        vec![OptionSpec {
            name: "degree",
            otype: OptionType::Int,
            description: "Maximum power in the polynomial function",
            required: true,
            default: "",
        }]
    }

    fn initialize(&mut self, options: &RunOptions, n_timepoints: usize) -> FabberResult<()> {
        let degree = options.get_int("degree")?;
        if degree < 0 {
            return Err(fabber_core::FabberError::invalid_option(
                "degree",
                degree.to_string(),
                "degree must be non-negative",
            ));
        }
        self.degree = degree as usize;
        self.n_timepoints = n_timepoints;
        Ok(())
    }

    fn param_defs(&self) -> Vec<ParamDef> {
        let prior = DistParams::new(0.0, 1e6).expect("vague prior is valid");
        let posterior = DistParams::new(0.0, 10.0).expect("initial posterior is valid");
        (0..=self.degree)
            .map(|i| ParamDef {
                name: format!("c{i}"),
                transform: ParamTransform::Identity,
                prior,
                posterior,
            })
            .collect()
    }

    fn evaluate(&self, params: &DVector<f64>) -> FabberResult<DVector<f64>> {
        Ok(DVector::from_fn(self.n_timepoints, |i, _| {
            let t = (i + 1) as f64;
            let mut power = 1.0;
            let mut value = 0.0;
            for n in 0..=self.degree {
                value += params[n] * power;
                power *= t;
            }
            value
        }))
    }

    fn jacobian(&self, _params: &DVector<f64>) -> FabberResult<DMatrix<f64>> {
        // Linear in the coefficients: J[t][n] = (t+1)^n
        Ok(DMatrix::from_fn(self.n_timepoints, self.degree + 1, |i, n| {
            ((i + 1) as f64).powi(n as i32)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn configured(degree: i64, n_timepoints: usize) -> PolynomialModel {
        let mut model = PolynomialModel::new();
        let mut opts = RunOptions::new();
        opts.set("degree", degree.to_string());
        model.initialize(&opts, n_timepoints).unwrap();
        model
    }

    #[test]
    fn test_degree_is_required() {
        let mut model = PolynomialModel::new();
        assert!(model.initialize(&RunOptions::new(), 5).is_err());
    }

    #[test]
    fn test_param_names_follow_degree() {
        let model = configured(2, 5);
        let names: Vec<String> = model.param_defs().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["c0", "c1", "c2"]);
    }

    #[test]
    fn test_evaluate_quadratic() {
        let model = configured(2, 3);
        // y(t) = 3 + 2t - t² at t = 1, 2, 3
        let pred = model
            .evaluate(&DVector::from_row_slice(&[3.0, 2.0, -1.0]))
            .unwrap();
        assert_relative_eq!(pred[0], 4.0);
        assert_relative_eq!(pred[1], 3.0);
        assert_relative_eq!(pred[2], 0.0);
    }

    #[test]
    fn test_analytic_jacobian_matches_numerical() {
        let model = configured(2, 4);
        let theta = DVector::from_row_slice(&[1.0, -0.5, 0.25]);
        let analytic = model.jacobian(&theta).unwrap();

        // Compare against the trait's central-difference default
        struct Numeric<'a>(&'a PolynomialModel);
        impl ForwardModel for Numeric<'_> {
            fn description(&self) -> String {
                self.0.description()
            }
            fn initialize(&mut self, _: &RunOptions, _: usize) -> FabberResult<()> {
                Ok(())
            }
            fn param_defs(&self) -> Vec<ParamDef> {
                self.0.param_defs()
            }
            fn evaluate(&self, params: &DVector<f64>) -> FabberResult<DVector<f64>> {
                self.0.evaluate(params)
            }
        }
        let numerical = Numeric(&model).jacobian(&theta).unwrap();
        for i in 0..4 {
            for j in 0..3 {
                assert_relative_eq!(analytic[(i, j)], numerical[(i, j)], epsilon = 1e-4);
            }
        }
    }
}
