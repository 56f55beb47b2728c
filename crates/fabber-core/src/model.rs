//! The forward-model abstraction.
//!
//! A [`ForwardModel`] maps a parameter vector θ (in *model space*) to a
//! predicted timeseries ŷ of length T, optionally with an analytic
//! Jacobian. Models also describe their parameters: display name, the
//! transform tying model space to the internally-Gaussian fabber space, and
//! hard-coded initial prior/posterior distributions.
//!
//! Concrete models register themselves in a [`ModelRegistry`], a read-only
//! table built once at program start and consulted by name.

use nalgebra::{DMatrix, DVector};

use crate::dist::DistParams;
use crate::error::{FabberError, FabberResult};
use crate::options::{OptionSpec, RunOptions};
use crate::transform::ParamTransform;

/// Relative step used by the numerical Jacobian.
const JACOBIAN_REL_STEP: f64 = 1e-5;

/// Description of a single model parameter.
#[derive(Debug, Clone)]
pub struct ParamDef {
    /// Display name, used in output volume names
    pub name: String,
    /// Transform between fabber space and model space
    pub transform: ParamTransform,
    /// Hard-coded initial prior, in model space
    pub prior: DistParams,
    /// Hard-coded initial posterior, in model space
    pub posterior: DistParams,
}

impl ParamDef {
    /// A parameter with an identity transform and identical vague prior and
    /// posterior.
    pub fn vague(name: impl Into<String>, var: f64) -> FabberResult<Self> {
        let dist = DistParams::new(0.0, var)?;
        Ok(Self {
            name: name.into(),
            transform: ParamTransform::Identity,
            prior: dist,
            posterior: dist,
        })
    }
}

/// A parametric forward model evaluated per voxel.
pub trait ForwardModel: Send {
    /// One-line description, shown by `--help --model=<name>`.
    fn description(&self) -> String;

    /// The options this model accepts.
    fn options(&self) -> Vec<OptionSpec> {
        Vec::new()
    }

    /// Configure the model from run options, given the number of timepoints
    /// in the data.
    fn initialize(&mut self, options: &RunOptions, n_timepoints: usize) -> FabberResult<()>;

    /// Parameter descriptions. Only valid after `initialize`.
    fn param_defs(&self) -> Vec<ParamDef>;

    /// Number of model parameters.
    fn n_params(&self) -> usize {
        self.param_defs().len()
    }

    /// Evaluate the prediction ŷ(θ) for model-space parameters θ.
    fn evaluate(&self, params: &DVector<f64>) -> FabberResult<DVector<f64>>;

    /// The T×P Jacobian ∂ŷ/∂θ at θ, in model space.
    ///
    /// The default implementation uses central differences with a
    /// per-component relative step; models with analytic derivatives
    /// should override it.
    fn jacobian(&self, params: &DVector<f64>) -> FabberResult<DMatrix<f64>> {
        let p = params.len();
        let base = self.evaluate(params)?;
        let t = base.len();
        let mut jac = DMatrix::zeros(t, p);
        for j in 0..p {
            let h = JACOBIAN_REL_STEP * params[j].abs().max(1.0);
            let mut up = params.clone();
            up[j] += h;
            let mut down = params.clone();
            down[j] -= h;
            let f_up = self.evaluate(&up)?;
            let f_down = self.evaluate(&down)?;
            let scale = 1.0 / (2.0 * h);
            for i in 0..t {
                jac[(i, j)] = (f_up[i] - f_down[i]) * scale;
            }
        }
        Ok(jac)
    }
}

/// Factory function producing an unconfigured model instance.
pub type ModelFactory = fn() -> Box<dyn ForwardModel>;

/// Registry of forward models keyed by name.
///
/// Built once at startup and never mutated afterwards, so shared references
/// are safe across threads.
#[derive(Default)]
pub struct ModelRegistry {
    factories: std::collections::BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under a model name.
    pub fn register(&mut self, name: impl Into<String>, factory: ModelFactory) {
        self.factories.insert(name.into(), factory);
    }

    /// Instantiate a model by name.
    pub fn create(&self, name: &str) -> FabberResult<Box<dyn ForwardModel>> {
        self.factories
            .get(name)
            .map(|factory| factory())
            .ok_or_else(|| {
                FabberError::invalid_option(
                    "model",
                    name,
                    format!("unknown model; known models: {}", self.names().join(", ")),
                )
            })
    }

    /// Names of all registered models, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}
