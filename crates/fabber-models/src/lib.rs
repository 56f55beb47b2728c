//! # Fabber Models
//!
//! Built-in forward models for the fabber engine.
//!
//! - [`TrivialModel`]: a single constant-valued parameter
//! - [`PolynomialModel`]: c₀ + c₁t + c₂t² + … up to a configured degree
//! - [`LinearModel`]: a weighted sum of regressors from a design matrix
//!
//! All three are registered by [`builtin_registry`] under the names
//! `trivial`, `poly` and `linear`, matching their `--model=<name>` values.

#![forbid(unsafe_code)]

pub mod linear;
pub mod poly;
pub mod trivial;

pub use linear::LinearModel;
pub use poly::PolynomialModel;
pub use trivial::TrivialModel;

use fabber_core::ModelRegistry;

/// The registry of built-in forward models.
///
/// Built once at program start; lookups are by the `--model` option value.
#[must_use]
pub fn builtin_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry.register("trivial", || Box::new(TrivialModel::new()));
    registry.register("poly", || Box::new(PolynomialModel::new()));
    registry.register("linear", || Box::new(LinearModel::new()));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_models_are_registered() {
        let registry = builtin_registry();
        assert_eq!(registry.names(), vec!["linear", "poly", "trivial"]);
        assert!(registry.create("poly").is_ok());
    }
}
