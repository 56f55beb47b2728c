//! Convergence detection for the per-voxel VB loop.
//!
//! Four policies are available via `--convergence`:
//!
//! - `maxits`: run a fixed number of iterations
//! - `fchange`: stop when |ΔF| falls below `--fchange`
//! - `trialmode`: as `fchange`, but a free-energy decrease triggers a
//!   revert-and-retry, giving up after `--max-trials` consecutive reverts
//! - `lm`: Levenberg-style damping; a decrease inflates a damping factor
//!   applied to the data term of the precision update and reverts the step
//!
//! Detectors are stateful and owned per voxel; [`ConvergenceDetector::check`]
//! is called once per inner iteration with the newly computed free energy.

use fabber_core::{FabberError, FabberResult, RunOptions};

/// Default inner-iteration cap.
const DEFAULT_MAX_ITERATIONS: usize = 10;
/// Default |ΔF| tolerance.
const DEFAULT_FCHANGE: f64 = 0.01;
/// Default revert budget for trial mode.
const DEFAULT_MAX_TRIALS: usize = 10;
/// Initial LM damping when the first revert happens.
const LM_INITIAL_DAMPING: f64 = 1e-4;
/// LM damping ceiling; exceeding it is reported as divergence.
const LM_MAX_DAMPING: f64 = 1e6;
/// LM damping below this is snapped back to zero.
const LM_MIN_DAMPING: f64 = 1e-8;

/// What the detector concluded after seeing the latest free energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Keep iterating
    Continue,
    /// The voxel has converged; the latest state stands
    Converged,
    /// The step made things worse; revert it and retry
    Reverted,
    /// The update is diverging; abandon the voxel
    Diverged,
}

/// Which convergence policy is in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergencePolicy {
    /// Hard iteration cap only
    MaxIts,
    /// |ΔF| threshold
    FChange,
    /// |ΔF| threshold with revert-and-retry on decreases
    TrialMode,
    /// Levenberg-style damping on decreases
    Lm,
}

/// Detector configuration shared by every voxel.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceConfig {
    /// Active policy
    pub policy: ConvergencePolicy,
    /// Iteration cap
    pub max_iterations: usize,
    /// |ΔF| tolerance
    pub fchange_tol: f64,
    /// Maximum consecutive reverts before giving up
    pub max_trials: usize,
}

impl ConvergenceConfig {
    /// Read the convergence configuration from run options.
    pub fn from_options(options: &RunOptions) -> FabberResult<Self> {
        let policy = match options.get_str_default("convergence", "trialmode") {
            "maxits" => ConvergencePolicy::MaxIts,
            "fchange" => ConvergencePolicy::FChange,
            "trialmode" => ConvergencePolicy::TrialMode,
            "lm" => ConvergencePolicy::Lm,
            other => {
                return Err(FabberError::invalid_option(
                    "convergence",
                    other,
                    "known policies: maxits, fchange, trialmode, lm",
                ))
            }
        };
        let max_iterations =
            options.get_int_default("max-iterations", DEFAULT_MAX_ITERATIONS as i64)?;
        if max_iterations < 1 {
            return Err(FabberError::invalid_option(
                "max-iterations",
                max_iterations.to_string(),
                "must be at least 1",
            ));
        }
        let fchange_tol = options.get_f64_default("fchange", DEFAULT_FCHANGE)?;
        let max_trials = options.get_int_default("max-trials", DEFAULT_MAX_TRIALS as i64)?;
        if max_trials < 1 {
            return Err(FabberError::invalid_option(
                "max-trials",
                max_trials.to_string(),
                "must be at least 1",
            ));
        }
        Ok(Self {
            policy,
            max_iterations: max_iterations as usize,
            fchange_tol,
            max_trials: max_trials as usize,
        })
    }
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            policy: ConvergencePolicy::TrialMode,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            fchange_tol: DEFAULT_FCHANGE,
            max_trials: DEFAULT_MAX_TRIALS,
        }
    }
}

/// Stateful per-voxel convergence detector.
#[derive(Debug, Clone)]
pub struct ConvergenceDetector {
    config: ConvergenceConfig,
    iteration: usize,
    prev_f: Option<f64>,
    trials: usize,
    damping: f64,
}

impl ConvergenceDetector {
    /// A fresh detector for one voxel.
    #[must_use]
    pub fn new(config: ConvergenceConfig) -> Self {
        Self {
            config,
            iteration: 0,
            prev_f: None,
            trials: 0,
            damping: 0.0,
        }
    }

    /// Reset to the initial state, keeping the configuration.
    pub fn reset(&mut self) {
        self.iteration = 0;
        self.prev_f = None;
        self.trials = 0;
        self.damping = 0.0;
    }

    /// Iterations accepted so far.
    #[must_use]
    pub fn iterations(&self) -> usize {
        self.iteration
    }

    /// The current Levenberg damping factor (zero unless the `lm` policy
    /// has reverted at least once).
    #[must_use]
    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Report the free energy of the latest proposed step.
    pub fn check(&mut self, f: f64) -> ConvergenceStatus {
        if !f.is_finite() {
            return ConvergenceStatus::Diverged;
        }
        let prev = self.prev_f;

        match self.config.policy {
            ConvergencePolicy::MaxIts => {
                self.accept(f);
                self.capped_or_continue()
            }
            ConvergencePolicy::FChange => {
                self.accept(f);
                if let Some(prev) = prev {
                    if (f - prev).abs() < self.config.fchange_tol {
                        return ConvergenceStatus::Converged;
                    }
                }
                self.capped_or_continue()
            }
            ConvergencePolicy::TrialMode => {
                if let Some(prev) = prev {
                    if f < prev - self.config.fchange_tol {
                        self.trials += 1;
                        if self.trials >= self.config.max_trials {
                            // Out of trials: settle on the last good state
                            return ConvergenceStatus::Converged;
                        }
                        return ConvergenceStatus::Reverted;
                    }
                    if (f - prev).abs() < self.config.fchange_tol {
                        self.trials = 0;
                        self.accept(f);
                        return ConvergenceStatus::Converged;
                    }
                }
                self.trials = 0;
                self.accept(f);
                self.capped_or_continue()
            }
            ConvergencePolicy::Lm => {
                if let Some(prev) = prev {
                    if f < prev - self.config.fchange_tol {
                        self.damping = if self.damping == 0.0 {
                            LM_INITIAL_DAMPING
                        } else {
                            self.damping * 10.0
                        };
                        if self.damping > LM_MAX_DAMPING {
                            return ConvergenceStatus::Diverged;
                        }
                        return ConvergenceStatus::Reverted;
                    }
                    // Accepted step: relax the damping
                    self.damping /= 10.0;
                    if self.damping < LM_MIN_DAMPING {
                        self.damping = 0.0;
                    }
                    if (f - prev).abs() < self.config.fchange_tol {
                        self.accept(f);
                        return ConvergenceStatus::Converged;
                    }
                }
                self.accept(f);
                self.capped_or_continue()
            }
        }
    }

    fn accept(&mut self, f: f64) {
        self.iteration += 1;
        self.prev_f = Some(f);
    }

    fn capped_or_continue(&self) -> ConvergenceStatus {
        if self.iteration >= self.config.max_iterations {
            ConvergenceStatus::Converged
        } else {
            ConvergenceStatus::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(policy: ConvergencePolicy) -> ConvergenceConfig {
        ConvergenceConfig {
            policy,
            max_iterations: 5,
            fchange_tol: 0.01,
            max_trials: 3,
        }
    }

    #[test]
    fn test_maxits_ignores_free_energy() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::MaxIts));
        for i in 0..4 {
            assert_eq!(det.check(-1000.0 * i as f64), ConvergenceStatus::Continue);
        }
        assert_eq!(det.check(-1e9), ConvergenceStatus::Converged);
    }

    #[test]
    fn test_fchange_stops_on_small_delta() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::FChange));
        assert_eq!(det.check(-100.0), ConvergenceStatus::Continue);
        assert_eq!(det.check(-50.0), ConvergenceStatus::Continue);
        assert_eq!(det.check(-49.995), ConvergenceStatus::Converged);
    }

    #[test]
    fn test_trialmode_reverts_on_decrease() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::TrialMode));
        assert_eq!(det.check(-100.0), ConvergenceStatus::Continue);
        assert_eq!(det.check(-110.0), ConvergenceStatus::Reverted);
        assert_eq!(det.check(-120.0), ConvergenceStatus::Reverted);
        // Third bad trial exhausts the budget and settles
        assert_eq!(det.check(-130.0), ConvergenceStatus::Converged);
    }

    #[test]
    fn test_trialmode_trial_counter_resets_on_improvement() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::TrialMode));
        assert_eq!(det.check(-100.0), ConvergenceStatus::Continue);
        assert_eq!(det.check(-110.0), ConvergenceStatus::Reverted);
        assert_eq!(det.check(-90.0), ConvergenceStatus::Continue);
        assert_eq!(det.check(-101.0), ConvergenceStatus::Reverted);
        assert_eq!(det.check(-102.0), ConvergenceStatus::Reverted);
    }

    #[test]
    fn test_lm_damping_inflates_and_relaxes() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::Lm));
        assert_eq!(det.damping(), 0.0);
        det.check(-100.0);
        assert_eq!(det.check(-150.0), ConvergenceStatus::Reverted);
        assert!((det.damping() - LM_INITIAL_DAMPING).abs() < 1e-12);
        assert_eq!(det.check(-160.0), ConvergenceStatus::Reverted);
        assert!((det.damping() - LM_INITIAL_DAMPING * 10.0).abs() < 1e-12);

        // An accepted step divides the damping back down
        assert_eq!(det.check(-50.0), ConvergenceStatus::Continue);
        assert!((det.damping() - LM_INITIAL_DAMPING).abs() < 1e-12);
    }

    #[test]
    fn test_lm_runaway_damping_is_divergence() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::Lm));
        det.check(-100.0);
        let mut status = ConvergenceStatus::Continue;
        for _ in 0..60 {
            status = det.check(-200.0);
            if status == ConvergenceStatus::Diverged {
                break;
            }
        }
        assert_eq!(status, ConvergenceStatus::Diverged);
    }

    #[test]
    fn test_non_finite_free_energy_is_divergence() {
        let mut det = ConvergenceDetector::new(config(ConvergencePolicy::FChange));
        assert_eq!(det.check(f64::NAN), ConvergenceStatus::Diverged);
    }

    #[test]
    fn test_config_from_options() {
        let mut opts = RunOptions::new();
        opts.set("convergence", "lm");
        opts.set("max-iterations", "25");
        opts.set("fchange", "0.001");
        let cfg = ConvergenceConfig::from_options(&opts).unwrap();
        assert_eq!(cfg.policy, ConvergencePolicy::Lm);
        assert_eq!(cfg.max_iterations, 25);
        assert!((cfg.fchange_tol - 0.001).abs() < 1e-15);

        let mut bad = RunOptions::new();
        bad.set("convergence", "psychic");
        assert!(ConvergenceConfig::from_options(&bad).is_err());
    }
}
