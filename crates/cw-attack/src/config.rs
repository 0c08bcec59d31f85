// SPDX-License-Identifier: AGPL-3.0-only

//! Attack configuration
//!
//! One immutable struct, built with chained setters and validated once when
//! the attack is constructed.

use crate::backend::BackendSelection;
use crate::error::{AttackError, Result};
use cw_models::ImageShape;

/// Default number of binary-search steps over the tradeoff constant
pub const DEFAULT_BINARY_SEARCH_STEPS: usize = 9;

/// Default cap on gradient steps per binary-search step
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// Default Adam step size
pub const DEFAULT_LEARNING_RATE: f32 = 1e-2;

/// Default starting tradeoff constant
pub const DEFAULT_INITIAL_CONST: f32 = 1e-3;

/// Default examples per batch
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// What an example that never succeeded returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fallback {
    /// The unperturbed input image
    #[default]
    Original,
    /// An all-zero image
    Zeros,
}

/// When the best-result tracker is consulted during gradient descent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrackingCadence {
    /// Only at early-abort check points
    #[default]
    CheckPoints,
    /// After every gradient step
    EveryIteration,
}

/// Carlini-Wagner L2 configuration
#[derive(Debug, Clone, PartialEq)]
pub struct AttackConfig {
    /// Geometry of one input image
    pub image_shape: ImageShape,
    /// Number of classifier outputs
    pub num_labels: usize,
    /// Outer iterations over the tradeoff constant
    pub binary_search_steps: usize,
    /// Inner gradient steps per outer iteration
    pub max_iterations: usize,
    /// Adam step size
    pub learning_rate: f32,
    /// Targeted (reach a chosen class) or untargeted (leave the true class)
    pub targeted: bool,
    /// Logit margin required for success
    pub confidence: f32,
    /// Starting tradeoff constant
    pub initial_const: f32,
    /// Stop an outer step early when the loss stalls
    pub abort_early: bool,
    /// Examples attacked together
    pub batch_size: usize,
    /// In targeted mode, draw targets at random instead of taking labels as targets
    pub random_targets: bool,
    /// Seed for target selection
    pub seed: u64,
    /// Output for examples with no success
    pub fallback: Fallback,
    /// Tracker cadence
    pub tracking: TrackingCadence,
    /// Execution backend
    pub backend: BackendSelection,
}

impl AttackConfig {
    /// Defaults for the given input geometry
    pub fn new(image_shape: ImageShape, num_labels: usize) -> Self {
        Self {
            image_shape,
            num_labels,
            binary_search_steps: DEFAULT_BINARY_SEARCH_STEPS,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            learning_rate: DEFAULT_LEARNING_RATE,
            targeted: true,
            confidence: 0.0,
            initial_const: DEFAULT_INITIAL_CONST,
            abort_early: true,
            batch_size: DEFAULT_BATCH_SIZE,
            random_targets: true,
            seed: 0,
            fallback: Fallback::default(),
            tracking: TrackingCadence::default(),
            backend: BackendSelection::Auto,
        }
    }

    /// Set binary-search step count
    #[must_use]
    pub fn with_binary_search_steps(mut self, steps: usize) -> Self {
        self.binary_search_steps = steps;
        self
    }

    /// Set inner iteration cap
    #[must_use]
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Set Adam step size
    #[must_use]
    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set targeted mode
    #[must_use]
    pub fn with_targeted(mut self, targeted: bool) -> Self {
        self.targeted = targeted;
        self
    }

    /// Set success margin
    #[must_use]
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    /// Set starting tradeoff constant
    #[must_use]
    pub fn with_initial_const(mut self, initial_const: f32) -> Self {
        self.initial_const = initial_const;
        self
    }

    /// Enable or disable stall detection
    #[must_use]
    pub fn with_abort_early(mut self, abort_early: bool) -> Self {
        self.abort_early = abort_early;
        self
    }

    /// Set batch size
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Draw random targets in targeted mode
    #[must_use]
    pub fn with_random_targets(mut self, random_targets: bool) -> Self {
        self.random_targets = random_targets;
        self
    }

    /// Set target-selection seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set fallback for failed examples
    #[must_use]
    pub fn with_fallback(mut self, fallback: Fallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Set tracker cadence
    #[must_use]
    pub fn with_tracking(mut self, tracking: TrackingCadence) -> Self {
        self.tracking = tracking;
        self
    }

    /// Set backend
    #[must_use]
    pub fn with_backend(mut self, backend: BackendSelection) -> Self {
        self.backend = backend;
        self
    }

    /// Whether the final outer step forces `const = upper_bound`
    #[must_use]
    pub const fn repeat_mode(&self) -> bool {
        self.binary_search_steps >= 10
    }

    /// Inner iterations between early-abort check points
    #[must_use]
    pub fn check_interval(&self) -> usize {
        (self.max_iterations / 10).max(1)
    }

    /// Reject configurations the search cannot run with
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending option.
    pub fn validate(&self) -> Result<()> {
        if self.image_shape.is_empty() {
            return Err(AttackError::invalid_config(format!(
                "image shape {} has a zero dimension",
                self.image_shape
            )));
        }
        if self.num_labels < 2 {
            return Err(AttackError::invalid_config(format!(
                "need at least 2 labels, got {}",
                self.num_labels
            )));
        }
        if self.binary_search_steps == 0 {
            return Err(AttackError::invalid_config("binary_search_steps must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(AttackError::invalid_config("max_iterations must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(AttackError::invalid_config("batch_size must be at least 1"));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(AttackError::invalid_config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !(self.initial_const.is_finite() && self.initial_const > 0.0) {
            return Err(AttackError::invalid_config(format!(
                "initial_const must be positive and finite, got {}",
                self.initial_const
            )));
        }
        if !(self.confidence.is_finite() && self.confidence >= 0.0) {
            return Err(AttackError::invalid_config(format!(
                "confidence must be non-negative and finite, got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AttackConfig {
        AttackConfig::new(ImageShape::square(28, 1), 10)
    }

    #[test]
    fn test_defaults() {
        let config = base();
        assert_eq!(config.binary_search_steps, 9);
        assert_eq!(config.max_iterations, 1000);
        assert!(config.targeted);
        assert!(config.abort_early);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.fallback, Fallback::Original);
        assert!(!config.repeat_mode());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_check_interval_never_zero() {
        assert_eq!(base().check_interval(), 100);
        assert_eq!(base().with_max_iterations(5).check_interval(), 1);
    }

    #[test]
    fn test_repeat_mode_threshold() {
        assert!(base().with_binary_search_steps(10).repeat_mode());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(base().with_learning_rate(0.0).validate().is_err());
        assert!(base().with_learning_rate(f32::NAN).validate().is_err());
        assert!(base().with_confidence(-1.0).validate().is_err());
        assert!(base().with_batch_size(0).validate().is_err());
        assert!(base().with_binary_search_steps(0).validate().is_err());
        assert!(base().with_initial_const(0.0).validate().is_err());
        assert!(AttackConfig::new(ImageShape::square(2, 1), 1).validate().is_err());
        assert!(AttackConfig::new(ImageShape::new(0, 2, 1), 3).validate().is_err());
    }
}
