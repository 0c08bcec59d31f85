// SPDX-License-Identifier: AGPL-3.0-only

//! Gradient descent for one binary-search step
//!
//! ```text
//! Initialized ──step──▶ Running ──stall at check point──▶ EarlyStopped
//!                          │
//!                          └──max_iterations──▶ Completed
//! ```
//!
//! Check points fall every `max(max_iterations / 10, 1)` iterations. The
//! stall detector is coarse: it compares the aggregate loss, not
//! per-example progress.

use crate::backend::AttackBackend;
use crate::config::{AttackConfig, TrackingCadence};
use crate::error::{AttackError, Result};
use crate::tracker::BestTracker;
use tracing::{debug, trace};

/// Loss the stall detector compares the first check point against
pub const INITIAL_PREVIOUS_LOSS: f32 = 1e6;

/// Relative improvement a check point must beat
pub const STALL_TOLERANCE: f32 = 0.9999;

/// Optimizer loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescentState {
    /// Modifier zeroed, optimizer state cleared
    Initialized,
    /// Taking gradient steps
    Running,
    /// Stopped at a check point because the loss stalled
    EarlyStopped,
    /// Ran every iteration
    Completed,
}

impl std::fmt::Display for DescentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Running => write!(f, "running"),
            Self::EarlyStopped => write!(f, "early-stopped"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// How one descent ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescentOutcome {
    /// Terminal state
    pub state: DescentState,
    /// Gradient steps taken
    pub iterations: usize,
    /// Aggregate loss of the last step
    pub last_loss: f32,
}

/// Coarse early-abort detector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StallDetector {
    interval: usize,
    enabled: bool,
    previous: f32,
}

impl StallDetector {
    /// Detector checking every `interval` iterations
    pub fn new(interval: usize, enabled: bool) -> Self {
        Self {
            interval: interval.max(1),
            enabled,
            previous: INITIAL_PREVIOUS_LOSS,
        }
    }

    /// Whether `iteration` is a check point
    pub const fn is_check_point(&self, iteration: usize) -> bool {
        iteration % self.interval == 0
    }

    /// Record a check-point loss; true when it failed to improve on the last one
    pub fn stalled(&mut self, loss: f32) -> bool {
        if !self.enabled {
            return false;
        }
        let stalled = loss > self.previous * STALL_TOLERANCE;
        self.previous = loss;
        stalled
    }
}

/// Where a descent runs, for error reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescentContext {
    /// Batch index
    pub batch: usize,
    /// Binary-search step
    pub outer_step: usize,
}

/// Run one outer step's gradient descent
///
/// Resets the backend, then steps until `max_iterations` or a stall. The
/// tracker is fed at check points (or every iteration with
/// [`TrackingCadence::EveryIteration`]) before the stall test.
///
/// # Errors
///
/// Returns `NonFinite` if the loss becomes NaN or infinite, and propagates
/// backend errors.
pub fn run_descent(
    backend: &mut dyn AttackBackend,
    tracker: &mut BestTracker,
    config: &AttackConfig,
    context: DescentContext,
) -> Result<DescentOutcome> {
    backend.reset();
    let mut outcome = DescentOutcome {
        state: DescentState::Initialized,
        iterations: 0,
        last_loss: f32::NAN,
    };
    let mut detector = StallDetector::new(config.check_interval(), config.abort_early);

    for iteration in 0..config.max_iterations {
        outcome.state = DescentState::Running;
        let out = backend.step()?;
        outcome.iterations = iteration + 1;
        outcome.last_loss = out.loss;

        if !out.loss.is_finite() {
            return Err(AttackError::NonFinite {
                batch: context.batch,
                outer_step: context.outer_step,
                iteration,
                loss: out.loss,
            });
        }

        let check_point = detector.is_check_point(iteration);
        if check_point || config.tracking == TrackingCadence::EveryIteration {
            tracker.update(out.l2.view(), out.logits.view(), out.adv_images.view());
        }
        if check_point {
            trace!(
                "batch {} step {} iteration {iteration}: loss {}",
                context.batch,
                context.outer_step,
                out.loss
            );
            if detector.stalled(out.loss) {
                debug!(
                    "batch {} step {}: loss stalled at iteration {iteration}",
                    context.batch, context.outer_step
                );
                outcome.state = DescentState::EarlyStopped;
                return Ok(outcome);
            }
        }
    }

    outcome.state = DescentState::Completed;
    Ok(outcome)
}
