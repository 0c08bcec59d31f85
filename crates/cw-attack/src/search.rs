// SPDX-License-Identifier: AGPL-3.0-only

//! Binary search over the tradeoff constant
//!
//! Per example the search grows the constant tenfold until a success gives
//! an upper bound, then bisects between the bounds:
//!
//! - success: `upper = min(upper, c)`, then `c = (lower + upper) / 2`
//! - failure: `lower = max(lower, c)`, then bisect if `upper` is known,
//!   else `c *= 10`
//!
//! An upper bound counts as known below `1e9`.

use crate::backend::AttackBackend;
use crate::config::{AttackConfig, Fallback};
use crate::descent::{run_descent, DescentContext, DescentOutcome};
use crate::error::Result;
use crate::tracker::BestTracker;
use cw_models::argmax;
use ndarray::{Array1, Array4, ArrayView1, ArrayView2, ArrayView4, Zip};
use tracing::debug;

/// Initial upper bound
pub const UPPER_SENTINEL: f32 = 1e10;

/// Upper bounds below this are known
pub const KNOWN_UPPER_LIMIT: f32 = 1e9;

/// Per-example search interval and current constants
#[derive(Debug, Clone, PartialEq)]
pub struct SearchBounds {
    lower: Array1<f32>,
    upper: Array1<f32>,
    consts: Array1<f32>,
}

impl SearchBounds {
    /// `[0, 1e10)` with every constant at `initial_const`
    pub fn new(batch: usize, initial_const: f32) -> Self {
        Self {
            lower: Array1::zeros(batch),
            upper: Array1::from_elem(batch, UPPER_SENTINEL),
            consts: Array1::from_elem(batch, initial_const),
        }
    }

    /// Lower bounds
    pub fn lower(&self) -> ArrayView1<'_, f32> {
        self.lower.view()
    }

    /// Upper bounds
    pub fn upper(&self) -> ArrayView1<'_, f32> {
        self.upper.view()
    }

    /// Constants for the next outer step
    pub fn consts(&self) -> ArrayView1<'_, f32> {
        self.consts.view()
    }

    /// Use the upper bounds as constants (final pass in repeat mode)
    pub fn force_upper(&mut self) {
        self.consts.assign(&self.upper);
    }

    /// Adjust bounds and constants from this step's per-example success
    pub fn update(&mut self, succeeded: &[bool]) {
        let succeeded = ArrayView1::from(succeeded);
        Zip::from(&mut self.lower)
            .and(&mut self.upper)
            .and(&mut self.consts)
            .and(&succeeded)
            .for_each(|lower, upper, c, &ok| {
                if ok {
                    *upper = upper.min(*c);
                    if *upper < KNOWN_UPPER_LIMIT {
                        *c = (*lower + *upper) / 2.0;
                    }
                } else {
                    *lower = lower.max(*c);
                    if *upper < KNOWN_UPPER_LIMIT {
                        *c = (*lower + *upper) / 2.0;
                    } else {
                        *c *= 10.0;
                    }
                }
            });
    }
}

/// Snapshot after one outer step
#[derive(Debug, Clone)]
pub struct OuterStepTrace {
    /// Step index
    pub outer_step: usize,
    /// Constants the step ran with
    pub consts: Array1<f32>,
    /// Lower bounds after the update
    pub lower: Array1<f32>,
    /// Upper bounds after the update
    pub upper: Array1<f32>,
    /// Batch-scope best distances after the step
    pub best_l2: Array1<f32>,
    /// How the descent ended
    pub descent: DescentOutcome,
}

/// Every outer step of one batch
#[derive(Debug, Clone, Default)]
pub struct SearchTrace {
    /// Steps in order
    pub steps: Vec<OuterStepTrace>,
}

impl SearchTrace {
    /// Whether bounds only narrowed and best distances never grew
    pub fn is_monotone(&self) -> bool {
        self.steps.windows(2).all(|w| {
            let (a, b) = (&w[0], &w[1]);
            Zip::from(&a.lower)
                .and(&b.lower)
                .and(&a.upper)
                .and(&b.upper)
                .all(|&la, &lb, &ua, &ub| la <= lb && ub <= ua)
                && Zip::from(&a.best_l2).and(&b.best_l2).all(|&x, &y| y <= x)
        })
    }
}

/// Result of attacking one batch
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    /// Batch index
    pub index: usize,
    /// Offset of the first example in the full input
    pub start: usize,
    /// Best adversarial image, or the fallback
    pub adversarial: Array4<f32>,
    /// Best distance, `1e10` where no success was recorded
    pub best_l2: Array1<f32>,
    /// Predicted class of the best image
    pub best_class: Vec<Option<usize>>,
    /// Outer-step history
    pub trace: SearchTrace,
}

/// Run the full binary search on one batch
///
/// # Errors
///
/// Propagates backend setup and descent errors.
pub fn attack_batch(
    backend: &mut dyn AttackBackend,
    images: ArrayView4<'_, f32>,
    labels: ArrayView2<'_, f32>,
    config: &AttackConfig,
    index: usize,
    start: usize,
) -> Result<BatchOutcome> {
    let batch = images.dim().0;
    backend.setup(images, labels)?;

    let label_idx: Vec<usize> = labels
        .outer_iter()
        .map(|row| argmax(row.iter().copied()))
        .collect();
    let fallback = match config.fallback {
        Fallback::Original => images.to_owned(),
        Fallback::Zeros => Array4::zeros(images.raw_dim()),
    };
    let mut tracker = BestTracker::new(label_idx, fallback, config.targeted, config.confidence);
    let mut bounds = SearchBounds::new(batch, config.initial_const);
    let mut trace = SearchTrace::default();

    for outer_step in 0..config.binary_search_steps {
        tracker.start_step();
        if config.repeat_mode() && outer_step + 1 == config.binary_search_steps {
            bounds.force_upper();
        }
        let consts = bounds.consts().to_owned();
        backend.set_consts(consts.view())?;
        debug!(
            "batch {index} step {outer_step}: consts {:?}",
            consts.as_slice().unwrap_or_default()
        );

        let descent = run_descent(
            backend,
            &mut tracker,
            config,
            DescentContext {
                batch: index,
                outer_step,
            },
        )?;

        bounds.update(&tracker.step_succeeded());
        debug!(
            "batch {index} step {outer_step}: {} after {} iterations, {} of {batch} succeeded",
            descent.state,
            descent.iterations,
            tracker.step_succeeded().iter().filter(|&&s| s).count()
        );

        trace.steps.push(OuterStepTrace {
            outer_step,
            consts,
            lower: bounds.lower().to_owned(),
            upper: bounds.upper().to_owned(),
            best_l2: tracker.best_l2().to_owned(),
            descent,
        });
    }

    let (adversarial, best_l2, best_class) = tracker.into_parts();
    Ok(BatchOutcome {
        index,
        start,
        adversarial,
        best_l2,
        best_class,
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_failure_grows_exponentially() {
        let mut b = SearchBounds::new(1, 1e-3);
        b.update(&[false]);
        assert_abs_diff_eq!(b.consts()[0], 1e-2, epsilon = 1e-9);
        assert_abs_diff_eq!(b.lower()[0], 1e-3, epsilon = 1e-9);
        assert_eq!(b.upper()[0], UPPER_SENTINEL);
    }

    #[test]
    fn test_success_then_bisect() {
        let mut b = SearchBounds::new(1, 1.0);
        b.update(&[true]);
        assert_eq!(b.upper()[0], 1.0);
        assert_abs_diff_eq!(b.consts()[0], 0.5);
        b.update(&[false]);
        assert_abs_diff_eq!(b.lower()[0], 0.5);
        assert_abs_diff_eq!(b.consts()[0], 0.75);
        b.update(&[true]);
        assert_abs_diff_eq!(b.upper()[0], 0.75);
        assert_abs_diff_eq!(b.consts()[0], 0.625);
    }

    #[test]
    fn test_const_stays_within_known_bounds() {
        let mut b = SearchBounds::new(3, 0.1);
        let pattern = [[true, false, true], [false, false, true], [true, true, false]];
        for step in pattern.iter().cycle().take(12) {
            b.update(step);
            for e in 0..3 {
                if b.upper()[e] < KNOWN_UPPER_LIMIT {
                    assert!(b.lower()[e] <= b.consts()[e] && b.consts()[e] <= b.upper()[e]);
                }
            }
        }
    }

    #[test]
    fn test_force_upper() {
        let mut b = SearchBounds::new(2, 1.0);
        b.update(&[true, false]);
        b.force_upper();
        assert_eq!(b.consts()[0], 1.0);
        assert_eq!(b.consts()[1], UPPER_SENTINEL);
    }
}
