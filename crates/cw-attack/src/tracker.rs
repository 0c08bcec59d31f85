// SPDX-License-Identifier: AGPL-3.0-only

//! Best-result tracking
//!
//! Two scopes per example: the current outer step (cleared when a new step
//! starts) and the whole batch attack. Both only move on a success with a
//! strictly smaller distance, so ties keep the earliest example found.
//! Updates are applied with boolean masks over the batch.

use cw_models::argmax;
use ndarray::{Array1, Array4, ArrayView1, ArrayView2, ArrayView4, Zip};

/// Distance reported for examples with no recorded success
pub const NO_SUCCESS_L2: f32 = 1e10;

/// Success test on a predicted class
pub const fn compare_class(predicted: usize, label: usize, targeted: bool) -> bool {
    if targeted {
        predicted == label
    } else {
        predicted != label
    }
}

/// Success test on raw logits: the label's logit is lowered by `confidence`
/// before taking the argmax
pub fn compare_logits(
    logits: ArrayView1<'_, f32>,
    label: usize,
    confidence: f32,
    targeted: bool,
) -> bool {
    let predicted = argmax(
        logits
            .iter()
            .enumerate()
            .map(|(i, &z)| if i == label { z - confidence } else { z }),
    );
    compare_class(predicted, label, targeted)
}

/// Per-example bests at outer-step and batch scope
#[derive(Debug, Clone)]
pub struct BestTracker {
    targeted: bool,
    confidence: f32,
    /// Label of interest per example
    label_idx: Vec<usize>,

    step_l2: Array1<f32>,
    step_class: Vec<Option<usize>>,

    best_l2: Array1<f32>,
    best_class: Vec<Option<usize>>,
    best_images: Array4<f32>,
}

impl BestTracker {
    /// Start tracking; `fallback` is what examples return if they never succeed
    pub fn new(label_idx: Vec<usize>, fallback: Array4<f32>, targeted: bool, confidence: f32) -> Self {
        let batch = label_idx.len();
        Self {
            targeted,
            confidence,
            step_l2: Array1::from_elem(batch, NO_SUCCESS_L2),
            step_class: vec![None; batch],
            best_l2: Array1::from_elem(batch, NO_SUCCESS_L2),
            best_class: vec![None; batch],
            best_images: fallback,
            label_idx,
        }
    }

    /// Clear the outer-step scope
    pub fn start_step(&mut self) {
        self.step_l2.fill(NO_SUCCESS_L2);
        self.step_class.fill(None);
    }

    /// Success flag per example for the given logits
    pub fn successes(&self, logits: ArrayView2<'_, f32>) -> Array1<bool> {
        logits
            .outer_iter()
            .zip(&self.label_idx)
            .map(|(row, &label)| compare_logits(row, label, self.confidence, self.targeted))
            .collect()
    }

    /// Fold one observation into both scopes
    ///
    /// Returns how many examples improved their batch-scope best.
    pub fn update(
        &mut self,
        l2: ArrayView1<'_, f32>,
        logits: ArrayView2<'_, f32>,
        adv_images: ArrayView4<'_, f32>,
    ) -> usize {
        let success = self.successes(logits);
        let predicted: Vec<usize> = logits
            .outer_iter()
            .map(|row| argmax(row.iter().copied()))
            .collect();

        let step_mask = Zip::from(&l2)
            .and(&self.step_l2)
            .and(&success)
            .map_collect(|&d, &best, &ok| ok && d < best);
        let best_mask = Zip::from(&l2)
            .and(&self.best_l2)
            .and(&success)
            .map_collect(|&d, &best, &ok| ok && d < best);

        Zip::from(&mut self.step_l2)
            .and(&l2)
            .and(&step_mask)
            .for_each(|best, &d, &m| {
                if m {
                    *best = d;
                }
            });
        Zip::from(&mut self.best_l2)
            .and(&l2)
            .and(&best_mask)
            .for_each(|best, &d, &m| {
                if m {
                    *best = d;
                }
            });

        for (e, &pred) in predicted.iter().enumerate() {
            if step_mask[e] {
                self.step_class[e] = Some(pred);
            }
            if best_mask[e] {
                self.best_class[e] = Some(pred);
            }
        }
        for ((mut dst, src), &m) in self
            .best_images
            .outer_iter_mut()
            .zip(adv_images.outer_iter())
            .zip(best_mask.iter())
        {
            if m {
                dst.assign(&src);
            }
        }

        best_mask.iter().filter(|&&m| m).count()
    }

    /// Whether each example succeeded during the current outer step
    pub fn step_succeeded(&self) -> Vec<bool> {
        self.step_class.iter().map(Option::is_some).collect()
    }

    /// Outer-step best distances
    pub fn step_l2(&self) -> ArrayView1<'_, f32> {
        self.step_l2.view()
    }

    /// Batch-scope best distances
    pub fn best_l2(&self) -> ArrayView1<'_, f32> {
        self.best_l2.view()
    }

    /// Batch-scope best classes
    pub fn best_class(&self) -> &[Option<usize>] {
        &self.best_class
    }

    /// Label of interest per example
    pub fn label_idx(&self) -> &[usize] {
        &self.label_idx
    }

    /// Consume into `(images, distances, classes)`
    pub fn into_parts(self) -> (Array4<f32>, Array1<f32>, Vec<Option<usize>>) {
        (self.best_images, self.best_l2, self.best_class)
    }
}
