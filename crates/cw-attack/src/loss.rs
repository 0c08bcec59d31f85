// SPDX-License-Identifier: AGPL-3.0-only

//! Attack objective
//!
//! Per example `e`:
//!
//! ```text
//! real   = Σ label·logits
//! other  = max((1 - label)·logits - label·1e4)
//! margin = max(0, other - real + κ)      targeted
//!        = max(0, real - other + κ)      untargeted
//! l2     = Σ (adv - orig)²
//! total  = Σ_e const·(margin + extra) + Σ_e l2
//! ```

use crate::error::{AttackError, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayView4, Zip};

/// Offset that removes the label class from the `other` max
pub const MASK_PENALTY: f32 = 1e4;

// ── Extra loss ──

/// Optional per-example loss added next to the margin
///
/// Receives the logits of the unperturbed batch and of the current
/// adversarial batch. Its contribution is weighted by the tradeoff constant.
pub trait ExtraLoss: std::fmt::Debug + Send + Sync {
    /// Per-example loss, length `batch`
    fn loss(&self, clean_logits: ArrayView2<'_, f32>, adv_logits: ArrayView2<'_, f32>)
        -> Array1<f32>;

    /// `d loss / d adv_logits`, shape `[batch, classes]`
    fn gradient(
        &self,
        clean_logits: ArrayView2<'_, f32>,
        adv_logits: ArrayView2<'_, f32>,
    ) -> Array2<f32>;
}

/// [`ExtraLoss::loss`], rejecting output that is not one value per example
///
/// # Errors
///
/// Returns `DimensionMismatch` if the length differs from the batch size.
pub fn checked_extra_loss(
    extra: &dyn ExtraLoss,
    clean_logits: ArrayView2<'_, f32>,
    adv_logits: ArrayView2<'_, f32>,
) -> Result<Array1<f32>> {
    let loss = extra.loss(clean_logits, adv_logits);
    if loss.len() != adv_logits.nrows() {
        return Err(AttackError::dimension_mismatch(
            "extra loss",
            format!("[{}]", adv_logits.nrows()),
            format!("[{}]", loss.len()),
        ));
    }
    Ok(loss)
}

/// [`ExtraLoss::gradient`], rejecting output not shaped like the logits
///
/// # Errors
///
/// Returns `DimensionMismatch` if the shape differs from `adv_logits`.
pub fn checked_extra_gradient(
    extra: &dyn ExtraLoss,
    clean_logits: ArrayView2<'_, f32>,
    adv_logits: ArrayView2<'_, f32>,
) -> Result<Array2<f32>> {
    let grad = extra.gradient(clean_logits, adv_logits);
    if grad.dim() != adv_logits.dim() {
        return Err(AttackError::dimension_mismatch(
            "extra loss gradient",
            format!("{:?}", adv_logits.shape()),
            format!("{:?}", grad.shape()),
        ));
    }
    Ok(grad)
}

/// Zero extra loss
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExtraLoss;

impl ExtraLoss for NoExtraLoss {
    fn loss(&self, _clean: ArrayView2<'_, f32>, adv_logits: ArrayView2<'_, f32>) -> Array1<f32> {
        Array1::zeros(adv_logits.nrows())
    }

    fn gradient(&self, _clean: ArrayView2<'_, f32>, adv_logits: ArrayView2<'_, f32>) -> Array2<f32> {
        Array2::zeros(adv_logits.raw_dim())
    }
}

// ── Evaluator ──

/// Loss components for one evaluation
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Classification margin per example
    pub margin: Array1<f32>,
    /// Extra loss per example
    pub extra: Array1<f32>,
    /// Squared L2 distance per example
    pub l2: Array1<f32>,
    /// Aggregate scalar loss
    pub total: f32,
}

/// Margin and distance loss for one attack mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossEvaluator {
    targeted: bool,
    confidence: f32,
}

impl LossEvaluator {
    /// Create evaluator
    pub const fn new(targeted: bool, confidence: f32) -> Self {
        Self {
            targeted,
            confidence,
        }
    }

    /// Targeted mode
    pub const fn targeted(&self) -> bool {
        self.targeted
    }

    /// Success margin
    pub const fn confidence(&self) -> f32 {
        self.confidence
    }

    /// Per-example classification margin
    pub fn margin(&self, logits: ArrayView2<'_, f32>, labels: ArrayView2<'_, f32>) -> Array1<f32> {
        Zip::from(logits.rows())
            .and(labels.rows())
            .map_collect(|row, lab| {
                let (real, other, _) = real_and_other(row, lab);
                self.hinge(real, other)
            })
    }

    /// Subgradient of the summed margin with respect to the logits
    ///
    /// Zero for examples already past the margin. Ties in the `other`
    /// max go to the first class.
    pub fn margin_gradient(
        &self,
        logits: ArrayView2<'_, f32>,
        labels: ArrayView2<'_, f32>,
    ) -> Array2<f32> {
        let mut grad = Array2::zeros(logits.raw_dim());
        Zip::from(grad.rows_mut())
            .and(logits.rows())
            .and(labels.rows())
            .for_each(|mut g, row, lab| {
                let (real, other, other_idx) = real_and_other(row, lab);
                if self.hinge(real, other) <= 0.0 {
                    return;
                }
                // d(other - real): +1 at the runner-up, -label on the real mass
                let sign = if self.targeted { 1.0 } else { -1.0 };
                g.zip_mut_with(&lab, |gi, &li| *gi -= sign * li);
                g[other_idx] += sign * (1.0 - lab[other_idx]);
            });
        grad
    }

    /// Per-example squared distance
    pub fn l2(&self, adv: ArrayView4<'_, f32>, reference: ArrayView4<'_, f32>) -> Array1<f32> {
        adv.outer_iter()
            .zip(reference.outer_iter())
            .map(|(a, r)| Zip::from(&a).and(&r).fold(0.0, |acc, &x, &y| acc + (x - y) * (x - y)))
            .collect()
    }

    /// Aggregate scalar `Σ const·(margin + extra) + Σ l2`
    pub fn total(
        consts: ArrayView1<'_, f32>,
        margin: ArrayView1<'_, f32>,
        extra: ArrayView1<'_, f32>,
        l2: ArrayView1<'_, f32>,
    ) -> f32 {
        let weighted: f32 = Zip::from(&consts)
            .and(&margin)
            .and(&extra)
            .fold(0.0, |acc, &c, &m, &x| acc + c * (m + x));
        weighted + l2.sum()
    }

    /// Evaluate every component of the objective
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `extra` yields the wrong length.
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate(
        &self,
        adv: ArrayView4<'_, f32>,
        reference: ArrayView4<'_, f32>,
        logits: ArrayView2<'_, f32>,
        clean_logits: ArrayView2<'_, f32>,
        labels: ArrayView2<'_, f32>,
        consts: ArrayView1<'_, f32>,
        extra: &dyn ExtraLoss,
    ) -> Result<LossBreakdown> {
        let margin = self.margin(logits, labels);
        let extra = checked_extra_loss(extra, clean_logits, logits)?;
        let l2 = self.l2(adv, reference);
        let total = Self::total(consts, margin.view(), extra.view(), l2.view());
        Ok(LossBreakdown {
            margin,
            extra,
            l2,
            total,
        })
    }

    /// `d total / d logits`: `const·(d margin + d extra)` per row
    ///
    /// # Errors
    ///
    /// Returns `DimensionMismatch` if `extra` yields a misshapen gradient.
    pub fn logits_gradient(
        &self,
        logits: ArrayView2<'_, f32>,
        clean_logits: ArrayView2<'_, f32>,
        labels: ArrayView2<'_, f32>,
        consts: ArrayView1<'_, f32>,
        extra: &dyn ExtraLoss,
    ) -> Result<Array2<f32>> {
        let mut grad = self.margin_gradient(logits, labels)
            + checked_extra_gradient(extra, clean_logits, logits)?;
        Zip::from(grad.rows_mut())
            .and(&consts)
            .for_each(|mut row, &c| row *= c);
        Ok(grad)
    }

    fn hinge(&self, real: f32, other: f32) -> f32 {
        let gap = if self.targeted {
            other - real
        } else {
            real - other
        };
        (gap + self.confidence).max(0.0)
    }
}

/// `(real, other, argmax index of the masked row)`
fn real_and_other(row: ArrayView1<'_, f32>, lab: ArrayView1<'_, f32>) -> (f32, f32, usize) {
    let real = row.dot(&lab);
    let mut other = f32::NEG_INFINITY;
    let mut idx = 0;
    for (i, (&z, &l)) in row.iter().zip(lab.iter()).enumerate() {
        let masked = (1.0 - l) * z - l * MASK_PENALTY;
        if masked > other {
            other = masked;
            idx = i;
        }
    }
    (real, other, idx)
}
