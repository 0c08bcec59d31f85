// SPDX-License-Identifier: AGPL-3.0-only

//! Tape backend
//!
//! Eager execution: every step builds the objective graph from scratch,
//!
//! ```text
//! adv   = 0.5·s·tanh(w + base) + 0.5
//! l2    = Σ (adv - ref)²                       per example
//! loss  = Σ const·(margin(model(adv)) + extra) + l2
//! ```
//!
//! then replays the tape for `d loss / d w` and hands it to Adam.

use crate::backend::{AttackBackend, BackendCore, BackendType, StepOutput};
use crate::config::AttackConfig;
use crate::error::{AttackError, Result};
use crate::loss::ExtraLoss;
use crate::reparam::SAFE_SCALE;
use crate::tape::Tape;
use cw_models::Classifier;
use ndarray::{Array, Array2, ArrayD, ArrayView1, ArrayView2, ArrayView4, Dimension, Ix1, Ix2, Ix4};
use tracing::trace;

/// Gradient-tape backend
#[derive(Debug)]
pub struct TapeBackend<'a> {
    core: BackendCore<'a>,
}

impl<'a> TapeBackend<'a> {
    /// Create a backend with no batch bound
    pub fn new(model: &'a dyn Classifier, extra: &'a dyn ExtraLoss, config: &AttackConfig) -> Self {
        Self {
            core: BackendCore::new(model, extra, config),
        }
    }
}

fn fixed<D: Dimension>(data: &ArrayD<f32>, context: &str) -> Result<Array<f32, D>> {
    data.clone().into_dimensionality::<D>().map_err(|_| {
        let expected = format!("{}-D", D::NDIM.unwrap_or(0));
        AttackError::dimension_mismatch(context, expected, data.ndim())
    })
}

impl AttackBackend for TapeBackend<'_> {
    fn backend_type(&self) -> BackendType {
        BackendType::Tape
    }

    fn setup(&mut self, images: ArrayView4<'_, f32>, labels: ArrayView2<'_, f32>) -> Result<()> {
        self.core.setup(images, labels)
    }

    fn set_consts(&mut self, consts: ArrayView1<'_, f32>) -> Result<()> {
        self.core.vars.set_consts(consts)
    }

    fn reset(&mut self) {
        self.core.reset();
    }

    fn evaluate(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        Ok(self.core.model.forward(images)?)
    }

    fn step(&mut self) -> Result<StepOutput> {
        let core = &self.core;
        let vars = &core.vars;
        let mut tape = Tape::new();

        let w = tape.register_param(vars.modifier.clone().into_dyn());
        let base = tape.register_input(vars.base.clone().into_dyn());
        let reference = tape.register_input(vars.reference.clone().into_dyn());
        let labels = tape.register_input(vars.labels.clone().into_dyn());
        let consts = tape.register_input(vars.consts.clone().into_dyn());
        let clean = tape.register_input(vars.clean_logits.clone().into_dyn());

        // image space
        let shifted = tape.add(w, base)?;
        let squashed = tape.tanh(shifted);
        let adv = tape.affine(squashed, 0.5 * SAFE_SCALE, 0.5);

        // distance
        let diff = tape.sub(adv, reference)?;
        let sq = tape.square(diff);
        let l2 = tape.sum_per_example(sq)?;

        // classification
        let logits = tape.classifier(adv, core.model)?;
        let margin = tape.margin(logits, labels, core.evaluator)?;
        let extra = tape.extra(logits, clean, core.extra)?;
        let attack_terms = tape.add(margin, extra)?;
        let weighted = tape.mul(consts, attack_terms)?;
        let per_example = tape.add(weighted, l2)?;
        let loss = tape.sum(per_example);

        let output = StepOutput {
            loss: tape.value(loss).sum(),
            l2: fixed::<Ix1>(tape.value(l2), "tape l2")?,
            logits: fixed::<Ix2>(tape.value(logits), "tape logits")?,
            adv_images: fixed::<Ix4>(tape.value(adv), "tape images")?,
        };
        trace!("Tape recorded {} ops, loss {}", tape.num_ops(), output.loss);

        let mut grads = tape.backward(loss)?;
        let grad = grads
            .take(w)
            .ok_or_else(|| AttackError::dimension_mismatch("modifier gradient", "tensor", "none"))?;
        let grad = fixed::<Ix4>(&grad, "modifier gradient")?;

        let core = &mut self.core;
        core.adam.step(&mut core.vars.modifier, grad.view());
        Ok(output)
    }

    fn modifier(&self) -> ArrayView4<'_, f32> {
        self.core.vars.modifier.view()
    }
}
