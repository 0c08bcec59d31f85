// SPDX-License-Identifier: AGPL-3.0-only

//! Session backend
//!
//! Graph-style execution: the batch variables (tanh-space originals, labels,
//! constants, modifier) are assigned once per batch or outer step, and each
//! step runs one fused pass with the gradient written out in closed form:
//!
//! ```text
//! d loss / d adv = model.backward(adv, const·(d margin + d extra)) + 2·(adv - ref)
//! d loss / d w   = d loss / d adv · 0.5·s·(1 - tanh²(w + base))
//! ```

use crate::backend::{AttackBackend, BackendCore, BackendType, StepOutput};
use crate::config::AttackConfig;
use crate::error::Result;
use crate::loss::ExtraLoss;
use crate::reparam;
use cw_models::Classifier;
use ndarray::{Array2, ArrayView1, ArrayView2, ArrayView4, Zip};

/// Fused closed-form backend
#[derive(Debug)]
pub struct SessionBackend<'a> {
    core: BackendCore<'a>,
}

impl<'a> SessionBackend<'a> {
    /// Create a backend with no batch bound
    pub fn new(model: &'a dyn Classifier, extra: &'a dyn ExtraLoss, config: &AttackConfig) -> Self {
        Self {
            core: BackendCore::new(model, extra, config),
        }
    }
}

impl AttackBackend for SessionBackend<'_> {
    fn backend_type(&self) -> BackendType {
        BackendType::Session
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
        let core = &mut self.core;
        let vars = &core.vars;

        // forward
        let adv = vars.adv_images();
        let logits = core.model.forward(adv.view())?;
        let loss = core.evaluator.evaluate(
            adv.view(),
            vars.reference.view(),
            logits.view(),
            vars.clean_logits.view(),
            vars.labels.view(),
            vars.consts.view(),
            core.extra,
        )?;

        // backward
        let d_logits = core.evaluator.logits_gradient(
            logits.view(),
            vars.clean_logits.view(),
            vars.labels.view(),
            vars.consts.view(),
            core.extra,
        )?;
        let mut d_adv = core.model.backward(adv.view(), d_logits.view())?;
        Zip::from(&mut d_adv)
            .and(&adv)
            .and(&vars.reference)
            .for_each(|d, &a, &r| *d += 2.0 * (a - r));
        let d_w = d_adv * reparam::image_space_derivative(vars.modifier.view(), vars.base.view());

        // update
        core.adam.step(&mut core.vars.modifier, d_w.view());

        Ok(StepOutput {
            loss: loss.total,
            l2: loss.l2,
            logits,
            adv_images: adv,
        })
    }

    fn modifier(&self) -> ArrayView4<'_, f32> {
        self.core.vars.modifier.view()
    }
}
