// SPDX-License-Identifier: AGPL-3.0-only

//! Backend abstraction for the attack's inner loop
//!
//! The binary search and the best-result tracker are written once against
//! [`AttackBackend`]. A backend owns the modifier, the optimizer state and the
//! per-batch variables, and knows how to differentiate the objective.

use crate::config::AttackConfig;
use crate::error::{AttackError, Result};
use crate::loss::{ExtraLoss, LossEvaluator};
use crate::optimizer::Adam;
use crate::reparam;
use cw_models::Classifier;
use ndarray::{Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView4};
use std::fmt::Debug;

/// Values observed at the modifier *before* a step's update
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Aggregate loss
    pub loss: f32,
    /// Squared L2 distance per example
    pub l2: Array1<f32>,
    /// Classifier logits for the adversarial batch
    pub logits: Array2<f32>,
    /// Adversarial images in `[0, 1]`
    pub adv_images: Array4<f32>,
}

/// Attack backend: model invocation plus one optimizer step
pub trait AttackBackend: Debug {
    /// Backend type for logging
    fn backend_type(&self) -> BackendType;

    /// Bind a batch: originals to tanh space, labels, clean logits.
    /// Leaves the backend in the zeroed state.
    ///
    /// # Errors
    ///
    /// Returns error if shapes disagree or the classifier fails.
    fn setup(&mut self, images: ArrayView4<'_, f32>, labels: ArrayView2<'_, f32>) -> Result<()>;

    /// Assign per-example tradeoff constants
    ///
    /// # Errors
    ///
    /// Returns error if `consts` length differs from the bound batch.
    fn set_consts(&mut self, consts: ArrayView1<'_, f32>) -> Result<()>;

    /// Zero the modifier and clear optimizer state
    fn reset(&mut self);

    /// Classifier logits for arbitrary images
    ///
    /// # Errors
    ///
    /// Propagates classifier errors.
    fn evaluate(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>>;

    /// Compute the loss, backpropagate and apply one Adam update
    ///
    /// # Errors
    ///
    /// Propagates classifier and shape errors.
    fn step(&mut self) -> Result<StepOutput>;

    /// Current modifier
    fn modifier(&self) -> ArrayView4<'_, f32>;
}

// ── Batch variables ──

/// Tensors bound to a backend for one batch
#[derive(Debug, Clone)]
pub struct BatchVariables {
    /// Originals in tanh space
    pub base: Array4<f32>,
    /// Originals after the tanh round trip; the L2 reference
    pub reference: Array4<f32>,
    /// One-hot labels of interest
    pub labels: Array2<f32>,
    /// Tradeoff constants
    pub consts: Array1<f32>,
    /// Logits of the unperturbed batch
    pub clean_logits: Array2<f32>,
    /// Trainable tanh-space perturbation
    pub modifier: Array4<f32>,
}

impl BatchVariables {
    /// Zero-sized variables for a backend with no batch bound yet
    pub fn empty(num_labels: usize) -> Self {
        Self {
            base: Array4::zeros((0, 0, 0, 0)),
            reference: Array4::zeros((0, 0, 0, 0)),
            labels: Array2::zeros((0, num_labels)),
            consts: Array1::zeros(0),
            clean_logits: Array2::zeros((0, num_labels)),
            modifier: Array4::zeros((0, 0, 0, 0)),
        }
    }

    /// Bind a batch
    ///
    /// # Errors
    ///
    /// Returns error if `labels` rows differ from the image count or the
    /// classifier rejects the batch.
    pub fn assign(
        model: &dyn Classifier,
        images: ArrayView4<'_, f32>,
        labels: ArrayView2<'_, f32>,
    ) -> Result<Self> {
        let batch = images.dim().0;
        if labels.dim() != (batch, model.num_classes()) {
            return Err(AttackError::dimension_mismatch(
                "batch labels",
                format!("[{batch}, {}]", model.num_classes()),
                format!("{:?}", labels.shape()),
            ));
        }
        let base = reparam::to_optimization_space(images);
        let reference = reparam::round_trip(base.view());
        let clean_logits = model.forward(reference.view())?;
        Ok(Self {
            modifier: Array4::zeros(base.raw_dim()),
            consts: Array1::zeros(batch),
            labels: labels.to_owned(),
            base,
            reference,
            clean_logits,
        })
    }

    /// Examples bound
    pub fn batch_size(&self) -> usize {
        self.base.dim().0
    }

    /// Replace the constants
    ///
    /// # Errors
    ///
    /// Returns error on a length mismatch.
    pub fn set_consts(&mut self, consts: ArrayView1<'_, f32>) -> Result<()> {
        if consts.len() != self.batch_size() {
            return Err(AttackError::dimension_mismatch(
                "tradeoff constants",
                self.batch_size(),
                consts.len(),
            ));
        }
        self.consts.assign(&consts);
        Ok(())
    }

    /// Current adversarial images
    pub fn adv_images(&self) -> Array4<f32> {
        reparam::to_image_space(self.modifier.view(), self.base.view())
    }
}

/// Shared state every backend carries
#[derive(Debug)]
pub(crate) struct BackendCore<'a> {
    pub(crate) model: &'a dyn Classifier,
    pub(crate) extra: &'a dyn ExtraLoss,
    pub(crate) evaluator: LossEvaluator,
    pub(crate) learning_rate: f32,
    pub(crate) vars: BatchVariables,
    pub(crate) adam: Adam,
}

impl<'a> BackendCore<'a> {
    pub(crate) fn new(
        model: &'a dyn Classifier,
        extra: &'a dyn ExtraLoss,
        config: &AttackConfig,
    ) -> Self {
        Self {
            model,
            extra,
            evaluator: LossEvaluator::new(config.targeted, config.confidence),
            learning_rate: config.learning_rate,
            vars: BatchVariables::empty(config.num_labels),
            adam: Adam::new(config.learning_rate, (0, 0, 0, 0)),
        }
    }

    pub(crate) fn setup(
        &mut self,
        images: ArrayView4<'_, f32>,
        labels: ArrayView2<'_, f32>,
    ) -> Result<()> {
        self.vars = BatchVariables::assign(self.model, images, labels)?;
        self.adam = Adam::new(self.learning_rate, self.vars.modifier.dim());
        Ok(())
    }

    pub(crate) fn reset(&mut self) {
        self.vars.modifier.fill(0.0);
        self.adam.reset();
    }
}

// ── Selection ──

/// Backend type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    /// Eager, records a gradient tape every step
    Tape,

    /// Variables bound once, fused closed-form step
    Session,
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tape => write!(f, "Tape"),
            Self::Session => write!(f, "Session"),
        }
    }
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Pick the faster backend
    #[default]
    Auto,

    /// Force the tape backend
    Tape,

    /// Force the session backend
    Session,
}

impl std::fmt::Display for BackendSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Tape => write!(f, "tape"),
            Self::Session => write!(f, "session"),
        }
    }
}

impl std::str::FromStr for BackendSelection {
    type Err = AttackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "tape" => Ok(Self::Tape),
            "session" => Ok(Self::Session),
            other => Err(AttackError::invalid_config(format!(
                "unknown backend '{other}' (expected auto, tape or session)"
            ))),
        }
    }
}

/// Build the backend a configuration asks for
///
/// `Auto` picks the session backend: it skips the per-step graph recording.
pub fn select_backend<'a>(
    selection: BackendSelection,
    model: &'a dyn Classifier,
    extra: &'a dyn ExtraLoss,
    config: &AttackConfig,
) -> Box<dyn AttackBackend + 'a> {
    use crate::backends::{SessionBackend, TapeBackend};

    match selection {
        BackendSelection::Auto | BackendSelection::Session => {
            Box::new(SessionBackend::new(model, extra, config))
        }
        BackendSelection::Tape => Box::new(TapeBackend::new(model, extra, config)),
    }
}
