// SPDX-License-Identifier: AGPL-3.0-only

//! Classifier abstraction
//!
//! A classifier maps a batch of NHWC images to pre-softmax logits and can
//! pull a logits gradient back to the input. The attack never needs weight
//! gradients, so `backward` returns only the input gradient.

use crate::error::{ModelError, Result};
use crate::linear::LinearClassifier;
use crate::mlp::Mlp;
use crate::shapes::ImageShape;
use ndarray::{Array2, Array4, ArrayView2, ArrayView4};

/// Differentiable image classifier
pub trait Classifier: std::fmt::Debug + Send + Sync {
    /// Geometry of one input image
    fn input_shape(&self) -> ImageShape;

    /// Number of output classes
    fn num_classes(&self) -> usize;

    /// Logits for a batch, shape `[batch, num_classes]`
    ///
    /// # Errors
    ///
    /// Returns error if the batch geometry does not match `input_shape`.
    fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>>;

    /// Vector-Jacobian product: gradient of `sum(grad_logits * logits)`
    /// with respect to the input images
    ///
    /// # Errors
    ///
    /// Returns error if `images` or `grad_logits` have the wrong shape.
    fn backward(
        &self,
        images: ArrayView4<'_, f32>,
        grad_logits: ArrayView2<'_, f32>,
    ) -> Result<Array4<f32>>;

    /// Predicted class per example
    ///
    /// # Errors
    ///
    /// Propagates errors from `forward`.
    fn predict(&self, images: ArrayView4<'_, f32>) -> Result<Vec<usize>> {
        let logits = self.forward(images)?;
        Ok(logits.outer_iter().map(|row| argmax(row.iter().copied())).collect())
    }
}

/// Index of the largest value; the first one wins on ties
pub fn argmax(values: impl IntoIterator<Item = f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, v) in values.into_iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

/// Classifier with a concrete architecture, as loaded from a weight blob
#[derive(Debug, Clone)]
pub enum AnyClassifier {
    /// Single affine layer
    Linear(LinearClassifier),
    /// One hidden ReLU layer
    Mlp(Mlp),
}

impl AnyClassifier {
    /// Architecture name
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Linear(_) => "linear",
            Self::Mlp(_) => "mlp",
        }
    }

    fn inner(&self) -> &dyn Classifier {
        match self {
            Self::Linear(m) => m,
            Self::Mlp(m) => m,
        }
    }
}

impl From<LinearClassifier> for AnyClassifier {
    fn from(model: LinearClassifier) -> Self {
        Self::Linear(model)
    }
}

impl From<Mlp> for AnyClassifier {
    fn from(model: Mlp) -> Self {
        Self::Mlp(model)
    }
}

impl Classifier for AnyClassifier {
    fn input_shape(&self) -> ImageShape {
        self.inner().input_shape()
    }

    fn num_classes(&self) -> usize {
        self.inner().num_classes()
    }

    fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        self.inner().forward(images)
    }

    fn backward(
        &self,
        images: ArrayView4<'_, f32>,
        grad_logits: ArrayView2<'_, f32>,
    ) -> Result<Array4<f32>> {
        self.inner().backward(images, grad_logits)
    }
}

// ── Layout helpers ──

/// Flatten an NHWC batch into `[batch, pixels]` in row-major order
pub(crate) fn flatten(shape: ImageShape, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
    shape.check_batch("classifier input", &images)?;
    let batch = images.dim().0;
    let data: Vec<f32> = images.iter().copied().collect();
    Array2::from_shape_vec((batch, shape.pixels()), data)
        .map_err(|e| ModelError::dimension_mismatch("flatten", shape, e))
}

/// Inverse of [`flatten`]
pub(crate) fn unflatten(shape: ImageShape, flat: &Array2<f32>) -> Result<Array4<f32>> {
    let batch = flat.nrows();
    let data: Vec<f32> = flat.iter().copied().collect();
    Array4::from_shape_vec(shape.batch_dims(batch), data)
        .map_err(|e| ModelError::dimension_mismatch("unflatten", shape, e))
}

/// Check a logits gradient against batch size and class count
pub(crate) fn check_grad(
    grad_logits: &ArrayView2<'_, f32>,
    batch: usize,
    classes: usize,
) -> Result<()> {
    if grad_logits.dim() != (batch, classes) {
        return Err(ModelError::dimension_mismatch(
            "logits gradient",
            format!("[{batch}, {classes}]"),
            format!("{:?}", grad_logits.shape()),
        ));
    }
    Ok(())
}
