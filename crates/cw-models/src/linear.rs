// SPDX-License-Identifier: AGPL-3.0-only

//! Affine classifier: `logits = x · Wᵀ + b`

use crate::error::{ModelError, Result};
use crate::model::{check_grad, flatten, unflatten, Classifier};
use crate::shapes::ImageShape;
use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Single-layer linear classifier over flattened pixels
#[derive(Debug, Clone, PartialEq)]
pub struct LinearClassifier {
    shape: ImageShape,
    /// `[num_classes, pixels]`
    weights: Array2<f32>,
    /// `[num_classes]`
    bias: Array1<f32>,
}

impl LinearClassifier {
    /// Build from explicit weights
    ///
    /// # Errors
    ///
    /// Returns error if `weights` is not `[classes, pixels]` or `bias`
    /// length differs from the class count.
    pub fn new(shape: ImageShape, weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weights.ncols() != shape.pixels() {
            return Err(ModelError::invalid_weights(format!(
                "weight matrix has {} columns, image {} has {} pixels",
                weights.ncols(),
                shape,
                shape.pixels()
            )));
        }
        if bias.len() != weights.nrows() {
            return Err(ModelError::invalid_weights(format!(
                "bias has {} entries for {} classes",
                bias.len(),
                weights.nrows()
            )));
        }
        if weights.nrows() == 0 {
            return Err(ModelError::invalid_weights("classifier needs at least one class"));
        }
        Ok(Self {
            shape,
            weights,
            bias,
        })
    }

    /// Seeded random initialisation, uniform in `±1/sqrt(pixels)`
    #[must_use]
    pub fn random(shape: ImageShape, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = 1.0 / (shape.pixels().max(1) as f32).sqrt();
        let weights =
            Array2::from_shape_fn((num_classes, shape.pixels()), |_| rng.gen_range(-scale..=scale));
        let bias = Array1::from_shape_fn(num_classes, |_| rng.gen_range(-scale..=scale));
        Self {
            shape,
            weights,
            bias,
        }
    }

    /// Weight matrix `[classes, pixels]`
    #[must_use]
    pub const fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    /// Bias vector
    #[must_use]
    pub const fn bias(&self) -> &Array1<f32> {
        &self.bias
    }
}

impl Classifier for LinearClassifier {
    fn input_shape(&self) -> ImageShape {
        self.shape
    }

    fn num_classes(&self) -> usize {
        self.weights.nrows()
    }

    fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let x = flatten(self.shape, images)?;
        Ok(x.dot(&self.weights.t()) + &self.bias)
    }

    fn backward(
        &self,
        images: ArrayView4<'_, f32>,
        grad_logits: ArrayView2<'_, f32>,
    ) -> Result<Array4<f32>> {
        self.shape.check_batch("classifier input", &images)?;
        check_grad(&grad_logits, images.dim().0, self.num_classes())?;
        let grad = grad_logits.dot(&self.weights);
        unflatten(self.shape, &grad)
    }
}
