// SPDX-License-Identifier: AGPL-3.0-only

//! Two-layer perceptron with a ReLU hidden layer

use crate::error::{ModelError, Result};
use crate::model::{check_grad, flatten, unflatten, Classifier};
use crate::shapes::ImageShape;
use ndarray::{Array1, Array2, Array4, ArrayView2, ArrayView4, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// `logits = relu(x · W1ᵀ + b1) · W2ᵀ + b2`
#[derive(Debug, Clone, PartialEq)]
pub struct Mlp {
    shape: ImageShape,
    /// `[hidden, pixels]`
    w1: Array2<f32>,
    b1: Array1<f32>,
    /// `[classes, hidden]`
    w2: Array2<f32>,
    b2: Array1<f32>,
}

impl Mlp {
    /// Build from explicit layer weights
    ///
    /// # Errors
    ///
    /// Returns error if the layer shapes do not chain.
    pub fn new(
        shape: ImageShape,
        w1: Array2<f32>,
        b1: Array1<f32>,
        w2: Array2<f32>,
        b2: Array1<f32>,
    ) -> Result<Self> {
        if w1.ncols() != shape.pixels() || b1.len() != w1.nrows() {
            return Err(ModelError::invalid_weights(format!(
                "hidden layer {:?} / bias {} does not fit image {}",
                w1.shape(),
                b1.len(),
                shape
            )));
        }
        if w2.ncols() != w1.nrows() || b2.len() != w2.nrows() || w2.nrows() == 0 {
            return Err(ModelError::invalid_weights(format!(
                "output layer {:?} / bias {} does not fit {} hidden units",
                w2.shape(),
                b2.len(),
                w1.nrows()
            )));
        }
        Ok(Self {
            shape,
            w1,
            b1,
            w2,
            b2,
        })
    }

    /// Seeded random initialisation
    #[must_use]
    pub fn random(shape: ImageShape, hidden: usize, num_classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let s1 = 1.0 / (shape.pixels().max(1) as f32).sqrt();
        let s2 = 1.0 / (hidden.max(1) as f32).sqrt();
        let w1 = Array2::from_shape_fn((hidden, shape.pixels()), |_| rng.gen_range(-s1..=s1));
        let b1 = Array1::from_shape_fn(hidden, |_| rng.gen_range(-s1..=s1));
        let w2 = Array2::from_shape_fn((num_classes, hidden), |_| rng.gen_range(-s2..=s2));
        let b2 = Array1::from_shape_fn(num_classes, |_| rng.gen_range(-s2..=s2));
        Self {
            shape,
            w1,
            b1,
            w2,
            b2,
        }
    }

    /// Hidden layer width
    #[must_use]
    pub fn hidden(&self) -> usize {
        self.w1.nrows()
    }

    /// Layer tensors in order `(w1, b1, w2, b2)`
    #[must_use]
    pub const fn layers(&self) -> (&Array2<f32>, &Array1<f32>, &Array2<f32>, &Array1<f32>) {
        (&self.w1, &self.b1, &self.w2, &self.b2)
    }

    fn pre_activation(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.w1.t()) + &self.b1
    }
}

impl Classifier for Mlp {
    fn input_shape(&self) -> ImageShape {
        self.shape
    }

    fn num_classes(&self) -> usize {
        self.w2.nrows()
    }

    fn forward(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let x = flatten(self.shape, images)?;
        let hidden = self.pre_activation(&x).mapv(|v| v.max(0.0));
        Ok(hidden.dot(&self.w2.t()) + &self.b2)
    }

    fn backward(
        &self,
        images: ArrayView4<'_, f32>,
        grad_logits: ArrayView2<'_, f32>,
    ) -> Result<Array4<f32>> {
        let x = flatten(self.shape, images)?;
        check_grad(&grad_logits, x.nrows(), self.num_classes())?;
        let pre = self.pre_activation(&x);
        let mut grad_hidden = grad_logits.dot(&self.w2);
        Zip::from(&mut grad_hidden).and(&pre).for_each(|g, &p| {
            if p <= 0.0 {
                *g = 0.0;
            }
        });
        unflatten(self.shape, &grad_hidden.dot(&self.w1))
    }
}
