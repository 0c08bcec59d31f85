// SPDX-License-Identifier: AGPL-3.0-only

//! Image geometry
//!
//! Batches are NHWC: `[batch, height, width, channels]`, values in `[0, 1]`.

use crate::error::{ModelError, Result};
use ndarray::ArrayView4;

/// Per-example image geometry (the batch dimension is not part of it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageShape {
    /// Rows
    pub height: usize,
    /// Columns
    pub width: usize,
    /// Channels
    pub channels: usize,
}

impl ImageShape {
    /// Create new shape
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height,
            width,
            channels,
        }
    }

    /// Square image with `size × size` pixels
    pub const fn square(size: usize, channels: usize) -> Self {
        Self::new(size, size, channels)
    }

    /// Number of scalar values in one image
    #[must_use]
    pub const fn pixels(&self) -> usize {
        self.height * self.width * self.channels
    }

    /// [`Self::pixels`], or `None` if the product overflows `usize`
    #[must_use]
    pub const fn checked_pixels(&self) -> Option<usize> {
        match self.height.checked_mul(self.width) {
            Some(hw) => hw.checked_mul(self.channels),
            None => None,
        }
    }

    /// Full NHWC dimensions for a batch of `batch` images
    #[must_use]
    pub const fn batch_dims(&self, batch: usize) -> (usize, usize, usize, usize) {
        (batch, self.height, self.width, self.channels)
    }

    /// Whether any dimension is zero
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pixels() == 0
    }

    /// Shape of an existing batch, ignoring its leading dimension
    #[must_use]
    pub fn of_batch(images: &ArrayView4<'_, f32>) -> Self {
        let (_, h, w, c) = images.dim();
        Self::new(h, w, c)
    }

    /// Check that `images` is a batch of this geometry
    ///
    /// # Errors
    ///
    /// Returns a dimension mismatch naming `context` when the trailing
    /// dimensions differ.
    pub fn check_batch(&self, context: &str, images: &ArrayView4<'_, f32>) -> Result<()> {
        let got = Self::of_batch(images);
        if got != *self {
            return Err(ModelError::dimension_mismatch(context, self, got));
        }
        Ok(())
    }
}

impl std::fmt::Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}, {}]", self.height, self.width, self.channels)
    }
}
