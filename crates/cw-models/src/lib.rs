// SPDX-License-Identifier: AGPL-3.0-only

#![deny(unsafe_code)]

//! Differentiable reference classifiers
//!
//! This crate provides the classifier collaborator the attack runs against:
//! a [`Classifier`] trait exposing logits and an input-gradient pass, two
//! small concrete models, and a compact weight blob for persisting them.
//!
//! # Format
//!
//! Weight blobs are little-endian:
//!
//! - **Magic** (4 bytes): `CWM1`
//! - **Kind** (1 byte): linear or MLP
//! - **Geometry**: height, width, channels, classes (and hidden width) as `u32`
//! - **Tensors**: row-major `f32`
//!
//! # Example
//!
//! ```no_run
//! use cw_models::{AnyClassifier, Classifier};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = AnyClassifier::load("model.cwm")?;
//!
//! println!("Kind: {}", model.kind());
//! println!("Input: {}", model.input_shape());
//! println!("Classes: {}", model.num_classes());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

mod error;
mod linear;
mod mlp;
mod model;
mod shapes;
pub mod weights;

pub use error::{ModelError, Result};
pub use linear::LinearClassifier;
pub use mlp::Mlp;
pub use model::{argmax, AnyClassifier, Classifier};
pub use shapes::ImageShape;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{AnyClassifier, Classifier, ImageShape, LinearClassifier, Mlp, Result};
}
