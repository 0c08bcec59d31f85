// SPDX-License-Identifier: AGPL-3.0-only

//! Carlini-Wagner L2 adversarial attack.
//!
//! Finds, per example, a minimally perturbed image that a classifier gets
//! wrong (untargeted) or assigns to a chosen class (targeted), measuring the
//! perturbation by squared L2 distance.
//!
//! # Pipeline
//!
//! ```text
//! CarliniL2::attack        validate, draw targets, slice batches
//!   └─ attack_batch        binary search over the tradeoff constant
//!        └─ run_descent    Adam on the tanh-space modifier, early abort
//!             └─ backend   loss + gradient (Tape or Session)
//!                  └─ BestTracker  masked best-so-far updates
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use cw_attack::{AttackConfig, CarliniL2};
//! use cw_models::{AnyClassifier, Classifier};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let model = AnyClassifier::load("model.cwm")?;
//! let config = AttackConfig::new(model.input_shape(), model.num_classes())
//!     .with_targeted(false)
//!     .with_binary_search_steps(5);
//! let attack = CarliniL2::new(&model, config)?;
//!
//! # let images = ndarray::Array4::<f32>::zeros((1, 28, 28, 1));
//! # let labels = ndarray::Array2::<f32>::zeros((1, 10));
//! let outcome = attack.attack(images.view(), labels.view())?;
//! println!("success rate {:.2}", outcome.success_rate);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_precision_loss)]

mod attack;
mod backend;
pub mod backends;
mod config;
pub mod descent;
mod error;
pub mod loss;
pub mod optimizer;
pub mod reparam;
pub mod search;
pub mod tape;
pub mod tracker;

pub use attack::{choose_targets, one_hot, AttackOutcome, CarliniL2};
pub use backend::{
    select_backend, AttackBackend, BackendSelection, BackendType, BatchVariables, StepOutput,
};
pub use backends::{SessionBackend, TapeBackend};
pub use config::{
    AttackConfig, Fallback, TrackingCadence, DEFAULT_BATCH_SIZE, DEFAULT_BINARY_SEARCH_STEPS,
    DEFAULT_INITIAL_CONST, DEFAULT_LEARNING_RATE, DEFAULT_MAX_ITERATIONS,
};
pub use descent::{run_descent, DescentContext, DescentOutcome, DescentState};
pub use error::{AttackError, Result};
pub use loss::{
    checked_extra_gradient, checked_extra_loss, ExtraLoss, LossBreakdown, LossEvaluator,
    NoExtraLoss,
};
pub use search::{attack_batch, BatchOutcome, OuterStepTrace, SearchBounds, SearchTrace};
pub use tracker::{compare_class, compare_logits, BestTracker, NO_SUCCESS_L2};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        AttackConfig, AttackError, AttackOutcome, BackendSelection, CarliniL2, ExtraLoss,
        Fallback, NoExtraLoss, Result,
    };
}
