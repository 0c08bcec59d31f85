// SPDX-License-Identifier: AGPL-3.0-only

//! Batch driver
//!
//! Validates the input once, draws targets for targeted mode, slices the
//! examples into contiguous batches and runs the binary search on each one
//! in order. Results are reassembled in input order.

use crate::backend::select_backend;
use crate::config::AttackConfig;
use crate::error::{AttackError, Result};
use crate::loss::{ExtraLoss, NoExtraLoss};
use crate::search::{attack_batch, BatchOutcome};
use crate::tracker::NO_SUCCESS_L2;
use cw_models::{argmax, Classifier, ImageShape};
use ndarray::{s, Array1, Array2, Array4, ArrayView2, ArrayView4};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

/// Everything one attack produced
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    /// Adversarial images, same shape and order as the input
    pub adversarial: Array4<f32>,
    /// Best squared L2 distance, `1e10` where no success was found
    pub best_l2: Array1<f32>,
    /// Predicted class of each returned adversarial image
    pub best_class: Vec<Option<usize>>,
    /// One-hot labels actually attacked (targets in targeted mode)
    pub labels: Array2<f32>,
    /// Fraction of examples with a recorded success
    pub success_rate: f32,
    /// Per-batch detail, including the search trace
    pub batches: Vec<BatchOutcome>,
}

impl AttackOutcome {
    /// Whether example `e` was ever fooled
    pub fn succeeded(&self, e: usize) -> bool {
        self.best_l2.get(e).is_some_and(|&d| d < NO_SUCCESS_L2)
    }
}

/// Carlini-Wagner L2 attack against one classifier
#[derive(Debug)]
pub struct CarliniL2<'a> {
    model: &'a dyn Classifier,
    extra: &'a dyn ExtraLoss,
    config: AttackConfig,
}

impl<'a> CarliniL2<'a> {
    /// Validate `config` against itself and the classifier
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for bad options and `DimensionMismatch` when
    /// the classifier's geometry differs from the configured one.
    pub fn new(model: &'a dyn Classifier, config: AttackConfig) -> Result<Self> {
        config.validate()?;
        if model.input_shape() != config.image_shape {
            return Err(AttackError::dimension_mismatch(
                "classifier input",
                config.image_shape,
                model.input_shape(),
            ));
        }
        if model.num_classes() != config.num_labels {
            return Err(AttackError::dimension_mismatch(
                "classifier outputs",
                config.num_labels,
                model.num_classes(),
            ));
        }
        info!(
            "C&W L2: {} mode, {} backend, {} search steps x {} iterations",
            if config.targeted { "targeted" } else { "untargeted" },
            config.backend,
            config.binary_search_steps,
            config.max_iterations
        );
        Ok(Self {
            model,
            extra: &NoExtraLoss,
            config,
        })
    }

    /// Add a loss term next to the margin
    #[must_use]
    pub fn with_extra_loss(mut self, extra: &'a dyn ExtraLoss) -> Self {
        self.extra = extra;
        self
    }

    /// Configuration in use
    pub const fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// Attack every example
    ///
    /// `labels` are one-hot true labels in untargeted mode. In targeted mode
    /// they are true labels when `random_targets` is set, otherwise targets.
    ///
    /// # Errors
    ///
    /// Fails before any optimisation on malformed input; otherwise
    /// propagates `NonFinite`, extra-loss shape and classifier errors.
    /// Any such error aborts the whole run: results of batches that already
    /// finished are discarded with it.
    pub fn attack(
        &self,
        images: ArrayView4<'_, f32>,
        labels: ArrayView2<'_, f32>,
    ) -> Result<AttackOutcome> {
        self.validate_input(&images, &labels)?;
        let total = images.dim().0;

        let attacked = if self.config.targeted && self.config.random_targets {
            let mut rng = StdRng::seed_from_u64(self.config.seed);
            let true_idx: Vec<usize> = labels
                .outer_iter()
                .map(|row| argmax(row.iter().copied()))
                .collect();
            one_hot(&choose_targets(&true_idx, self.config.num_labels, &mut rng), self.config.num_labels)
        } else {
            labels.to_owned()
        };

        let mut backend = select_backend(self.config.backend, self.model, self.extra, &self.config);
        let mut adversarial = Array4::zeros(images.raw_dim());
        let mut best_l2 = Array1::from_elem(total, NO_SUCCESS_L2);
        let mut best_class = vec![None; total];
        let mut batches = Vec::new();

        for (index, start) in (0..total).step_by(self.config.batch_size).enumerate() {
            let end = (start + self.config.batch_size).min(total);
            let outcome = attack_batch(
                backend.as_mut(),
                images.slice(s![start..end, .., .., ..]),
                attacked.slice(s![start..end, ..]),
                &self.config,
                index,
                start,
            )?;

            adversarial
                .slice_mut(s![start..end, .., .., ..])
                .assign(&outcome.adversarial);
            best_l2.slice_mut(s![start..end]).assign(&outcome.best_l2);
            best_class[start..end].clone_from_slice(&outcome.best_class);

            let fooled_l2: Vec<f32> = outcome
                .best_l2
                .iter()
                .copied()
                .filter(|&d| d < NO_SUCCESS_L2)
                .collect();
            let fooled = fooled_l2.len();
            let mean_l2 = if fooled == 0 {
                f32::NAN
            } else {
                fooled_l2.iter().sum::<f32>() / fooled as f32
            };
            info!(
                "Batch {index}: {fooled}/{} fooled, mean L2 {mean_l2:.6} ({} backend)",
                end - start,
                backend.backend_type()
            );
            if fooled < end - start {
                warn!("Batch {index}: {} examples never succeeded", end - start - fooled);
            }
            batches.push(outcome);
        }

        let successes = best_l2.iter().filter(|&&d| d < NO_SUCCESS_L2).count();
        let success_rate = if total == 0 {
            0.0
        } else {
            successes as f32 / total as f32
        };
        info!("Success rate: {success_rate:.4} ({successes}/{total})");

        Ok(AttackOutcome {
            adversarial,
            best_l2,
            best_class,
            labels: attacked,
            success_rate,
            batches,
        })
    }

    fn validate_input(&self, images: &ArrayView4<'_, f32>, labels: &ArrayView2<'_, f32>) -> Result<()> {
        let got = ImageShape::of_batch(images);
        if got != self.config.image_shape {
            return Err(AttackError::dimension_mismatch(
                "images",
                self.config.image_shape,
                got,
            ));
        }
        let total = images.dim().0;
        if labels.dim() != (total, self.config.num_labels) {
            return Err(AttackError::dimension_mismatch(
                "labels",
                format!("[{total}, {}]", self.config.num_labels),
                format!("{:?}", labels.shape()),
            ));
        }
        for (row, values) in labels.outer_iter().enumerate() {
            let ones = values.iter().filter(|&&v| v == 1.0).count();
            let zeros = values.iter().filter(|&&v| v == 0.0).count();
            if ones != 1 || ones + zeros != values.len() {
                return Err(AttackError::invalid_labels(row, "expected a one-hot row"));
            }
        }
        Ok(())
    }
}

/// Draw one target per example, uniform over every class but the true one
pub fn choose_targets<R: Rng + ?Sized>(true_idx: &[usize], num_labels: usize, rng: &mut R) -> Vec<usize> {
    true_idx
        .iter()
        .map(|&truth| {
            let draw = rng.gen_range(0..num_labels - 1);
            if draw >= truth {
                draw + 1
            } else {
                draw
            }
        })
        .collect()
}

/// One-hot encode class indices
pub fn one_hot(indices: &[usize], num_labels: usize) -> Array2<f32> {
    let mut labels = Array2::zeros((indices.len(), num_labels));
    for (row, &idx) in indices.iter().enumerate() {
        labels[[row, idx]] = 1.0;
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use cw_models::LinearClassifier;

    fn model() -> LinearClassifier {
        LinearClassifier::random(ImageShape::square(2, 1), 3, 1)
    }

    #[test]
    fn test_targets_never_equal_truth() {
        let mut rng = StdRng::seed_from_u64(3);
        let truth: Vec<usize> = (0..500).map(|i| i % 10).collect();
        let targets = choose_targets(&truth, 10, &mut rng);
        assert!(truth.iter().zip(&targets).all(|(t, g)| t != g));
        assert!(targets.iter().all(|&g| g < 10));
    }

    #[test]
    fn test_targets_cover_every_other_class() {
        let mut rng = StdRng::seed_from_u64(5);
        let targets = choose_targets(&[2; 300], 4, &mut rng);
        for class in [0, 1, 3] {
            assert!(targets.contains(&class));
        }
    }

    #[test]
    fn test_new_rejects_geometry_mismatch() {
        let model = model();
        let config = AttackConfig::new(ImageShape::square(3, 1), 3);
        assert!(matches!(
            CarliniL2::new(&model, config),
            Err(AttackError::DimensionMismatch { .. })
        ));
        let config = AttackConfig::new(ImageShape::square(2, 1), 4);
        assert!(CarliniL2::new(&model, config).is_err());
    }

    #[test]
    fn test_attack_rejects_bad_labels_before_work() {
        let model = model();
        let config = AttackConfig::new(ImageShape::square(2, 1), 3);
        let attack = CarliniL2::new(&model, config).unwrap();
        let images = Array4::from_elem((2, 2, 2, 1), 0.5);

        let labels = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, 0.0, 0.5, 0.5, 0.0]).unwrap();
        let err = attack.attack(images.view(), labels.view()).unwrap_err();
        assert!(matches!(err, AttackError::InvalidLabels { row: 1, .. }));

        let labels = Array2::zeros((3, 3));
        let err = attack.attack(images.view(), labels.view()).unwrap_err();
        assert!(matches!(err, AttackError::DimensionMismatch { .. }));

        let wrong_images = Array4::from_elem((2, 2, 2, 3), 0.5);
        let labels = one_hot(&[0, 1], 3);
        assert!(attack.attack(wrong_images.view(), labels.view()).is_err());
    }

    #[test]
    fn test_one_hot() {
        let labels = one_hot(&[2, 0], 3);
        assert_eq!(labels.row(0).to_vec(), vec![0.0, 0.0, 1.0]);
        assert_eq!(labels.row(1).to_vec(), vec![1.0, 0.0, 0.0]);
    }
}
