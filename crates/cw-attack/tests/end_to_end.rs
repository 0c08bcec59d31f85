// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end attack scenarios on small hand-built classifiers

use cw_attack::{
    one_hot, run_descent, AttackBackend, AttackConfig, AttackError, BackendSelection, BackendType,
    BestTracker, CarliniL2, DescentContext, DescentState, ExtraLoss, Fallback, Result, StepOutput,
    TrackingCadence, NO_SUCCESS_L2,
};
use cw_models::{argmax, Classifier, ImageShape, LinearClassifier};
use ndarray::{array, Array1, Array2, Array4, ArrayView1, ArrayView2, ArrayView4};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Two classes over a 2x2 grey image; class 0 wins at 0.5 by a margin of 0.05
fn boundary_model() -> LinearClassifier {
    let weights = array![[1.0, 0.0, 0.5, 1.0], [0.0, 0.5, 0.0, 0.0]];
    let bias = array![-0.95, 0.0];
    LinearClassifier::new(ImageShape::square(2, 1), weights, bias).unwrap()
}

/// Class 1 can never beat class 0 inside the unit cube
fn hopeless_model() -> LinearClassifier {
    let weights = Array2::from_elem((2, 4), 0.1);
    let bias = array![100.0, -100.0];
    LinearClassifier::new(ImageShape::square(2, 1), weights, bias).unwrap()
}

fn grey(batch: usize) -> Array4<f32> {
    Array4::from_elem((batch, 2, 2, 1), 0.5)
}

fn boundary_config() -> AttackConfig {
    AttackConfig::new(ImageShape::square(2, 1), 2)
        .with_targeted(false)
        .with_initial_const(1e-3)
        .with_binary_search_steps(5)
        .with_max_iterations(200)
}

fn squared_distance(a: ArrayView4<'_, f32>, b: ArrayView4<'_, f32>) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Test that a near-boundary image is flipped with less distortion than a sign step
#[test]
fn test_untargeted_flip_beats_one_shot_step() {
    let model = boundary_model();
    let images = grey(1);
    let labels = one_hot(&[0], 2);
    assert_eq!(model.predict(images.view()).unwrap(), vec![0]);

    let attack = CarliniL2::new(&model, boundary_config()).unwrap();
    let outcome = attack.attack(images.view(), labels.view()).unwrap();

    assert_eq!(outcome.success_rate, 1.0);
    assert_eq!(outcome.best_class, vec![Some(1)]);
    assert_eq!(model.predict(outcome.adversarial.view()).unwrap(), vec![1]);

    // one signed step of 0.1 against the class-0 gradient
    let step = array![1.0, -0.5, 0.5, 1.0].mapv(|g: f32| -0.1 * g.signum());
    let naive = Array4::from_shape_fn((1, 2, 2, 1), |(_, h, w, _)| 0.5 + step[h * 2 + w]);
    assert_eq!(model.predict(naive.view()).unwrap(), vec![1]);

    let naive_l2 = squared_distance(naive.view(), images.view());
    let attack_l2 = outcome.best_l2[0];
    assert!(attack_l2 < naive_l2, "attack {attack_l2} vs naive {naive_l2}");
    assert!(
        (squared_distance(outcome.adversarial.view(), images.view()) - attack_l2).abs() < 1e-4,
        "reported distance should match the returned image"
    );
}

/// Test that identical examples come back identical
#[test]
fn test_identical_inputs_identical_outputs() {
    let model = boundary_model();
    let images = grey(4);
    let labels = one_hot(&[0, 0, 0, 0], 2);
    let attack = CarliniL2::new(&model, boundary_config()).unwrap();
    let outcome = attack.attack(images.view(), labels.view()).unwrap();

    let first = outcome.adversarial.index_axis(ndarray::Axis(0), 0).to_owned();
    for e in 1..4 {
        assert!((outcome.best_l2[e] - outcome.best_l2[0]).abs() < 1e-6);
        assert_eq!(outcome.best_class[e], outcome.best_class[0]);
        let other = outcome.adversarial.index_axis(ndarray::Axis(0), e);
        assert!(first.iter().zip(other.iter()).all(|(a, b)| (a - b).abs() < 1e-6));
    }
}

/// Test that random targets never pick the true class
#[test]
fn test_random_targets_differ_from_truth() {
    let shape = ImageShape::square(2, 1);
    let model = LinearClassifier::random(shape, 10, 2);
    let truth: Vec<usize> = (0..10).collect();
    let labels = one_hot(&truth, 10);
    let images = Array4::from_elem(shape.batch_dims(10), 0.4);

    for seed in 0..8 {
        let config = AttackConfig::new(shape, 10)
            .with_targeted(true)
            .with_random_targets(true)
            .with_binary_search_steps(1)
            .with_max_iterations(2)
            .with_seed(seed);
        let outcome = CarliniL2::new(&model, config)
            .unwrap()
            .attack(images.view(), labels.view())
            .unwrap();
        for (e, row) in outcome.labels.outer_iter().enumerate() {
            let target = argmax(row.iter().copied());
            assert_ne!(target, truth[e], "seed {seed} example {e}");
        }
    }
}

/// Test that an already-fooled example succeeds at zero distance in step 0
#[test]
fn test_already_misclassified_costs_nothing() {
    let model = boundary_model();
    let images = grey(1);
    // claims class 1, model says class 0: untargeted success from the start
    let labels = one_hot(&[1], 2);
    let attack = CarliniL2::new(&model, boundary_config()).unwrap();
    let outcome = attack.attack(images.view(), labels.view()).unwrap();

    assert!(outcome.best_l2[0] < 1e-10);
    assert_eq!(outcome.best_class, vec![Some(0)]);
    let first = &outcome.batches[0].trace.steps[0];
    assert!(first.best_l2[0] < 1e-10);
    assert!(first.upper[0] < 1.0, "step 0 success should set an upper bound");
}

/// Test that the binary search only narrows its bounds
#[test]
fn test_search_trace_is_monotone() {
    let shape = ImageShape::square(3, 1);
    let model = LinearClassifier::random(shape, 5, 13);
    let images = Array4::from_shape_fn(shape.batch_dims(6), |(b, h, w, _)| {
        0.1 + 0.1 * ((b + h * 3 + w) % 8) as f32
    });
    let truth = model.predict(images.view()).unwrap();
    let config = AttackConfig::new(shape, 5)
        .with_targeted(false)
        .with_binary_search_steps(6)
        .with_max_iterations(50)
        .with_batch_size(4);
    let outcome = CarliniL2::new(&model, config)
        .unwrap()
        .attack(images.view(), one_hot(&truth, 5).view())
        .unwrap();

    assert_eq!(outcome.batches.len(), 2);
    assert_eq!(outcome.batches[1].start, 4);
    for batch in &outcome.batches {
        assert_eq!(batch.trace.steps.len(), 6);
        assert!(batch.trace.is_monotone());
    }
}

/// Test that repeat mode runs its last step at the upper bound
#[test]
fn test_repeat_mode_final_step_uses_upper_bound() {
    let model = boundary_model();
    let config = boundary_config()
        .with_binary_search_steps(10)
        .with_max_iterations(20);
    let outcome = CarliniL2::new(&model, config)
        .unwrap()
        .attack(grey(1).view(), one_hot(&[0], 2).view())
        .unwrap();

    let steps = &outcome.batches[0].trace.steps;
    assert_eq!(steps.len(), 10);
    assert_eq!(steps[9].consts[0], steps[8].upper[0]);
}

/// Test both fallbacks for an example that never succeeds
#[test]
fn test_fallback_images() {
    let model = hopeless_model();
    let images = grey(2);
    let labels = one_hot(&[1, 1], 2);

    for (fallback, expected) in [(Fallback::Original, 0.5), (Fallback::Zeros, 0.0)] {
        let config = AttackConfig::new(ImageShape::square(2, 1), 2)
            .with_targeted(true)
            .with_random_targets(false)
            .with_binary_search_steps(2)
            .with_max_iterations(20)
            .with_fallback(fallback);
        let outcome = CarliniL2::new(&model, config)
            .unwrap()
            .attack(images.view(), labels.view())
            .unwrap();

        assert_eq!(outcome.success_rate, 0.0);
        assert!(outcome.best_l2.iter().all(|&d| d == NO_SUCCESS_L2));
        assert_eq!(outcome.best_class, vec![None, None]);
        assert!(!outcome.succeeded(0));
        assert!(outcome.adversarial.iter().all(|&v| v == expected));
    }
}

/// Counts how often the attack consults it; adds nothing to the loss
#[derive(Debug, Default)]
struct CountingLoss {
    loss_calls: AtomicUsize,
    gradient_calls: AtomicUsize,
}

impl ExtraLoss for CountingLoss {
    fn loss(&self, _clean: ArrayView2<'_, f32>, adv: ArrayView2<'_, f32>) -> Array1<f32> {
        self.loss_calls.fetch_add(1, Ordering::Relaxed);
        Array1::zeros(adv.nrows())
    }

    fn gradient(&self, _clean: ArrayView2<'_, f32>, adv: ArrayView2<'_, f32>) -> Array2<f32> {
        self.gradient_calls.fetch_add(1, Ordering::Relaxed);
        Array2::zeros(adv.raw_dim())
    }
}

/// Test that a user loss term is evaluated and differentiated on both backends
#[test]
fn test_extra_loss_hook_is_used() {
    let model = boundary_model();
    for backend in [BackendSelection::Tape, BackendSelection::Session] {
        let extra = CountingLoss::default();
        let config = boundary_config()
            .with_binary_search_steps(1)
            .with_max_iterations(10)
            .with_abort_early(false)
            .with_backend(backend);
        CarliniL2::new(&model, config)
            .unwrap()
            .with_extra_loss(&extra)
            .attack(grey(1).view(), one_hot(&[0], 2).view())
            .unwrap();
        assert!(extra.loss_calls.load(Ordering::Relaxed) >= 10, "{backend}");
        assert!(extra.gradient_calls.load(Ordering::Relaxed) >= 10, "{backend}");
    }
}

/// NaN for single-example batches, zero otherwise
#[derive(Debug)]
struct NanOnLoneExample;

impl ExtraLoss for NanOnLoneExample {
    fn loss(&self, _clean: ArrayView2<'_, f32>, adv: ArrayView2<'_, f32>) -> Array1<f32> {
        let fill = if adv.nrows() == 1 { f32::NAN } else { 0.0 };
        Array1::from_elem(adv.nrows(), fill)
    }

    fn gradient(&self, _clean: ArrayView2<'_, f32>, adv: ArrayView2<'_, f32>) -> Array2<f32> {
        Array2::zeros(adv.raw_dim())
    }
}

/// Test that a diverging later batch fails the whole run
#[test]
fn test_non_finite_batch_aborts_run() {
    let model = boundary_model();
    for backend in [BackendSelection::Tape, BackendSelection::Session] {
        let config = boundary_config()
            .with_binary_search_steps(1)
            .with_max_iterations(10)
            .with_batch_size(2)
            .with_backend(backend);
        // batch 0 holds two examples and finishes; batch 1 holds one and diverges
        let err = CarliniL2::new(&model, config)
            .unwrap()
            .with_extra_loss(&NanOnLoneExample)
            .attack(grey(3).view(), one_hot(&[0, 0, 0], 2).view())
            .unwrap_err();
        assert!(
            matches!(err, AttackError::NonFinite { batch: 1, outer_step: 0, iteration: 0, .. }),
            "{backend}: {err}"
        );
    }
}

/// One value short per batch
#[derive(Debug)]
struct ShortLoss;

impl ExtraLoss for ShortLoss {
    fn loss(&self, _clean: ArrayView2<'_, f32>, adv: ArrayView2<'_, f32>) -> Array1<f32> {
        Array1::zeros(adv.nrows() - 1)
    }

    fn gradient(&self, _clean: ArrayView2<'_, f32>, adv: ArrayView2<'_, f32>) -> Array2<f32> {
        Array2::zeros(adv.raw_dim())
    }
}

/// Test that a misshapen extra loss is an error on both backends
#[test]
fn test_misshapen_extra_loss_is_an_error() {
    let model = boundary_model();
    for backend in [BackendSelection::Tape, BackendSelection::Session] {
        let config = boundary_config()
            .with_binary_search_steps(1)
            .with_max_iterations(5)
            .with_backend(backend);
        let err = CarliniL2::new(&model, config)
            .unwrap()
            .with_extra_loss(&ShortLoss)
            .attack(grey(2).view(), one_hot(&[0, 0], 2).view())
            .unwrap_err();
        assert!(
            matches!(&err, AttackError::DimensionMismatch { context, .. } if context == "extra loss"),
            "{backend}: {err}"
        );
    }
}

/// Backend with a scripted loss sequence
#[derive(Debug)]
struct ScriptedBackend {
    losses: Vec<f32>,
    steps: usize,
    /// Iteration whose logits reach the target class
    success_at: Option<usize>,
    modifier: Array4<f32>,
}

impl ScriptedBackend {
    fn new(losses: Vec<f32>) -> Self {
        Self {
            losses,
            steps: 0,
            success_at: None,
            modifier: Array4::zeros((1, 1, 1, 1)),
        }
    }
}

impl AttackBackend for ScriptedBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Session
    }

    fn setup(&mut self, _images: ArrayView4<'_, f32>, _labels: ArrayView2<'_, f32>) -> Result<()> {
        Ok(())
    }

    fn set_consts(&mut self, _consts: ArrayView1<'_, f32>) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) {
        self.steps = 0;
    }

    fn evaluate(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        Ok(Array2::zeros((images.dim().0, 2)))
    }

    fn step(&mut self) -> Result<StepOutput> {
        let loss = self.losses[self.steps.min(self.losses.len() - 1)];
        let logits = if self.success_at == Some(self.steps) {
            array![[0.0, 1.0]]
        } else {
            array![[1.0, 0.0]]
        };
        self.steps += 1;
        Ok(StepOutput {
            loss,
            l2: Array1::from_elem(1, 0.25),
            logits,
            adv_images: Array4::zeros((1, 1, 1, 1)),
        })
    }

    fn modifier(&self) -> ArrayView4<'_, f32> {
        self.modifier.view()
    }
}

fn scripted_config(max_iterations: usize, abort_early: bool) -> AttackConfig {
    AttackConfig::new(ImageShape::square(1, 1), 2)
        .with_targeted(true)
        .with_max_iterations(max_iterations)
        .with_abort_early(abort_early)
}

fn tracker() -> BestTracker {
    BestTracker::new(vec![1], Array4::zeros((1, 1, 1, 1)), true, 0.0)
}

const CONTEXT: DescentContext = DescentContext {
    batch: 0,
    outer_step: 0,
};

/// Test that a flat loss stops at the second check point
#[test]
fn test_constant_loss_aborts_early() {
    let mut backend = ScriptedBackend::new(vec![1.0]);
    let config = scripted_config(100, true);
    let outcome = run_descent(&mut backend, &mut tracker(), &config, CONTEXT).unwrap();
    assert_eq!(outcome.state, DescentState::EarlyStopped);
    // check points at 0 and 10; the second sees no improvement
    assert_eq!(outcome.iterations, 11);
}

/// Test that improving loss and disabled abort both run to the end
#[test]
fn test_descent_runs_to_completion() {
    let falling: Vec<f32> = (0..100).map(|i| 100.0 - i as f32).collect();
    let mut backend = ScriptedBackend::new(falling);
    let outcome = run_descent(&mut backend, &mut tracker(), &scripted_config(100, true), CONTEXT)
        .unwrap();
    assert_eq!(outcome.state, DescentState::Completed);
    assert_eq!(outcome.iterations, 100);

    let mut backend = ScriptedBackend::new(vec![1.0]);
    let outcome = run_descent(&mut backend, &mut tracker(), &scripted_config(30, false), CONTEXT)
        .unwrap();
    assert_eq!(outcome.state, DescentState::Completed);
    assert_eq!(outcome.iterations, 30);
}

/// Test that a NaN loss is reported with its location
#[test]
fn test_non_finite_loss_is_an_error() {
    let mut backend = ScriptedBackend::new(vec![1.0, 0.5, f32::NAN]);
    let err = run_descent(&mut backend, &mut tracker(), &scripted_config(10, true), CONTEXT)
        .unwrap_err();
    assert!(matches!(err, AttackError::NonFinite { iteration: 2, .. }));
}

/// Test that a success between check points is only seen with per-iteration tracking
#[test]
fn test_tracker_cadence() {
    let run = |tracking| {
        let mut backend = ScriptedBackend::new(vec![1.0]);
        backend.success_at = Some(5);
        let config = scripted_config(100, false).with_tracking(tracking);
        let mut tracker = tracker();
        let outcome = run_descent(&mut backend, &mut tracker, &config, CONTEXT).unwrap();
        assert_eq!(outcome.iterations, 100);
        tracker
    };

    // check points fall on multiples of 10, so iteration 5 is skipped
    let sparse = run(TrackingCadence::CheckPoints);
    assert_eq!(sparse.best_l2()[0], NO_SUCCESS_L2);
    assert_eq!(sparse.best_class()[0], None);

    let dense = run(TrackingCadence::EveryIteration);
    assert_eq!(dense.best_l2()[0], 0.25);
    assert_eq!(dense.best_class()[0], Some(1));
}

/// Test that a success landing on a check point is recorded by default
#[test]
fn test_check_point_success_recorded() {
    let mut backend = ScriptedBackend::new(vec![1.0]);
    backend.success_at = Some(20);
    let mut tracker = tracker();
    run_descent(&mut backend, &mut tracker, &scripted_config(100, false), CONTEXT).unwrap();
    assert_eq!(tracker.best_l2()[0], 0.25);
}
