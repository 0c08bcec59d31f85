// SPDX-License-Identifier: AGPL-3.0-only

//! Wengert tape: reverse-mode differentiation by operation recording
//!
//! Operations are recorded during the forward pass into a linear tape and
//! replayed in reverse to accumulate gradients. The classifier, the margin
//! and the extra loss enter as opaque blocks whose vector-Jacobian products
//! come from their owners (`Classifier::backward`, `LossEvaluator`,
//! `ExtraLoss::gradient`).
//!
//! Buffers are snapshotted on registration, so later mutation of the source
//! arrays never reaches the tape.

use crate::error::{AttackError, Result};
use crate::loss::{checked_extra_gradient, checked_extra_loss, ExtraLoss, LossEvaluator};
use cw_models::Classifier;
use ndarray::{arr0, Array1, Array2, ArrayD, ArrayView2, ArrayView4, Axis, Ix2, Ix4, Zip};

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A tensor buffer in the tape arena
#[derive(Clone, Debug)]
struct TapeBuf {
    data: ArrayD<f32>,
    /// True for buffers whose gradient is requested
    is_param: bool,
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation
#[derive(Debug, Clone)]
pub enum TapeOp<'m> {
    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A * B
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = tanh(x); saves output for backward
    Tanh { input: BufId, out: BufId },
    /// out = scale * x + shift
    Affine { input: BufId, scale: f32, out: BufId },
    /// out = x²
    Square { input: BufId, out: BufId },

    // ── Reductions ──────────────────────────────────────────────
    /// out[e] = Σ x[e, ...]
    SumPerExample { input: BufId, out: BufId },
    /// out = Σ x (scalar)
    Sum { input: BufId, out: BufId },

    // ── Opaque blocks ───────────────────────────────────────────
    /// out = model(x); VJP is `Classifier::backward`
    Classifier {
        input: BufId,
        out: BufId,
        model: &'m dyn Classifier,
    },
    /// out[e] = margin(logits[e], labels[e])
    Margin {
        logits: BufId,
        labels: BufId,
        out: BufId,
        evaluator: LossEvaluator,
    },
    /// out[e] = extra(clean[e], logits[e])
    Extra {
        logits: BufId,
        clean: BufId,
        out: BufId,
        loss: &'m dyn ExtraLoss,
    },
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD
///
/// Consumed by [`Tape::backward`], which returns the accumulated gradients.
#[derive(Debug, Default)]
pub struct Tape<'m> {
    /// Operations in forward order
    ops: Vec<TapeOp<'m>>,
    /// Arena of tensor buffers, indexed by `BufId`
    bufs: Vec<TapeBuf>,
}

impl<'m> Tape<'m> {
    /// Create an empty tape
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer whose gradient is wanted
    pub fn register_param(&mut self, data: ArrayD<f32>) -> BufId {
        self.alloc(data, true)
    }

    /// Register a constant input
    pub fn register_input(&mut self, data: ArrayD<f32>) -> BufId {
        self.alloc(data, false)
    }

    /// Value of a buffer
    pub fn value(&self, id: BufId) -> &ArrayD<f32> {
        &self.bufs[id].data
    }

    /// Number of ops recorded
    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    fn alloc(&mut self, data: ArrayD<f32>, is_param: bool) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf { data, is_param });
        id
    }

    /// Allocate the output buffer and record the op producing it
    fn record_with_output(
        &mut self,
        data: ArrayD<f32>,
        op_fn: impl FnOnce(BufId) -> TapeOp<'m>,
    ) -> BufId {
        let out = self.alloc(data, false);
        self.ops.push(op_fn(out));
        out
    }

    fn same_shape(&self, op: &str, a: BufId, b: BufId) -> Result<()> {
        let (sa, sb) = (self.bufs[a].data.shape(), self.bufs[b].data.shape());
        if sa != sb {
            return Err(AttackError::dimension_mismatch(
                format!("tape {op}"),
                format!("{sa:?}"),
                format!("{sb:?}"),
            ));
        }
        Ok(())
    }

    // ── Recording ────────────────────────────────────────────────

    /// Record `a + b`
    ///
    /// # Errors
    ///
    /// Returns error if shapes differ.
    pub fn add(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("add", a, b)?;
        let data = &self.bufs[a].data + &self.bufs[b].data;
        Ok(self.record_with_output(data, |out| TapeOp::Add { a, b, out }))
    }

    /// Record `a - b`
    ///
    /// # Errors
    ///
    /// Returns error if shapes differ.
    pub fn sub(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("sub", a, b)?;
        let data = &self.bufs[a].data - &self.bufs[b].data;
        Ok(self.record_with_output(data, |out| TapeOp::Sub { a, b, out }))
    }

    /// Record `a * b`
    ///
    /// # Errors
    ///
    /// Returns error if shapes differ.
    pub fn mul(&mut self, a: BufId, b: BufId) -> Result<BufId> {
        self.same_shape("mul", a, b)?;
        let data = &self.bufs[a].data * &self.bufs[b].data;
        Ok(self.record_with_output(data, |out| TapeOp::Mul { a, b, out }))
    }

    /// Record `tanh(x)`
    pub fn tanh(&mut self, input: BufId) -> BufId {
        let data = self.bufs[input].data.mapv(f32::tanh);
        self.record_with_output(data, |out| TapeOp::Tanh { input, out })
    }

    /// Record `scale * x + shift`
    pub fn affine(&mut self, input: BufId, scale: f32, shift: f32) -> BufId {
        let data = self.bufs[input].data.mapv(|x| scale * x + shift);
        self.record_with_output(data, |out| TapeOp::Affine { input, scale, out })
    }

    /// Record `x²`
    pub fn square(&mut self, input: BufId) -> BufId {
        let data = self.bufs[input].data.mapv(|x| x * x);
        self.record_with_output(data, |out| TapeOp::Square { input, out })
    }

    /// Record a sum over every axis but the first
    ///
    /// # Errors
    ///
    /// Returns error on a 0-D input.
    pub fn sum_per_example(&mut self, input: BufId) -> Result<BufId> {
        let x = &self.bufs[input].data;
        if x.ndim() == 0 {
            return Err(AttackError::dimension_mismatch(
                "tape sum_per_example",
                "batched tensor",
                "scalar",
            ));
        }
        let data: ArrayD<f32> = x
            .axis_iter(Axis(0))
            .map(|row| row.sum())
            .collect::<Array1<f32>>()
            .into_dyn();
        Ok(self.record_with_output(data, |out| TapeOp::SumPerExample { input, out }))
    }

    /// Record a full sum to a scalar
    pub fn sum(&mut self, input: BufId) -> BufId {
        let data = arr0(self.bufs[input].data.sum()).into_dyn();
        self.record_with_output(data, |out| TapeOp::Sum { input, out })
    }

    /// Record a classifier forward pass as an opaque block
    ///
    /// # Errors
    ///
    /// Returns error if the input is not a 4-D batch or the classifier fails.
    pub fn classifier(&mut self, input: BufId, model: &'m dyn Classifier) -> Result<BufId> {
        let logits = model.forward(self.view4(input)?)?;
        Ok(self.record_with_output(logits.into_dyn(), |out| TapeOp::Classifier {
            input,
            out,
            model,
        }))
    }

    /// Record the per-example classification margin
    ///
    /// # Errors
    ///
    /// Returns error if `logits` or `labels` are not 2-D.
    pub fn margin(
        &mut self,
        logits: BufId,
        labels: BufId,
        evaluator: LossEvaluator,
    ) -> Result<BufId> {
        self.same_shape("margin", logits, labels)?;
        let data = evaluator
            .margin(self.view2(logits)?, self.view2(labels)?)
            .into_dyn();
        Ok(self.record_with_output(data, |out| TapeOp::Margin {
            logits,
            labels,
            out,
            evaluator,
        }))
    }

    /// Record the extra loss term
    ///
    /// # Errors
    ///
    /// Returns error if `logits` or `clean` are not 2-D, or if `loss`
    /// does not yield one value per row.
    pub fn extra(&mut self, logits: BufId, clean: BufId, loss: &'m dyn ExtraLoss) -> Result<BufId> {
        self.same_shape("extra", logits, clean)?;
        let data = checked_extra_loss(loss, self.view2(clean)?, self.view2(logits)?)?.into_dyn();
        Ok(self.record_with_output(data, |out| TapeOp::Extra {
            logits,
            clean,
            out,
            loss,
        }))
    }

    // ── Views ────────────────────────────────────────────────────

    fn view4(&self, id: BufId) -> Result<ArrayView4<'_, f32>> {
        let data = &self.bufs[id].data;
        data.view()
            .into_dimensionality::<Ix4>()
            .map_err(|_| AttackError::dimension_mismatch("tape buffer", "4-D", data.ndim()))
    }

    fn view2(&self, id: BufId) -> Result<ArrayView2<'_, f32>> {
        let data = &self.bufs[id].data;
        data.view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| AttackError::dimension_mismatch("tape buffer", "2-D", data.ndim()))
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Replay the tape in reverse from a scalar loss
    ///
    /// # Errors
    ///
    /// Returns error if `loss_id` is not a scalar, or an opaque block's
    /// VJP fails.
    pub fn backward(self, loss_id: BufId) -> Result<TapeGrads> {
        if self.bufs[loss_id].data.len() != 1 {
            return Err(AttackError::dimension_mismatch(
                "tape loss",
                "scalar",
                format!("{:?}", self.bufs[loss_id].data.shape()),
            ));
        }
        let mut grad_accum: Vec<Option<ArrayD<f32>>> = vec![None; self.bufs.len()];
        grad_accum[loss_id] = Some(ArrayD::ones(self.bufs[loss_id].data.raw_dim()));

        for op in self.ops.iter().rev() {
            self.backward_op(op, &mut grad_accum)?;
        }

        let grads = self
            .bufs
            .iter()
            .zip(grad_accum)
            .map(|(buf, g)| {
                buf.is_param
                    .then(|| g.unwrap_or_else(|| ArrayD::zeros(buf.data.raw_dim())))
            })
            .collect();
        Ok(TapeGrads { grads })
    }

    /// Compute the VJP of one operation
    fn backward_op(&self, op: &TapeOp<'m>, acc: &mut [Option<ArrayD<f32>>]) -> Result<()> {
        match *op {
            TapeOp::Add { a, b, out } => {
                if let Some(d_out) = acc[out].clone() {
                    accumulate(acc, a, &d_out);
                    accumulate(acc, b, &d_out);
                }
            }
            TapeOp::Sub { a, b, out } => {
                if let Some(d_out) = acc[out].clone() {
                    accumulate(acc, a, &d_out);
                    accumulate(acc, b, &d_out.mapv(|d| -d));
                }
            }
            TapeOp::Mul { a, b, out } => {
                if let Some(d_out) = acc[out].clone() {
                    accumulate(acc, a, &(&d_out * &self.bufs[b].data));
                    accumulate(acc, b, &(&d_out * &self.bufs[a].data));
                }
            }
            TapeOp::Tanh { input, out } => {
                if let Some(d_out) = acc[out].clone() {
                    let d_in = Zip::from(&d_out)
                        .and(&self.bufs[out].data)
                        .map_collect(|&d, &t| d * (1.0 - t * t));
                    accumulate(acc, input, &d_in);
                }
            }
            TapeOp::Affine { input, scale, out } => {
                if let Some(d_out) = acc[out].clone() {
                    accumulate(acc, input, &d_out.mapv(|d| d * scale));
                }
            }
            TapeOp::Square { input, out } => {
                if let Some(d_out) = acc[out].clone() {
                    let d_in = Zip::from(&d_out)
                        .and(&self.bufs[input].data)
                        .map_collect(|&d, &x| 2.0 * x * d);
                    accumulate(acc, input, &d_in);
                }
            }
            TapeOp::SumPerExample { input, out } => {
                if let Some(d_out) = acc[out].clone() {
                    let mut d_in = ArrayD::zeros(self.bufs[input].data.raw_dim());
                    for (mut row, &d) in d_in.axis_iter_mut(Axis(0)).zip(d_out.iter()) {
                        row.fill(d);
                    }
                    accumulate(acc, input, &d_in);
                }
            }
            TapeOp::Sum { input, out } => {
                if let Some(d_out) = acc[out].clone() {
                    let d = d_out.sum();
                    accumulate(acc, input, &ArrayD::from_elem(self.bufs[input].data.raw_dim(), d));
                }
            }
            TapeOp::Classifier { input, out, model } => {
                if let Some(d_out) = acc[out].clone() {
                    let d_logits = d_out
                        .view()
                        .into_dimensionality::<Ix2>()
                        .map_err(|_| AttackError::dimension_mismatch("logits grad", "2-D", d_out.ndim()))?;
                    let d_in = model.backward(self.view4(input)?, d_logits)?;
                    accumulate(acc, input, &d_in.into_dyn());
                }
            }
            TapeOp::Margin {
                logits,
                labels,
                out,
                evaluator,
            } => {
                if let Some(d_out) = acc[out].clone() {
                    let grad = evaluator.margin_gradient(self.view2(logits)?, self.view2(labels)?);
                    accumulate(acc, logits, &scale_rows(grad, &d_out)?);
                }
            }
            TapeOp::Extra {
                logits,
                clean,
                out,
                loss,
            } => {
                if let Some(d_out) = acc[out].clone() {
                    let grad =
                        checked_extra_gradient(loss, self.view2(clean)?, self.view2(logits)?)?;
                    accumulate(acc, logits, &scale_rows(grad, &d_out)?);
                }
            }
        }
        Ok(())
    }
}

/// Accumulate gradient into a buffer's accumulator
fn accumulate(acc: &mut [Option<ArrayD<f32>>], id: BufId, grad: &ArrayD<f32>) {
    if let Some(existing) = acc[id].as_mut() {
        *existing += grad;
    } else {
        acc[id] = Some(grad.clone());
    }
}

/// Multiply row `e` of `grad` by `d_out[e]`
fn scale_rows(mut grad: Array2<f32>, d_out: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    if d_out.len() != grad.nrows() {
        return Err(AttackError::dimension_mismatch(
            "per-example upstream gradient",
            grad.nrows(),
            d_out.len(),
        ));
    }
    for (mut row, &d) in grad.outer_iter_mut().zip(d_out.iter()) {
        row *= d;
    }
    Ok(grad.into_dyn())
}

/// Gradients of the parameter buffers after a backward pass
#[derive(Debug, Clone)]
pub struct TapeGrads {
    grads: Vec<Option<ArrayD<f32>>>,
}

impl TapeGrads {
    /// Gradient of a parameter buffer; `None` for non-parameters
    pub fn wrt(&self, id: BufId) -> Option<&ArrayD<f32>> {
        self.grads.get(id).and_then(Option::as_ref)
    }

    /// Take ownership of a parameter gradient
    pub fn take(&mut self, id: BufId) -> Option<ArrayD<f32>> {
        self.grads.get_mut(id).and_then(Option::take)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use cw_models::{ImageShape, LinearClassifier};
    use ndarray::{array, Array4};

    #[test]
    fn test_elementwise_chain() {
        // loss = Σ (tanh(x) * y - y)²
        let mut tape = Tape::new();
        let x = tape.register_param(array![0.3_f32, -0.7].into_dyn());
        let y = tape.register_input(array![2.0_f32, 0.5].into_dyn());
        let t = tape.tanh(x);
        let m = tape.mul(t, y).unwrap();
        let d = tape.sub(m, y).unwrap();
        let sq = tape.square(d);
        let loss = tape.sum(sq);
        let grads = tape.backward(loss).unwrap();
        let g = grads.wrt(x).unwrap();
        for (i, (&xv, &yv)) in [0.3_f32, -0.7].iter().zip([2.0_f32, 0.5].iter()).enumerate() {
            let t = xv.tanh();
            let expected = 2.0 * (t * yv - yv) * yv * (1.0 - t * t);
            assert_abs_diff_eq!(g[i], expected, epsilon = 1e-5);
        }
        assert!(grads.wrt(y).is_none());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let mut tape = Tape::new();
        let a = tape.register_input(array![1.0_f32, 2.0].into_dyn());
        let b = tape.register_input(array![1.0_f32].into_dyn());
        assert!(tape.add(a, b).is_err());
    }

    #[test]
    fn test_non_scalar_loss_rejected() {
        let mut tape = Tape::new();
        let a = tape.register_param(array![1.0_f32, 2.0].into_dyn());
        assert!(tape.backward(a).is_err());
    }

    #[test]
    fn test_sum_per_example_broadcasts_back() {
        let mut tape = Tape::new();
        let x = tape.register_param(Array4::<f32>::ones((2, 1, 2, 1)).into_dyn());
        let per = tape.sum_per_example(x).unwrap();
        assert_eq!(tape.value(per).as_slice().unwrap(), &[2.0, 2.0]);
        let w = tape.register_input(array![3.0_f32, -1.0].into_dyn());
        let weighted = tape.mul(per, w).unwrap();
        let loss = tape.sum(weighted);
        let grads = tape.backward(loss).unwrap();
        let g = grads.wrt(x).unwrap();
        assert_eq!(g[[0, 0, 1, 0]], 3.0);
        assert_eq!(g[[1, 0, 0, 0]], -1.0);
    }

    #[test]
    fn test_classifier_block_uses_model_backward() {
        let shape = ImageShape::new(1, 2, 1);
        let model =
            LinearClassifier::new(shape, array![[1.0, 2.0], [-1.0, 0.5]], array![0.0, 0.0]).unwrap();
        let mut tape = Tape::new();
        let x = tape.register_param(Array4::<f32>::zeros((1, 1, 2, 1)).into_dyn());
        let logits = tape.classifier(x, &model).unwrap();
        let loss = tape.sum(logits);
        let grads = tape.backward(loss).unwrap();
        let g = grads.wrt(x).unwrap();
        assert_abs_diff_eq!(g[[0, 0, 0, 0]], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(g[[0, 0, 1, 0]], 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_margin_block() {
        let mut tape = Tape::new();
        let z = tape.register_param(array![[1.0_f32, 3.0, 2.0]].into_dyn());
        let lab = tape.register_input(array![[0.0_f32, 0.0, 1.0]].into_dyn());
        let m = tape.margin(z, lab, LossEvaluator::new(true, 0.0)).unwrap();
        assert_abs_diff_eq!(tape.value(m)[[0]], 1.0);
        let loss = tape.sum(m);
        let grads = tape.backward(loss).unwrap();
        let g = grads.wrt(z).unwrap();
        assert_eq!(g.as_slice().unwrap(), &[0.0, 1.0, -1.0]);
    }
}
