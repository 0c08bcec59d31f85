// SPDX-License-Identifier: AGPL-3.0-only

//! Adam optimizer for the tanh-space modifier
//!
//! Keeps first and second moment estimates with bias correction:
//!
//! ```text
//! m = β1·m + (1 - β1)·g
//! v = β2·v + (1 - β2)·g²
//! θ -= lr · (m / (1 - β1^t)) / (sqrt(v / (1 - β2^t)) + ε)
//! ```
//!
//! The moments belong to one binary-search step; [`Adam::reset`] must be
//! called before the next one so old momentum does not steer a new constant.

use ndarray::{Array4, ArrayView4, Zip};

/// First moment decay rate
pub const DEFAULT_BETA1: f32 = 0.9;

/// Second moment decay rate
pub const DEFAULT_BETA2: f32 = 0.999;

/// Numerical stability term
pub const DEFAULT_EPSILON: f32 = 1e-8;

/// Adam state for one 4-D parameter tensor
#[derive(Debug, Clone)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    m: Array4<f32>,
    v: Array4<f32>,
    t: i32,
}

impl Adam {
    /// Zeroed moments for a parameter of shape `dim`
    pub fn new(lr: f32, dim: (usize, usize, usize, usize)) -> Self {
        Self {
            lr,
            beta1: DEFAULT_BETA1,
            beta2: DEFAULT_BETA2,
            epsilon: DEFAULT_EPSILON,
            m: Array4::zeros(dim),
            v: Array4::zeros(dim),
            t: 0,
        }
    }

    /// Clear moments and timestep
    pub fn reset(&mut self) {
        self.m.fill(0.0);
        self.v.fill(0.0);
        self.t = 0;
    }

    /// Number of updates applied since the last reset
    pub const fn timestep(&self) -> i32 {
        self.t
    }

    /// Apply one update to `params` in place
    pub fn step(&mut self, params: &mut Array4<f32>, grad: ArrayView4<'_, f32>) {
        self.t = self.t.saturating_add(1);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);
        let bc1 = 1.0 - b1.powi(self.t);
        let bc2 = 1.0 - b2.powi(self.t);
        let lr = self.lr;

        Zip::from(params)
            .and(&mut self.m)
            .and(&mut self.v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                let m_hat = *m / bc1;
                let v_hat = *v / bc2;
                *p -= lr * m_hat / (v_hat.sqrt() + eps);
            });
    }
}
