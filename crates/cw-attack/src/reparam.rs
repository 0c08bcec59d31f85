// SPDX-License-Identifier: AGPL-3.0-only

//! Tanh-space change of variables
//!
//! The optimiser works on an unbounded variable `w`; images are recovered as
//! `0.5 + 0.5 * s * tanh(w)`, which stays in `(0, 1)` without clipping.
//! `s` is slightly below one so `atanh` never sees `±1` and the image
//! never reaches the box edges even when `tanh` saturates in `f32`.

use ndarray::{Array4, ArrayView4, Zip};

/// Scale applied inside `atanh` and after `tanh` (`1.999999 / 2`)
pub const SAFE_SCALE: f32 = 0.999_999;

/// Map images in `[0, 1]` to tanh space
///
/// Values outside `[0, 1]` are clamped first.
pub fn to_optimization_space(images: ArrayView4<'_, f32>) -> Array4<f32> {
    images.mapv(|x| ((x.clamp(0.0, 1.0) * 2.0 - 1.0) * SAFE_SCALE).atanh())
}

/// Map `modifier + base` back to image space
pub fn to_image_space(modifier: ArrayView4<'_, f32>, base: ArrayView4<'_, f32>) -> Array4<f32> {
    Zip::from(&modifier)
        .and(&base)
        .map_collect(|&m, &b| pixel(m + b))
}

/// The image a zero modifier produces, used as the L2 reference
pub fn round_trip(base: ArrayView4<'_, f32>) -> Array4<f32> {
    base.mapv(pixel)
}

/// `d image / d modifier`, elementwise
pub fn image_space_derivative(
    modifier: ArrayView4<'_, f32>,
    base: ArrayView4<'_, f32>,
) -> Array4<f32> {
    Zip::from(&modifier).and(&base).map_collect(|&m, &b| {
        let t = (m + b).tanh();
        0.5 * SAFE_SCALE * (1.0 - t * t)
    })
}

#[inline]
fn pixel(w: f32) -> f32 {
    0.5 + 0.5 * SAFE_SCALE * w.tanh()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample() -> Array4<f32> {
        Array4::from_shape_vec(
            (1, 2, 3, 1),
            vec![0.0, 1.0, 0.5, 0.25, 0.999, 1e-4],
        )
        .unwrap()
    }

    #[test]
    fn test_round_trip_law() {
        let images = sample();
        let base = to_optimization_space(images.view());
        let zero = Array4::<f32>::zeros(images.dim());
        let back = to_image_space(zero.view(), base.view());
        for (a, b) in images.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-5);
        }
        assert_eq!(back, round_trip(base.view()));
    }

    #[test]
    fn test_output_strictly_inside_box() {
        let base = to_optimization_space(sample().view());
        for shift in [-1e6_f32, -50.0, -1.0, 0.0, 1.0, 50.0, 1e6] {
            let modifier = Array4::from_elem(base.dim(), shift);
            let img = to_image_space(modifier.view(), base.view());
            assert!(img.iter().all(|&v| v > 0.0 && v < 1.0), "shift {shift}");
        }
    }

    #[test]
    fn test_endpoints_are_finite() {
        let base = to_optimization_space(sample().view());
        assert!(base.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_out_of_range_inputs_clamped() {
        let images = Array4::from_shape_vec((1, 1, 2, 1), vec![-3.0, 7.0]).unwrap();
        let base = to_optimization_space(images.view());
        let back = round_trip(base.view());
        assert_abs_diff_eq!(back[[0, 0, 0, 0]], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(back[[0, 0, 1, 0]], 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let base = to_optimization_space(sample().view());
        let modifier = Array4::from_elem(base.dim(), 0.1_f32);
        let analytic = image_space_derivative(modifier.view(), base.view());
        let h = 1e-2_f32;
        let plus = to_image_space(modifier.mapv(|m| m + h).view(), base.view());
        let minus = to_image_space(modifier.mapv(|m| m - h).view(), base.view());
        for ((a, p), m) in analytic.iter().zip(plus.iter()).zip(minus.iter()) {
            assert_abs_diff_eq!(*a, (p - m) / (2.0 * h), epsilon = 1e-3);
        }
    }
}
