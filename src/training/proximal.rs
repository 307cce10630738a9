//! Proximal operators applied after a gradient step.

use burn::prelude::*;
use burn::tensor::ElementConversion;

/// Hard threshold: zero every entry with `|y| < sqrt(c)`
pub fn proximal_l0<B: Backend, const D: usize>(y: Tensor<B, D>, c: f64) -> Tensor<B, D> {
    let below = y.clone().abs().lower_elem(c.sqrt());
    y.mask_fill(below, 0.0)
}

/// Group soft threshold over the whole tensor.
///
/// Shrinks the Frobenius norm by `c / 2`, or returns all zeros when the norm
/// is at most `c / 2`.
pub fn proximal_glasso_nonoverlap<B: Backend, const D: usize>(y: Tensor<B, D>, c: f64) -> Tensor<B, D> {
    let norm = y.clone().powf_scalar(2.0).sum().sqrt().into_scalar().elem::<f64>();
    let threshold = c / 2.0;
    if norm > threshold {
        y.mul_scalar((norm - threshold) / norm)
    } else {
        y.zeros_like()
    }
}

/// Weight decay: `y / (1 + c)`
pub fn proximal_l2<B: Backend, const D: usize>(y: Tensor<B, D>, c: f64) -> Tensor<B, D> {
    y.div_scalar(1.0 + c)
}
