//! Gradient clipping by global p-norm.

use crate::model::Parameter;

/// Rescale gradients so their global `norm_type`-norm is at most `max_norm`.
///
/// `norm_type` may be `f32::INFINITY` for the max-abs norm. Parameters without
/// a gradient are skipped. Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &mut [&mut Parameter], max_norm: f32, norm_type: f32) -> f32 {
    let grads = || params.iter().filter_map(|p| p.grad.as_ref());

    let total_norm = if norm_type.is_infinite() {
        grads()
            .flat_map(|g| g.iter())
            .fold(0.0_f32, |acc, &g| acc.max(g.abs()))
    } else {
        grads()
            .flat_map(|g| g.iter())
            .map(|&g| g.abs().powf(norm_type))
            .sum::<f32>()
            .powf(1.0 / norm_type)
    };

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for param in params.iter_mut() {
            if let Some(grad) = param.grad.as_mut() {
                grad.mapv_inplace(|g| g * clip_coef);
            }
        }
    }

    total_norm
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{ArrayD, IxDyn, arr1};

    fn param_with_grad(grad: &[f32]) -> Parameter {
        let mut p = Parameter::new(ArrayD::zeros(IxDyn(&[grad.len()])));
        p.grad = Some(arr1(grad).into_dyn());
        p
    }

    #[test]
    fn test_below_threshold_is_untouched() {
        let mut a = param_with_grad(&[0.1, 0.2]);
        let mut b = param_with_grad(&[0.1]);
        let norm = clip_grad_norm(&mut [&mut a, &mut b], 1.0, 2.0);
        assert!((norm - 0.06_f32.sqrt()).abs() < 1e-5);
        assert_eq!(a.grad.unwrap()[[1]], 0.2);
    }

    #[test]
    fn test_l2_clipping_rescales_globally() {
        let mut a = param_with_grad(&[3.0]);
        let mut b = param_with_grad(&[4.0]);
        let norm = clip_grad_norm(&mut [&mut a, &mut b], 1.0, 2.0);
        assert!((norm - 5.0).abs() < 1e-5);
        let ga = a.grad.unwrap()[[0]];
        let gb = b.grad.unwrap()[[0]];
        assert!((ga - 0.6).abs() < 1e-4);
        assert!((gb - 0.8).abs() < 1e-4);
    }

    #[test]
    fn test_inf_norm_uses_max_abs() {
        let mut a = param_with_grad(&[-4.0, 1.0]);
        let norm = clip_grad_norm(&mut [&mut a], 2.0, f32::INFINITY);
        assert_eq!(norm, 4.0);
        let g = a.grad.unwrap();
        assert!((g[[0]] + 2.0).abs() < 1e-4);
        assert!((g[[1]] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_missing_grads_are_skipped() {
        let mut a = Parameter::new(ArrayD::zeros(IxDyn(&[2])));
        let norm = clip_grad_norm(&mut [&mut a], 1.0, 2.0);
        assert_eq!(norm, 0.0);
        assert!(a.grad.is_none());
    }
}
