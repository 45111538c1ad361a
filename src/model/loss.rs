//! Sample-weighted training objectives.
//!
//! The data reader keeps sentinel-labelled samples in the batch with a
//! near-zero weight; these losses honor that by normalizing with the
//! weight sum, so such samples contribute nothing to the objective.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::model::LossKind;

const EPS: f32 = 1e-7;

fn per_sample<B: Backend>(
    kind: LossKind,
    predictions: Tensor<B, 2>,
    targets: Tensor<B, 2>,
) -> Tensor<B, 1> {
    match kind {
        LossKind::BinaryCrossentropy => {
            let p = predictions.clamp(EPS, 1.0 - EPS);
            let loss = targets.clone().mul(p.clone().log())
                + targets.neg().add_scalar(1.0).mul(p.neg().add_scalar(1.0).log());
            loss.neg().mean_dim(1).squeeze(1)
        }
        LossKind::CategoricalCrossentropy => {
            let p = predictions.clamp(EPS, 1.0 - EPS);
            targets.mul(p.log()).sum_dim(1).neg().squeeze(1)
        }
        LossKind::MeanSquaredError => {
            let diff = predictions - targets;
            diff.clone().mul(diff).mean_dim(1).squeeze(1)
        }
    }
}

/// Weighted mean of the per-sample loss.
///
/// `predictions` and `targets` are `[batch, units]`, `weights` is
/// `[batch]`. Returns a scalar tensor.
pub fn weighted_loss<B: Backend>(
    kind: LossKind,
    predictions: Tensor<B, 2>,
    targets: Tensor<B, 2>,
    weights: Tensor<B, 1>,
) -> Tensor<B, 1> {
    let losses = per_sample(kind, predictions, targets);
    let weighted = losses.mul(weights.clone()).sum();
    weighted.div(weights.sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DefaultBackend;

    type B = DefaultBackend;

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    #[test]
    fn test_bce_perfect_prediction_is_near_zero() {
        let p = Tensor::<B, 2>::from_floats([[1.0], [0.0]], &device());
        let t = Tensor::<B, 2>::from_floats([[1.0], [0.0]], &device());
        let w = Tensor::<B, 1>::from_floats([1.0, 1.0], &device());
        let loss = weighted_loss(LossKind::BinaryCrossentropy, p, t, w).into_scalar();
        assert!(loss < 1e-5);
    }

    #[test]
    fn test_zero_weight_excludes_sample() {
        // second sample is maximally wrong but carries zero weight
        let p = Tensor::<B, 2>::from_floats([[0.9], [0.01]], &device());
        let t = Tensor::<B, 2>::from_floats([[1.0], [1.0]], &device());

        let w_all = Tensor::<B, 1>::from_floats([1.0, 0.0], &device());
        let masked = weighted_loss(LossKind::BinaryCrossentropy, p.clone(), t.clone(), w_all)
            .into_scalar();

        let p1 = Tensor::<B, 2>::from_floats([[0.9]], &device());
        let t1 = Tensor::<B, 2>::from_floats([[1.0]], &device());
        let w1 = Tensor::<B, 1>::from_floats([1.0], &device());
        let solo = weighted_loss(LossKind::BinaryCrossentropy, p1, t1, w1).into_scalar();

        assert!((masked - solo).abs() < 1e-6);
    }

    #[test]
    fn test_categorical_crossentropy() {
        let p = Tensor::<B, 2>::from_floats([[0.7, 0.2, 0.1]], &device());
        let t = Tensor::<B, 2>::from_floats([[1.0, 0.0, 0.0]], &device());
        let w = Tensor::<B, 1>::from_floats([1.0], &device());
        let loss = weighted_loss(LossKind::CategoricalCrossentropy, p, t, w).into_scalar();
        assert!((loss - (-0.7f32.ln())).abs() < 1e-5);
    }

    #[test]
    fn test_mean_squared_error() {
        let p = Tensor::<B, 2>::from_floats([[0.5], [1.0]], &device());
        let t = Tensor::<B, 2>::from_floats([[0.0], [1.0]], &device());
        let w = Tensor::<B, 1>::from_floats([1.0, 1.0], &device());
        let loss = weighted_loss(LossKind::MeanSquaredError, p, t, w).into_scalar();
        assert!((loss - 0.125).abs() < 1e-6);
    }
}
