use burn::tensor::{Tensor, backend::Backend};
use log::trace;
use num::Float;

/// Logs the shape of `tensor` under `name` at trace level.
pub fn trace_shape<B: Backend, const D: usize>(name: &str, tensor: &Tensor<B, D>) {
    trace!("{name}: {:?}", tensor.dims());
}

// Helper function for comparing floats
pub fn assert_approx_eq<F>(a: &F, b: &F, epsilon: F)
where
    F: Float + std::fmt::Display + std::fmt::Debug,
{
    assert!(
        (*a - *b).abs() <= epsilon,
        "Values differ: {:?} vs {:?} (tolerance: {:?})",
        *a,
        *b,
        epsilon
    );
}
