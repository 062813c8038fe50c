use std::f64::consts::SQRT_2;

use burn::{
    nn::{BatchNorm, Initializer, conv::Conv2d},
    tensor::{Tensor, backend::Backend},
};

/// Initializer used for the residual backbone and the prediction heads: Kaiming normal scaled
/// by the fan-out of the convolution, with the ReLU gain.
pub const KAIMING_FAN_OUT: Initializer = Initializer::KaimingNormal {
    gain: SQRT_2,
    fan_out_only: true,
};

/// Initializer used by the pyramid neck: Kaiming uniform with `a = 1`, scaled by the fan-in.
pub const KAIMING_UNIFORM_A1: Initializer = Initializer::KaimingUniform {
    gain: 1.0,
    fan_out_only: false,
};

/// Per layer type weight initialization policy.
///
/// - convolution weights: [`KAIMING_FAN_OUT`]
/// - batch-norm weights: `1`
/// - every bias: `0`
pub trait WeightsInit {
    fn init_weights(self) -> Self;
}

impl<B: Backend> WeightsInit for Conv2d<B> {
    fn init_weights(mut self) -> Self {
        let weight = self.weight.val();
        let device = weight.device();
        let [out_channels, in_channels, kernel_h, kernel_w] = weight.dims();
        let receptive_field = kernel_h * kernel_w;

        self.weight = KAIMING_FAN_OUT.init_with(
            [out_channels, in_channels, kernel_h, kernel_w],
            Some(in_channels * receptive_field),
            Some(out_channels * receptive_field),
            &device,
        );

        zero_bias(self)
    }
}

impl<B: Backend> WeightsInit for BatchNorm<B, 2> {
    fn init_weights(mut self) -> Self {
        self.gamma = self.gamma.map(|gamma| gamma.ones_like());
        self.beta = self.beta.map(|beta| beta.zeros_like());
        self
    }
}

impl<T: WeightsInit> WeightsInit for Vec<T> {
    fn init_weights(self) -> Self {
        self.into_iter().map(WeightsInit::init_weights).collect()
    }
}

/// Sets the bias of `conv`, when it has one, to zero.
pub fn zero_bias<B: Backend>(mut conv: Conv2d<B>) -> Conv2d<B> {
    conv.bias = conv
        .bias
        .map(|bias| bias.map(|b: Tensor<B, 1>| b.zeros_like()));
    conv
}

/// Replaces `param` by a tensor of the same shape filled with `value`.
#[cfg(test)]
pub(crate) fn fill<B: Backend, const D: usize>(
    param: burn::module::Param<Tensor<B, D>>,
    value: f32,
) -> burn::module::Param<Tensor<B, D>> {
    param.map(|t| t.zeros_like().add_scalar(value))
}
