use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2d;
use burn::nn::conv::Conv2dConfig;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};
use burn::{
    module::Module,
    tensor::{Tensor, activation::relu, backend::Backend},
};

use crate::init::{KAIMING_UNIFORM_A1, zero_bias};

/// Feature pyramid neck producing `P3..P7` with `planes` channels each.
///
/// “Feature Pyramid Networks for Object Detection”
/// Authors: Tsung-Yi Lin, Piotr Dollár, Ross Girshick, Kaiming He, Bharath Hariharan,
///          Serge Belongie
/// Link (official): https://arxiv.org/abs/1612.03144
///
/// `C3..C5` are projected with 1x1 convolutions, merged top-down with nearest neighbour
/// upsampling, and smoothed with 3x3 convolutions. Two extra stride 2 convolutions add `P6`
/// and `P7` for large objects, as in RetinaNet and FCOS.
///
#[derive(Module, Debug)]
pub struct Fpn<B: Backend> {
    prj_5: Conv2d<B>,
    prj_4: Conv2d<B>,
    prj_3: Conv2d<B>,
    conv_5: Conv2d<B>,
    conv_4: Conv2d<B>,
    conv_3: Conv2d<B>,
    conv_out6: Conv2d<B>,
    conv_out7: Conv2d<B>,
    use_p5: bool,
}

impl<B: Backend> Fpn<B> {
    /// `in_channels` are the `C3`, `C4` and `C5` widths of the backbone.
    pub fn new(in_channels: [usize; 3], planes: usize, use_p5: bool, device: &B::Device) -> Self {
        let [c3, c4, c5] = in_channels;

        // 1x1 lateral projections
        let prj_5 = conv(c5, planes, 1, 1, 0, device);
        let prj_4 = conv(c4, planes, 1, 1, 0, device);
        let prj_3 = conv(c3, planes, 1, 1, 0, device);

        // 3x3 smoothing after the top-down merge
        let conv_5 = conv(planes, planes, 3, 1, 1, device);
        let conv_4 = conv(planes, planes, 3, 1, 1, device);
        let conv_3 = conv(planes, planes, 3, 1, 1, device);

        // P6 from P5 or from the raw C5, P7 from relu(P6)
        let p6_in = if use_p5 { planes } else { c5 };
        let conv_out6 = conv(p6_in, planes, 3, 2, 1, device);
        let conv_out7 = conv(planes, planes, 3, 2, 1, device);

        Self {
            prj_5,
            prj_4,
            prj_3,
            conv_5,
            conv_4,
            conv_3,
            conv_out6,
            conv_out7,
            use_p5,
        }
    }

    /// Returns `[P3, P4, P5, P6, P7]`, highest resolution first.
    pub fn forward(&self, c3: Tensor<B, 4>, c4: Tensor<B, 4>, c5: Tensor<B, 4>) -> [Tensor<B, 4>; 5] {
        let p5 = self.prj_5.forward(c5.clone());
        let p4 = self.prj_4.forward(c4);
        let p3 = self.prj_3.forward(c3);

        let p4 = p4.clone() + upsample_like(p5.clone(), &p4);
        let p3 = p3.clone() + upsample_like(p4.clone(), &p3);

        let p3 = self.conv_3.forward(p3);
        let p4 = self.conv_4.forward(p4);
        let p5 = self.conv_5.forward(p5);

        let p6 = if self.use_p5 {
            self.conv_out6.forward(p5.clone())
        } else {
            self.conv_out6.forward(c5)
        };
        let p7 = self.conv_out7.forward(relu(p6.clone()));

        [p3, p4, p5, p6, p7]
    }
}

/// Nearest neighbour resize of `source` to the spatial size of `target`.
fn upsample_like<B: Backend>(source: Tensor<B, 4>, target: &Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = target.dims();
    interpolate(
        source,
        [height, width],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let conv = Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_initializer(KAIMING_UNIFORM_A1)
        .init(device);
    zero_bias(conv)
}
