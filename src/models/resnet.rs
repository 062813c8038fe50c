use std::path::Path;

use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2d;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::MaxPool2d;
use burn::nn::pool::MaxPool2dConfig;
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::{
    module::Module,
    tensor::{Tensor, activation::relu, backend::Backend},
};
use log::{info, warn};

use crate::config::BackboneKind;
use crate::error::Result;
use crate::init::KAIMING_FAN_OUT;
use crate::weights::load_record;

/// torchvision state dict keys → field names of [`ResNet`].
const TORCHVISION_KEY_REMAP: [(&str, &str); 3] = [
    (r"^layer([1-4])\.([0-9]+)\.", "layer$1.blocks.$2."),
    (r"\.downsample\.0\.", ".downsample.conv."),
    (r"\.downsample\.1\.", ".downsample.bn."),
];

/// Deep residual backbone truncated before the classifier.
///
/// “Deep Residual Learning for Image Recognition”
/// Authors: Kaiming He, Xiangyu Zhang, Shaoqing Ren, Jian Sun
/// Link (official): https://arxiv.org/abs/1512.03385
///
/// Table 1: architectures for ImageNet. Building blocks are shown in brackets, with the
/// numbers of blocks stacked. Downsampling is performed by conv3_1, conv4_1, and conv5_1
/// with a stride of 2.
///
///   layer name | 18-layer      | 50-layer
///   -----------+---------------+-------------------
///   conv1      | 7x7, 64, stride 2
///   conv2_x    | 3x3 max pool, stride 2
///              | [3x3, 64] x2  | [1x1, 64; 3x3, 64; 1x1, 256] x3
///   conv3_x    | [3x3, 128] x2 | [1x1, 128; 3x3, 128; 1x1, 512] x4
///   conv4_x    | [3x3, 256] x2 | [1x1, 256; 3x3, 256; 1x1, 1024] x6
///   conv5_x    | [3x3, 512] x2 | [1x1, 512; 3x3, 512; 1x1, 2048] x3
///
/// The outputs of conv3_x, conv4_x and conv5_x (`C3`, `C4`, `C5`) feed the pyramid neck.
/// Field names follow torchvision so its `.pth` checkpoints load with a small key remap.
///
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    maxpool: MaxPool2d,
    layer1: LayerBlock<B>,
    layer2: LayerBlock<B>,
    layer3: LayerBlock<B>,
    layer4: LayerBlock<B>,
}

impl<B: Backend> ResNet<B> {
    /// Builds the backbone and, when `weights` is given, loads the pretrained parameters.
    pub fn new(kind: BackboneKind, weights: Option<&str>, device: &B::Device) -> Result<Self> {
        let resnet = Self::init(kind, device);

        match weights {
            Some(file) => {
                info!("Loading pretrained {kind:?} backbone weights from {file}");
                let record = load_record::<B, ResNetRecord<B>>(
                    Path::new(file),
                    &TORCHVISION_KEY_REMAP,
                    device,
                )?;
                Ok(resnet.load_record(record))
            }
            None => {
                warn!("No pretrained backbone weights configured, {kind:?} starts from random init");
                Ok(resnet)
            }
        }
    }

    /// Builds a randomly initialized backbone.
    pub fn init(kind: BackboneKind, device: &B::Device) -> Self {
        // 7x7 - conv1: 64, stride 2
        let conv1 = conv(3, 64, 7, 2, 3, device);
        let bn1 = BatchNormConfig::new(64).init(device);

        // 3x3 - max pool, stride 2
        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let [d1, d2, d3, d4] = kind.stage_depths();
        let e = kind.expansion();

        let layer1 = LayerBlock::new(kind, d1, 64, 64, 1, device);
        let layer2 = LayerBlock::new(kind, d2, 64 * e, 128, 2, device);
        let layer3 = LayerBlock::new(kind, d3, 128 * e, 256, 2, device);
        let layer4 = LayerBlock::new(kind, d4, 256 * e, 512, 2, device);

        Self {
            conv1,
            bn1,
            maxpool,
            layer1,
            layer2,
            layer3,
            layer4,
        }
    }

    /// Returns `(C3, C4, C5)` at strides 8, 16 and 32.
    pub fn forward(&self, input: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let x = self.conv1.forward(input);
        let x = relu(self.bn1.forward(x));
        let x = self.maxpool.forward(x);

        let x = self.layer1.forward(x);
        let c3 = self.layer2.forward(x);
        let c4 = self.layer3.forward(c3.clone());
        let c5 = self.layer4.forward(c4.clone());

        (c3, c4, c5)
    }
}

/// One stage of stacked residual blocks; only the first block changes stride and width.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    pub(crate) blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub(crate) fn new(
        kind: BackboneKind,
        depth: usize,
        in_channels: usize,
        width: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let out_channels = width * kind.expansion();
        let blocks = (0..depth)
            .map(|i| {
                if i == 0 {
                    ResidualBlock::new(kind, in_channels, width, stride, device)
                } else {
                    ResidualBlock::new(kind, out_channels, width, 1, device)
                }
            })
            .collect();

        Self { blocks }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |x, block| block.forward(x))
    }
}

/// Basic (two 3x3) or bottleneck (1x1, 3x3, 1x1) residual block.
///
/// `conv3`/`bn3` are only present for bottleneck blocks, which puts the stride on the 3x3
/// convolution as torchvision does.
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub(crate) conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Option<Conv2d<B>>,
    bn3: Option<BatchNorm<B, 2>>,
    pub(crate) downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn new(
        kind: BackboneKind,
        in_channels: usize,
        width: usize,
        stride: usize,
        device: &B::Device,
    ) -> Self {
        let out_channels = width * kind.expansion();

        let downsample = if stride != 1 || in_channels != out_channels {
            Some(Downsample::new(in_channels, out_channels, stride, device))
        } else {
            None
        };

        if kind.is_bottleneck() {
            Self {
                conv1: conv(in_channels, width, 1, 1, 0, device),
                bn1: BatchNormConfig::new(width).init(device),
                conv2: conv(width, width, 3, stride, 1, device),
                bn2: BatchNormConfig::new(width).init(device),
                conv3: Some(conv(width, out_channels, 1, 1, 0, device)),
                bn3: Some(BatchNormConfig::new(out_channels).init(device)),
                downsample,
            }
        } else {
            Self {
                conv1: conv(in_channels, width, 3, stride, 1, device),
                bn1: BatchNormConfig::new(width).init(device),
                conv2: conv(width, width, 3, 1, 1, device),
                bn2: BatchNormConfig::new(width).init(device),
                conv3: None,
                bn3: None,
                downsample,
            }
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(input.clone()),
            None => input.clone(),
        };

        let x = relu(self.bn1.forward(self.conv1.forward(input)));
        let x = self.bn2.forward(self.conv2.forward(x));

        let x = match (&self.conv3, &self.bn3) {
            (Some(conv3), Some(bn3)) => bn3.forward(conv3.forward(relu(x))),
            _ => x,
        };

        relu(x + identity)
    }
}

/// 1x1 projection of the shortcut when a block changes stride or width.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    pub(crate) conv: Conv2d<B>,
    pub(crate) bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv(in_channels, out_channels, 1, stride, 0, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(input))
    }
}

fn conv<B: Backend>(
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    device: &B::Device,
) -> Conv2d<B> {
    Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .with_initializer(KAIMING_FAN_OUT)
        .init(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::PyramidLevel;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};
    use std::path::PathBuf;

    type B = NdArray<f32>;

    /// Just `layer2` of a torchvision ResNet, one 2 -> 4 channel block at stride 2.
    #[derive(Module, Debug)]
    struct TorchvisionStage<B: Backend> {
        layer2: LayerBlock<B>,
    }

    fn fixture(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
    }

    // Values written by tests/fixtures/make_remap_fixtures.py
    fn ramp(base: f32, len: usize) -> Vec<f32> {
        (0..len).map(|i| base + 0.25 * i as f32).collect()
    }

    fn values<const D: usize>(t: Tensor<B, D>) -> Vec<f32> {
        t.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn resnet18_feature_shapes() {
        let device = NdArrayDevice::default();
        let resnet: ResNet<B> = ResNet::init(BackboneKind::ResNet18, &device);
        let input = Tensor::<B, 4>::ones([2, 3, 64, 64], &device);

        let (c3, c4, c5) = resnet.forward(input);

        assert_eq!(c3.dims(), [2, 128, 8, 8]);
        assert_eq!(c4.dims(), [2, 256, 4, 4]);
        assert_eq!(c5.dims(), [2, 512, 2, 2]);
    }

    #[test]
    fn resnet50_feature_shapes_follow_pyramid_grid() {
        let device = NdArrayDevice::default();
        let resnet: ResNet<B> = ResNet::init(BackboneKind::ResNet50, &device);
        let input = Tensor::<B, 4>::zeros([1, 3, 72, 72], &device);

        let (c3, c4, c5) = resnet.forward(input);

        let p3 = PyramidLevel::P3.grid_size(72);
        let p4 = PyramidLevel::P4.grid_size(72);
        let p5 = PyramidLevel::P5.grid_size(72);
        assert_eq!(c3.dims(), [1, 512, p3, p3]);
        assert_eq!(c4.dims(), [1, 1024, p4, p4]);
        assert_eq!(c5.dims(), [1, 2048, p5, p5]);
    }

    #[test]
    fn basic_blocks_have_no_third_conv() {
        let device = NdArrayDevice::default();
        let block: ResidualBlock<B> = ResidualBlock::new(BackboneKind::ResNet34, 64, 64, 1, &device);
        assert!(block.conv3.is_none());
        assert!(block.downsample.is_none());

        let block: ResidualBlock<B> = ResidualBlock::new(BackboneKind::ResNet50, 64, 64, 1, &device);
        assert!(block.conv3.is_some());
        assert!(block.downsample.is_some());
    }

    #[test]
    fn missing_pretrained_file_is_an_error() {
        let device = NdArrayDevice::default();
        let result = ResNet::<B>::new(BackboneKind::ResNet18, Some("does/not/exist.mpk"), &device);
        assert!(result.is_err());
    }

    #[test]
    fn torchvision_checkpoint_keys_are_remapped() {
        let device = NdArrayDevice::default();
        let stage = TorchvisionStage {
            layer2: LayerBlock::new(BackboneKind::ResNet18, 1, 2, 4, 2, &device),
        };

        let record = load_record::<B, <TorchvisionStage<B> as Module<B>>::Record>(
            &fixture("torchvision_stage.pth"),
            &TORCHVISION_KEY_REMAP,
            &device,
        )
        .unwrap();
        let stage = stage.load_record(record);

        let block = &stage.layer2.blocks[0];
        assert_eq!(values(block.conv1.weight.val()), ramp(1.0, 72));

        let downsample = block.downsample.as_ref().unwrap();
        assert_eq!(values(downsample.conv.weight.val()), ramp(3.0, 8));
        assert_eq!(values(downsample.bn.gamma.val()), ramp(300.0, 4));
        assert_eq!(values(downsample.bn.beta.val()), ramp(310.0, 4));
        assert_eq!(values(downsample.bn.running_var.value()), ramp(330.0, 4));
    }
}
