use std::path::{Path, PathBuf};

use burn::module::Ignored;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::Conv2d;
use burn::nn::conv::Conv2dConfig;
use burn::nn::{BatchNorm, BatchNormConfig};
use burn::{
    module::Module,
    tensor::{Tensor, activation::softmax, backend::Backend},
};
use log::info;
use serde_json::{Map, Value};

use crate::config::{
    ANCHORS_PER_CELL, BOX_COORDS, M2DetConfig, NORM_CHANNELS, Phase, check_size,
};
use crate::debug::trace_shape;
use crate::error::Result;
use crate::init::WeightsInit;
use crate::layers::PyramidLevel;
use crate::models::fpn::Fpn;
use crate::models::resnet::ResNet;
use crate::weights::{load_record, save_module};

/// Maps a PyTorch M2Det state dict onto [`M2Det`]: the normalization layer is called `Norm`
/// there.
const STATE_DICT_KEY_REMAP: [(&str, &str); 4] = [
    (r"^Norm\.", "norm."),
    (r"^base\.layer([1-4])\.([0-9]+)\.", "base.layer$1.blocks.$2."),
    (r"\.downsample\.0\.", ".downsample.conv."),
    (r"\.downsample\.1\.", ".downsample.bn."),
];

/// Output of one forward pass. The variant is fixed by the [`Phase`] the model was built with.
#[derive(Debug, Clone)]
pub enum Detections<B: Backend> {
    /// Raw scores: `loc` is `(N, A, 4)`, `conf` is `(N, A, C)`.
    Train { loc: Tensor<B, 3>, conf: Tensor<B, 3> },
    /// `loc` is `(N, A, 4)`, `conf` is `(N * A, C)` with each row summing to one.
    Test { loc: Tensor<B, 3>, conf: Tensor<B, 2> },
}

impl<B: Backend> Detections<B> {
    /// Box offsets, `(N, A, 4)` in both phases.
    pub fn loc(&self) -> &Tensor<B, 3> {
        match self {
            Detections::Train { loc, .. } | Detections::Test { loc, .. } => loc,
        }
    }
}

/// “M2Det: A Single-Shot Object Detector based on Multi-Level Feature Pyramid Network”
/// Authors: Qijie Zhao, Tao Sheng, Yongtao Wang, Zhi Tang, Ying Chen, Ling Cai, Haibin Ling
/// Link (official): https://arxiv.org/abs/1811.04533
///
/// This variant replaces the thinned U-shaped modules with a ResNet backbone and an FPN neck.
/// Five pyramid levels each get a location head and a classification head predicting
/// [`ANCHORS_PER_CELL`] anchors per cell.
///
#[derive(Module, Debug)]
pub struct M2Det<B: Backend> {
    pub base: ResNet<B>,
    pub fpn: Fpn<B>,
    /// Applied to `P3` only; the lower resolution levels go to their heads unnormalized.
    pub norm: BatchNorm<B, 2>,
    pub loc: Vec<Conv2d<B>>,
    pub conf: Vec<Conv2d<B>>,
    num_classes: usize,
    size: usize,
    phase: Ignored<Phase>,
}

impl<B: Backend> M2Det<B> {
    /// Builds every layer of the detector. `size` is recorded but not validated here, see
    /// [`build_net`].
    pub fn new(phase: Phase, size: usize, config: &M2DetConfig, device: &B::Device) -> Result<Self> {
        info!("===> Constructing M2Det model");

        let base = ResNet::new(config.backbone, config.backbone_weights.as_deref(), device)?;
        let fpn = Fpn::new(
            config.backbone.feature_channels(),
            config.planes,
            config.use_p5,
            device,
        );
        let norm = BatchNormConfig::new(NORM_CHANNELS).init(device);

        let mut loc = Vec::new();
        let mut conf = Vec::new();

        for _level in PyramidLevel::as_list() {
            loc.push(head(config.planes, BOX_COORDS * ANCHORS_PER_CELL, device));
            conf.push(head(
                config.planes,
                config.num_classes * ANCHORS_PER_CELL,
                device,
            ));
        }

        Ok(Self {
            base,
            fpn,
            norm,
            loc,
            conf,
            num_classes: config.num_classes,
            size,
            phase: Ignored(phase),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase.0
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Runs backbone, neck and heads on a `(N, 3, H, W)` batch.
    ///
    /// Every head output `(N, A_l * K, H_l, W_l)` is permuted to `(N, H_l, W_l, A_l * K)` and
    /// flattened per image, so the anchors of a cell stay contiguous and the levels follow
    /// [`PyramidLevel::as_list`] order once concatenated.
    pub fn forward(&self, input: Tensor<B, 4>) -> Detections<B> {
        let (c3, c4, c5) = self.base.forward(input);
        trace_shape("C5", &c5);

        let [p3, p4, p5, p6, p7] = self.fpn.forward(c3, c4, c5);
        let p3 = self.norm.forward(p3);
        let sources = [p3, p4, p5, p6, p7];

        let mut loc = Vec::with_capacity(sources.len());
        let mut conf = Vec::with_capacity(sources.len());

        for ((source, l), c) in sources.iter().zip(self.loc.iter()).zip(self.conf.iter()) {
            trace_shape("source", source);
            loc.push(flatten_cells(l.forward(source.clone())));
            conf.push(flatten_cells(c.forward(source.clone())));
        }

        let loc = Tensor::cat(loc, 1);
        let conf = Tensor::cat(conf, 1);
        let [batch_size, _] = loc.dims();

        let loc = loc.reshape([batch_size as i32, -1, BOX_COORDS as i32]);

        match self.phase.0 {
            Phase::Test => Detections::Test {
                loc,
                conf: softmax(conf.reshape([-1, self.num_classes as i32]), 1),
            },
            Phase::Train => Detections::Train {
                loc,
                conf: conf.reshape([batch_size as i32, -1, self.num_classes as i32]),
            },
        }
    }

    /// Re-initializes the location and classification heads. The backbone and the neck keep
    /// the initialization they were built with.
    pub fn init_model(mut self) -> Self {
        info!("Initializing weights for [loc, conf]...");
        self.loc = self.loc.init_weights();
        self.conf = self.conf.init_weights();
        self
    }

    /// Replaces every parameter with the ones stored in `file`.
    ///
    /// `.pth` and `.pkl` files are read as PyTorch state dicts, `.mpk` files as records
    /// written by [`M2Det::save_weights`]. Other extensions are rejected before the file is
    /// opened.
    pub fn load_weights(self, file: impl AsRef<Path>, device: &B::Device) -> Result<Self> {
        let file = file.as_ref();
        info!("Loading weights into state dict...");
        let record = load_record::<B, M2DetRecord<B>>(file, &STATE_DICT_KEY_REMAP, device)?;
        let model = self.load_record(record);
        info!("Finished!");
        Ok(model)
    }

    /// Saves every parameter to `file` (extension forced to `.mpk`) and returns the path
    /// written.
    pub fn save_weights(&self, file: impl AsRef<Path>) -> Result<PathBuf> {
        let path = save_module(self.clone(), file.as_ref())?;
        info!("Saved M2Det weights to {}", path.display());
        Ok(path)
    }
}

/// Validates `phase` and `size` before building anything, then installs `config` and builds
/// the detector.
pub fn build_net<B: Backend>(
    phase: &str,
    size: usize,
    config: Option<&Map<String, Value>>,
    device: &B::Device,
) -> Result<M2Det<B>> {
    let phase: Phase = phase.parse()?;

    let size = check_size(size)?;

    let config = M2DetConfig::from_options(config)?;
    M2Det::new(phase, size, &config, device)
}

// 3x3 - stride 1, padding 1 prediction head
fn head<B: Backend>(planes: usize, out_channels: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([planes, out_channels], [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

// (B, K, H, W) -> (B, H, W, K) -> (B, H * W * K)
fn flatten_cells<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch_size, _, _, _] = x.dims();
    x.permute([0, 2, 3, 1]).reshape([batch_size as i32, -1])
}
