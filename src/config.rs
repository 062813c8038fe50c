use std::fmt;
use std::path::Path;
use std::str::FromStr;

use burn::config::Config;
use log::{debug, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use {argh::FromArgs, std::fmt::Debug};

use crate::error::M2DetError;

/// Input resolutions the factory accepts (M2Det320, M2Det512, M2Det704, M2Det800).
pub const SUPPORTED_SIZES: [usize; 4] = [320, 512, 704, 800];

/// Fails with [`M2DetError::UnsupportedSize`] unless `size` is one of [`SUPPORTED_SIZES`].
pub fn check_size(size: usize) -> crate::error::Result<usize> {
    if SUPPORTED_SIZES.contains(&size) {
        Ok(size)
    } else {
        Err(M2DetError::UnsupportedSize(size))
    }
}

/// Anchor boxes predicted for every cell of every pyramid level.
pub const ANCHORS_PER_CELL: usize = 6;

/// Coordinates regressed per anchor box.
pub const BOX_COORDS: usize = 4;

/// Channel count of the normalization applied to the first pyramid level. This is fixed and
/// independent of `planes`.
pub const NORM_CHANNELS: usize = 256;

/// Keys of the option mapping that are installed on [`M2DetConfig`]. Anything else is ignored.
pub const RECOGNIZED_KEYS: [&str; 6] = [
    "planes",
    "num_classes",
    "input_size",
    "backbone",
    "use_p5",
    "backbone_weights",
];

/// ResNet depth used as the feature extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
}

impl BackboneKind {
    /// Residual blocks in each of the four stages.
    pub fn stage_depths(&self) -> [usize; 4] {
        match self {
            BackboneKind::ResNet18 => [2, 2, 2, 2],
            BackboneKind::ResNet34 | BackboneKind::ResNet50 => [3, 4, 6, 3],
            BackboneKind::ResNet101 => [3, 4, 23, 3],
        }
    }

    /// Whether the stages are built from 1x1-3x3-1x1 bottleneck blocks.
    pub fn is_bottleneck(&self) -> bool {
        matches!(self, BackboneKind::ResNet50 | BackboneKind::ResNet101)
    }

    /// Channel multiplier between a block's inner width and its output.
    pub fn expansion(&self) -> usize {
        if self.is_bottleneck() { 4 } else { 1 }
    }

    /// Channels of the `C3`, `C4` and `C5` feature maps handed to the neck.
    pub fn feature_channels(&self) -> [usize; 3] {
        let e = self.expansion();
        [128 * e, 256 * e, 512 * e]
    }
}

/// Hyper parameters of the detector.
///
/// Built either programmatically or from an option mapping through
/// [`M2DetConfig::from_options`], which only installs the keys in [`RECOGNIZED_KEYS`].
#[derive(Config, Debug, PartialEq)]
pub struct M2DetConfig {
    /// Channel width of every pyramid level and the input width of the prediction heads.
    #[config(default = 256)]
    pub planes: usize,
    /// Number of classes scored per anchor, background included.
    #[config(default = 81)]
    pub num_classes: usize,
    /// Resolution used when the caller does not pick one, see [`M2DetConfig::resolve_size`].
    #[config(default = 320)]
    pub input_size: usize,
    #[config(default = "BackboneKind::ResNet50")]
    pub backbone: BackboneKind,
    /// Compute `P6` from the projected `P5` instead of the raw `C5` backbone output.
    #[config(default = true)]
    pub use_p5: bool,
    /// Pretrained backbone weights (`.pth`, `.pkl` or `.mpk`).
    pub backbone_weights: Option<String>,
}

impl M2DetConfig {
    /// Applies the recognized entries of `options` on top of the defaults.
    ///
    /// Fails with [`M2DetError::MissingConfig`] when no mapping is supplied at all. Values are
    /// only checked for their JSON type, ranges are left to the layers that consume them.
    pub fn from_options(options: Option<&Map<String, Value>>) -> crate::error::Result<Self> {
        let options = options.ok_or(M2DetError::MissingConfig)?;
        let mut config = M2DetConfig::new();

        for (key, value) in options {
            match key.as_str() {
                "planes" => config.planes = option_value(key, value)?,
                "num_classes" => config.num_classes = option_value(key, value)?,
                "input_size" => config.input_size = option_value(key, value)?,
                "backbone" => config.backbone = option_value(key, value)?,
                "use_p5" => config.use_p5 = option_value(key, value)?,
                "backbone_weights" => config.backbone_weights = option_value(key, value)?,
                _ => debug!("Ignoring unrecognized config key `{key}`"),
            }
        }

        Ok(config)
    }

    /// Reads a JSON object from `path` and installs it with [`M2DetConfig::from_options`].
    pub fn from_file(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| M2DetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value: Value = serde_json::from_str(&raw).map_err(|source| M2DetError::Json {
            path: path.to_path_buf(),
            source,
        })?;

        match value {
            Value::Object(options) => Self::from_options(Some(&options)),
            _ => Err(M2DetError::NotAnObject(path.to_path_buf())),
        }
    }
}

impl M2DetConfig {
    /// Picks the input resolution: `requested` when given, `input_size` otherwise.
    ///
    /// A request that disagrees with the configured size wins but is logged.
    pub fn resolve_size(&self, requested: Option<usize>) -> crate::error::Result<usize> {
        let size = match requested {
            Some(size) if size != self.input_size => {
                warn!(
                    "Requested size {size} overrides input_size {} from the config",
                    self.input_size
                );
                size
            }
            Some(size) => size,
            None => self.input_size,
        };
        check_size(size)
    }
}

fn option_value<T: DeserializeOwned>(key: &str, value: &Value) -> crate::error::Result<T> {
    serde_json::from_value(value.clone()).map_err(|source| M2DetError::InvalidOption {
        key: key.to_string(),
        source,
    })
}

/// Selected once at construction: `Train` returns raw class scores per batch item, `Test`
/// returns softmax probabilities flattened over the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Test,
}

impl FromStr for Phase {
    type Err = M2DetError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "train" => Ok(Phase::Train),
            "test" => Ok(Phase::Test),
            other => Err(M2DetError::InvalidPhase(other.to_string())),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Test => write!(f, "test"),
        }
    }
}

#[derive(FromArgs, PartialEq, Debug)]
/// Top-level command.
pub struct M2DetCmd {
    #[argh(subcommand)]
    pub commands: Commands,
    #[argh(option, default = "String::from(\"info\")")]
    /// log filter passed to env_logger, e.g. 'debug' or 'm2det=trace'
    pub log_level: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum Commands {
    Summary(SubCommandSummary),
    Init(SubCommandInit),
    Infer(SubCommandInfer),
}

#[derive(FromArgs, PartialEq, Debug)]
/// Build the network and report its parameter count and anchor layout
#[argh(subcommand, name = "summary")]
pub struct SubCommandSummary {
    #[argh(option)]
    /// JSON file with the model options
    pub config: String,
    #[argh(option)]
    /// input resolution, one of 320, 512, 704 or 800 (defaults to input_size of the config)
    pub size: Option<usize>,
    #[argh(option, default = "String::from(\"train\")")]
    /// network phase, 'train' or 'test'
    pub phase: String,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Build the network, initialize the prediction heads and save the weights
#[argh(subcommand, name = "init")]
pub struct SubCommandInit {
    #[argh(option)]
    /// JSON file with the model options
    pub config: String,
    #[argh(option)]
    /// input resolution, one of 320, 512, 704 or 800 (defaults to input_size of the config)
    pub size: Option<usize>,
    #[argh(option)]
    /// output weight file (.mpk)
    pub out: String,
}

#[derive(FromArgs, PartialEq, Debug)]
/// Run the test phase network on a single image
#[argh(subcommand, name = "infer")]
pub struct SubCommandInfer {
    #[argh(option)]
    /// image path to run inference on
    pub image: String,
    #[argh(option)]
    /// JSON file with the model options
    pub config: String,
    #[argh(option)]
    /// input resolution, one of 320, 512, 704 or 800 (defaults to input_size of the config)
    pub size: Option<usize>,
    #[argh(option)]
    /// weight file to load (.pth, .pkl or .mpk)
    pub weights: Option<String>,
    #[argh(option, default = "10")]
    /// number of highest scoring anchors to print
    pub top: usize,
}
