use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, M2DetError>;

/// Everything that can go wrong while configuring, building or loading the detector.
///
/// Tensor shape disagreements are not represented here: they surface as panics from the
/// backend during the forward pass.
#[derive(Debug, Error)]
pub enum M2DetError {
    #[error("no configuration supplied")]
    MissingConfig,
    #[error("invalid value for config key `{key}`: {source}")]
    InvalidOption {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("phase `{0}` not recognized, expected `train` or `test`")]
    InvalidPhase(String),
    #[error("M2Det{0} is not supported, only M2Det320, M2Det512, M2Det704 or M2Det800 are")]
    UnsupportedSize(usize),
    #[error("unsupported weight file {0}, only .pth, .pkl and .mpk files are supported")]
    UnsupportedWeightFile(PathBuf),
    #[error("could not load weights from {path}: {message}")]
    Record { path: PathBuf, message: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not read `{tensor}` tensor data: {message}")]
    TensorData {
        tensor: &'static str,
        message: String,
    },
    #[error("config file {0} does not hold a JSON object")]
    NotAnObject(PathBuf),
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}
