pub mod config;
pub mod debug;
pub mod error;
pub mod inference;
pub mod init;
pub mod layers;
pub mod models;
pub mod preprocess;
pub mod weights;

pub use config::{BackboneKind, M2DetConfig, Phase};
pub use error::{M2DetError, Result};
pub use models::m2det::{Detections, M2Det, build_net};
