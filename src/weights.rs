use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

use crate::error::{M2DetError, Result};

/// On-disk weight formats the detector can read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// PyTorch state dict saved with `torch.save` (`.pth` or `.pkl`).
    PyTorch,
    /// burn named message pack record (`.mpk`).
    NamedMpk,
}

impl WeightFormat {
    /// Picks the format from the file extension. Unknown extensions are rejected before the
    /// file is opened.
    pub fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("pth") | Some("pkl") => Ok(WeightFormat::PyTorch),
            Some("mpk") => Ok(WeightFormat::NamedMpk),
            _ => Err(M2DetError::UnsupportedWeightFile(path.to_path_buf())),
        }
    }
}

/// Deserializes a record from `path`.
///
/// `key_remap` holds `(pattern, replacement)` regex pairs applied to PyTorch state dict keys
/// so they line up with the module field names. It is ignored for `.mpk` files, which are
/// written by [`save_module`] with the field names already.
pub fn load_record<B: Backend, R: Record<B>>(
    path: &Path,
    key_remap: &[(&str, &str)],
    device: &B::Device,
) -> Result<R> {
    let loaded = match WeightFormat::from_path(path)? {
        WeightFormat::PyTorch => {
            let args = key_remap
                .iter()
                .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
                    args.with_key_remap(pattern, replacement)
                });
            Recorder::<B>::load(
                &PyTorchFileRecorder::<FullPrecisionSettings>::default(),
                args,
                device,
            )
        }
        WeightFormat::NamedMpk => {
            Recorder::<B>::load(
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                path.to_path_buf(),
                device,
            )
        }
    };

    loaded.map_err(|err| M2DetError::Record {
        path: path.to_path_buf(),
        message: format!("{err:?}"),
    })
}

/// Writes `module` to `path` as a full precision named message pack record.
pub fn save_module<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<PathBuf> {
    let mut file = path.to_path_buf();
    file.set_extension("mpk");
    module
        .save_file(file.clone(), &NamedMpkFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|err| M2DetError::Record {
            path: file.clone(),
            message: format!("{err:?}"),
        })?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(
            WeightFormat::from_path(Path::new("m2det.pth")).unwrap(),
            WeightFormat::PyTorch
        );
        assert_eq!(
            WeightFormat::from_path(Path::new("weights/m2det.pkl")).unwrap(),
            WeightFormat::PyTorch
        );
        assert_eq!(
            WeightFormat::from_path(Path::new("m2det.mpk")).unwrap(),
            WeightFormat::NamedMpk
        );
    }

    #[test]
    fn test_unknown_extensions_are_rejected() {
        for name in ["m2det.txt", "m2det", "m2det.pth.bak", "m2det.PTH"] {
            assert!(matches!(
                WeightFormat::from_path(Path::new(name)),
                Err(M2DetError::UnsupportedWeightFile(_))
            ));
        }
    }
}
