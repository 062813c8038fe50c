use std::cmp::Ordering;
use std::path::Path;

use burn::tensor::{Element, Tensor, TensorData, backend::Backend};
use log::info;

use crate::{
    config::{M2DetConfig, Phase},
    error::{M2DetError, Result},
    models::m2det::{Detections, M2Det},
    preprocess::load_image,
};

/// Best non-background class of one anchor.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchorScore {
    /// Row of the test phase class tensor, i.e. `image * A + anchor`.
    pub anchor: usize,
    pub class_id: usize,
    pub score: f32,
    /// Predicted `(dx, dy, dw, dh)` offsets for the anchor.
    pub offsets: [f32; 4],
}

/// Runs the test phase detector on a single image and returns the `top` anchors with the
/// highest non-background probability.
///
/// # Parameters
/// - `image_path`: image to run on, resized to `size x size`.
/// - `weights_file`: optional `.pth`, `.pkl` or `.mpk` weights; without it the heads are
///   freshly initialized, which is only useful for smoke testing.
///
pub fn infer<B: Backend>(
    image_path: &Path,
    config: &M2DetConfig,
    size: usize,
    weights_file: Option<&Path>,
    top: usize,
    device: &B::Device,
) -> Result<Vec<AnchorScore>> {
    let model = M2Det::<B>::new(Phase::Test, size, config, device)?.init_model();
    let model = match weights_file {
        Some(file) => model.load_weights(file, device)?,
        None => model,
    };

    let image = load_image::<B>(image_path, size, device)?;

    let (loc, conf) = match model.forward(image) {
        Detections::Test { loc, conf } => (loc, conf),
        Detections::Train { .. } => unreachable!("model was built in test phase"),
    };

    let [anchors, classes] = conf.dims();
    let scores = top_anchors(conf, loc.reshape([-1, 4]), top)?;
    info!(
        "Scored {anchors} anchors over {classes} classes, best foreground probability {:.4}",
        scores.first().map(|s| s.score).unwrap_or(0.0)
    );
    Ok(scores)
}

/// Picks the `k` anchors whose best non-background class has the highest probability.
///
/// `conf` is `(anchors, classes)` with class `0` as background, `loc` is `(anchors, 4)`.
/// Scores and offsets are read back as `f32` whatever the backend float type is.
pub fn top_anchors<B: Backend>(
    conf: Tensor<B, 2>,
    loc: Tensor<B, 2>,
    k: usize,
) -> Result<Vec<AnchorScore>> {
    let [anchors, classes] = conf.dims();
    if classes < 2 || anchors == 0 {
        return Ok(Vec::new());
    }

    let (best, best_idx) = conf.slice([0..anchors, 1..classes]).max_dim_with_indices(1);

    let best = tensor_values::<f32>("conf", best.into_data())?;
    let best_idx = tensor_values::<i64>("class index", best_idx.into_data())?;
    let offsets = tensor_values::<f32>("loc", loc.into_data())?;

    let mut order: Vec<usize> = (0..best.len()).collect();
    order.sort_by(|a, b| best[*b].partial_cmp(&best[*a]).unwrap_or(Ordering::Equal));

    Ok(order
        .into_iter()
        .take(k)
        .map(|anchor| AnchorScore {
            anchor,
            class_id: best_idx[anchor] as usize + 1,
            score: best[anchor],
            offsets: [
                offsets[anchor * 4],
                offsets[anchor * 4 + 1],
                offsets[anchor * 4 + 2],
                offsets[anchor * 4 + 3],
            ],
        })
        .collect())
}

fn tensor_values<E: Element>(tensor: &'static str, data: TensorData) -> Result<Vec<E>> {
    data.convert::<E>()
        .to_vec::<E>()
        .map_err(|err| M2DetError::TensorData {
            tensor,
            message: format!("{err:?}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    type B = NdArray<f32>;

    #[test]
    fn test_top_anchors_skips_background() {
        let device = NdArrayDevice::default();
        let conf = Tensor::<B, 2>::from_floats(
            [
                [0.9, 0.05, 0.05],
                [0.1, 0.2, 0.7],
                [0.2, 0.6, 0.2],
            ],
            &device,
        );
        let loc = Tensor::<B, 2>::from_floats(
            [
                [0.0, 0.0, 0.0, 0.0],
                [1.0, 2.0, 3.0, 4.0],
                [5.0, 6.0, 7.0, 8.0],
            ],
            &device,
        );

        let top = top_anchors(conf, loc, 2).unwrap();

        assert_eq!(top.len(), 2);
        assert_eq!(top[0].anchor, 1);
        assert_eq!(top[0].class_id, 2);
        assert_eq!(top[0].offsets, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(top[1].anchor, 2);
        assert_eq!(top[1].class_id, 1);
        assert!((top[1].score - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_top_anchors_needs_a_foreground_class() {
        let device = NdArrayDevice::default();
        let conf = Tensor::<B, 2>::ones([4, 1], &device);
        let loc = Tensor::<B, 2>::zeros([4, 4], &device);
        assert!(top_anchors(conf, loc, 3).unwrap().is_empty());
    }

    #[test]
    fn test_top_anchors_reads_f64_backends() {
        type F64 = NdArray<f64>;
        let device = NdArrayDevice::default();
        let conf = Tensor::<F64, 2>::from_floats([[0.1, 0.9], [0.8, 0.2]], &device);
        let loc = Tensor::<F64, 2>::from_floats(
            [[0.5, 0.25, 1.0, 2.0], [0.0, 0.0, 0.0, 0.0]],
            &device,
        );

        let top = top_anchors(conf, loc, 2).unwrap();

        assert_eq!(top.len(), 2);
        assert_eq!(top[0].anchor, 0);
        assert_eq!(top[0].class_id, 1);
        assert!((top[0].score - 0.9).abs() < 1e-6);
        assert_eq!(top[0].offsets, [0.5, 0.25, 1.0, 2.0]);
        assert_eq!(top[1].anchor, 1);
        assert!((top[1].score - 0.2).abs() < 1e-6);
    }
}
