use std::path::Path;

use burn::{
    prelude::Backend,
    tensor::{Device, Tensor, TensorData},
};
use image::{RgbImage, imageops::FilterType};

use crate::error::{M2DetError, Result};

// ImageNet mean and std values

const MEAN: [f64; 3] = [0.485, 0.456, 0.406];
const STD: [f64; 3] = [0.229, 0.224, 0.225];

#[derive(Clone)]
pub struct ImageNormalizer<B: Backend> {
    pub mean: Tensor<B, 3>,
    pub std: Tensor<B, 3>,
}

impl<B: Backend> ImageNormalizer<B> {
    /// Creates a new normalizer.
    pub fn new(device: &Device<B>) -> Self {
        let mean = Tensor::<B, 1>::from_floats(MEAN, device).reshape([3, 1, 1]);
        let std = Tensor::<B, 1>::from_floats(STD, device).reshape([3, 1, 1]);
        Self { mean, std }
    }

    /// Normalizes the input image according to the ImageNet dataset.
    ///
    /// The input image should be in the range [0, 1].
    ///
    /// The normalization is done according to the following formula:
    /// `input = (input - mean) / std`
    pub fn normalize(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        (input - self.mean.clone()) / self.std.clone()
    }
}

/// Converts an RGB image to a `(3, H, W)` float tensor with values in `[0, 255]`.
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &Device<B>) -> Tensor<B, 3> {
    let (width, height) = image.dimensions();
    let data = TensorData::new(
        image.as_raw().iter().map(|p| *p as f32).collect::<Vec<f32>>(),
        [height as usize, width as usize, 3],
    );

    Tensor::<B, 3>::from_data(data, device).permute([2, 0, 1])
}

/// Loads `path` as a `(1, 3, size, size)` batch ready for the detector.
///
/// The image is resized with bilinear filtering, ignoring its aspect ratio, scaled to
/// `[0, 1]` and normalized with the ImageNet statistics the backbone was trained with.
pub fn load_image<B: Backend>(path: &Path, size: usize, device: &Device<B>) -> Result<Tensor<B, 4>> {
    let image = image::open(path)
        .map_err(|source| M2DetError::Image {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();

    Ok(prepare_image(&image, size, device))
}

/// Resizes and normalizes an already decoded image, see [`load_image`].
pub fn prepare_image<B: Backend>(image: &RgbImage, size: usize, device: &Device<B>) -> Tensor<B, 4> {
    let resized = image::imageops::resize(image, size as u32, size as u32, FilterType::Triangle);
    let tensor = image_to_tensor::<B>(&resized, device).div_scalar(255.0);

    ImageNormalizer::new(device)
        .normalize(tensor)
        .unsqueeze::<4>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::assert_approx_eq;
    use burn::backend::{NdArray, ndarray::NdArrayDevice};
    use image::Rgb;

    type B = NdArray<f32>;

    #[test]
    fn test_image_to_tensor_is_channel_first() {
        let device = NdArrayDevice::default();
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([1, 2, 3]));
        image.put_pixel(1, 0, Rgb([4, 5, 6]));

        let t = image_to_tensor::<B>(&image, &device);
        assert_eq!(t.dims(), [3, 1, 2]);
        assert_eq!(
            t.into_data().to_vec::<f32>().unwrap(),
            vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]
        );
    }

    #[test]
    fn test_prepare_image_resizes_and_normalizes() {
        let device = NdArrayDevice::default();
        let image = RgbImage::from_pixel(40, 30, Rgb([255, 0, 128]));

        let t = prepare_image::<B>(&image, 64, &device);
        assert_eq!(t.dims(), [1, 3, 64, 64]);

        let mean_per_channel = t.mean_dim(3).mean_dim(2).into_data().to_vec::<f32>().unwrap();
        let expected = [
            (1.0 - MEAN[0]) / STD[0],
            (0.0 - MEAN[1]) / STD[1],
            (128.0 / 255.0 - MEAN[2]) / STD[2],
        ];
        for (got, want) in mean_per_channel.iter().zip(expected) {
            assert_approx_eq(got, &(want as f32), 1e-3);
        }
    }

    #[test]
    fn test_load_image_from_disk() {
        let device = NdArrayDevice::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.png");
        RgbImage::from_pixel(10, 10, Rgb([10, 20, 30])).save(&path).unwrap();

        let t = load_image::<B>(&path, 32, &device).unwrap();
        assert_eq!(t.dims(), [1, 3, 32, 32]);

        let missing = load_image::<B>(&dir.path().join("missing.png"), 32, &device);
        assert!(matches!(missing, Err(M2DetError::Image { .. })));
    }
}
