use crate::config::ANCHORS_PER_CELL;

/// Pyramid levels the detector predicts from.
///
/// Each variant is one output of the neck, listed from the highest resolution (`P3`, stride 8)
/// to the lowest (`P7`, stride 128). Predictions are concatenated in this order, so the first
/// `PyramidLevel::P3.anchors(size)` anchors of every image always come from `P3`.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyramidLevel {
    /// `P3`: projected `C3`, the only level passed through batch normalization.
    P3,
    /// `P4`: projected `C4` plus the upsampled `P5`.
    P4,
    /// `P5`: projected `C5`.
    P5,
    /// `P6`: stride 2 convolution on `P5` (or `C5`).
    P6,
    /// `P7`: stride 2 convolution on `relu(P6)`.
    P7,
}

impl PyramidLevel {
    /// Returns all levels in prediction order.
    pub fn as_list() -> Vec<PyramidLevel> {
        vec![
            PyramidLevel::P3,
            PyramidLevel::P4,
            PyramidLevel::P5,
            PyramidLevel::P6,
            PyramidLevel::P7,
        ]
    }

    /// Number of levels, and therefore of location and classification heads.
    pub fn count() -> usize {
        Self::as_list().len()
    }

    /// Position of the level in the prediction order.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Number of stride 2 stages between the input image and this level.
    pub fn downsamplings(&self) -> u32 {
        self.index() as u32 + 3
    }

    /// Nominal stride of the level with respect to the input image.
    pub fn stride(&self) -> usize {
        1 << self.downsamplings()
    }

    /// Side of the square feature map this level produces for a square `input_size` image.
    ///
    /// Every stride 2 stage of the network (stem convolution, stem pooling, stage transitions
    /// and the `P6`/`P7` convolutions) uses padding that maps a side of `n` to `ceil(n / 2)`.
    pub fn grid_size(&self, input_size: usize) -> usize {
        (0..self.downsamplings()).fold(input_size, |n, _| n.div_ceil(2))
    }

    /// Anchors predicted on this level for a square `input_size` image.
    pub fn anchors(&self, input_size: usize) -> usize {
        let side = self.grid_size(input_size);
        side * side * ANCHORS_PER_CELL
    }
}

/// Total anchors predicted across all levels for a square `input_size` image.
pub fn anchor_count(input_size: usize) -> usize {
    PyramidLevel::as_list()
        .iter()
        .map(|level| level.anchors(input_size))
        .sum()
}
