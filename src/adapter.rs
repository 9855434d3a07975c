//! Two-channel segmentation contract shared by every face-parsing backend.
//!
//! A backend receives an NCHW (or CHW) float tensor in [0, 1] and an
//! auxiliary [`FaceData`] record and returns the record with `seg` filled in.
//! Callers depend only on [`SegmentationBackend`], so the color segmenter
//! and an ONNX face parser are interchangeable.

use image::{GrayImage, Rgb, RgbImage};
use ndarray::prelude::*;
use tracing::warn;

use crate::errors::{Result, SeasonError};
use crate::governor::ReleaseCache;
use crate::segmenter::{RegionMask, RegionSegmenter};

/// Size used for the all-background result when the input shape is unknown.
pub const DEFAULT_FALLBACK_SIZE: (usize, usize) = (224, 224);

pub const LIGHTWEIGHT_LABELS: [&str; 2] = ["background", "lips"];

/// Per-pixel class scores over the source image extent.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationResult {
    /// Shape `(1, classes, height, width)`.
    pub logits: Array4<f32>,
    /// One name per class channel.
    pub label_names: Vec<String>,
}

impl SegmentationResult {
    pub fn new(logits: Array4<f32>, label_names: Vec<String>) -> Result<Self> {
        if logits.shape()[1] != label_names.len() {
            return Err(SeasonError::validation(
                "label_names",
                format!(
                    "has {} entries for {} channels",
                    label_names.len(),
                    logits.shape()[1]
                ),
            ));
        }
        Ok(Self {
            logits,
            label_names,
        })
    }

    /// Channel 0 = 1 everywhere: a conservative "nothing found" result.
    pub fn background(height: usize, width: usize) -> Self {
        let mut logits = Array4::<f32>::zeros((1, 2, height, width));
        logits.slice_mut(s![0, 0, .., ..]).fill(1.0);
        Self {
            logits,
            label_names: lightweight_labels(),
        }
    }

    pub fn class_count(&self) -> usize {
        self.logits.shape()[1]
    }

    /// `(height, width)`.
    pub fn dimensions(&self) -> (usize, usize) {
        let shape = self.logits.shape();
        (shape[2], shape[3])
    }

    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.label_names.iter().position(|l| l == label)
    }

    /// Softmax over the class axis.
    pub fn softmax(&self) -> Array3<f32> {
        let logits = self.logits.index_axis(Axis(0), 0);
        let max = logits.fold_axis(Axis(0), f32::NEG_INFINITY, |a, &b| a.max(b));
        let exp = &logits - &max.insert_axis(Axis(0));
        let exp = exp.mapv(f32::exp);
        let sum = exp.sum_axis(Axis(0));
        exp / &sum.insert_axis(Axis(0))
    }

    /// Summed softmax probability of the channels named in `targets`.
    pub fn target_probability<S: AsRef<str>>(&self, targets: &[S]) -> Array2<f32> {
        let probs = self.softmax();
        let (height, width) = self.dimensions();
        let mut total = Array2::<f32>::zeros((height, width));
        let mut indices: Vec<usize> = targets
            .iter()
            .filter_map(|t| self.label_index(t.as_ref()))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        for index in indices {
            total += &probs.index_axis(Axis(0), index);
        }
        total
    }
}

fn lightweight_labels() -> Vec<String> {
    LIGHTWEIGHT_LABELS.iter().map(|s| s.to_string()).collect()
}

/// Auxiliary record threaded through a segmentation backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaceData {
    pub image_ids: Vec<usize>,
    pub seg: Option<SegmentationResult>,
}

impl FaceData {
    pub fn new(image_ids: Vec<usize>) -> Self {
        Self {
            image_ids,
            seg: None,
        }
    }
}

/// Anything that turns an image tensor into a [`SegmentationResult`].
pub trait SegmentationBackend: ReleaseCache + Send + Sync {
    /// `images` is NCHW or CHW, RGB, values in [0, 1].
    fn forward(&self, images: ArrayViewD<'_, f32>, data: FaceData) -> Result<FaceData>;
}

/// Wrap a binary mask as background/lips channels: channel 1 is the mask
/// scaled to [0, 1], channel 0 its complement.
pub fn wrap_mask(mask: &GrayImage) -> SegmentationResult {
    let (width, height) = (mask.width() as usize, mask.height() as usize);
    let mut logits = Array4::<f32>::zeros((1, 2, height, width));
    for (x, y, pixel) in mask.enumerate_pixels() {
        let p = f32::from(pixel[0]) / 255.0;
        logits[[0, 0, y as usize, x as usize]] = 1.0 - p;
        logits[[0, 1, y as usize, x as usize]] = p;
    }
    SegmentationResult {
        logits,
        label_names: lightweight_labels(),
    }
}

/// First image of an NCHW/CHW tensor as RGB bytes.
pub fn tensor_to_image(images: ArrayViewD<'_, f32>) -> Result<RgbImage> {
    let chw = match images.ndim() {
        4 if images.shape()[0] > 0 => images.index_axis_move(Axis(0), 0),
        3 => images,
        _ => {
            return Err(SeasonError::validation(
                "images",
                format!("expected NCHW or CHW tensor, got shape {:?}", images.shape()),
            ))
        }
    };
    let chw = chw.into_dimensionality::<Ix3>()?;
    let (channels, height, width) = chw.dim();
    if channels != 3 {
        return Err(SeasonError::validation(
            "images",
            format!("expected 3 channels, got {channels}"),
        ));
    }

    let to_u8 = |v: f32| (v * 255.0).round().clamp(0.0, 255.0) as u8;
    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            to_u8(chw[[0, y, x]]),
            to_u8(chw[[1, y, x]]),
            to_u8(chw[[2, y, x]]),
        ])
    }))
}

/// Spatial extent of an NCHW/CHW tensor, if it has one.
fn spatial_extent(images: &ArrayViewD<'_, f32>) -> Option<(usize, usize)> {
    let shape = images.shape();
    match shape.len() {
        3 | 4 => Some((shape[shape.len() - 2], shape[shape.len() - 1])),
        _ => None,
    }
}

/// Color-threshold face parser with the two-class background/lips output.
#[derive(Debug, Clone, Default)]
pub struct LightweightFaceParser {
    segmenter: RegionSegmenter,
}

impl LightweightFaceParser {
    pub fn new(segmenter: RegionSegmenter) -> Self {
        Self { segmenter }
    }

    /// Segment a decoded image directly.
    pub fn parse_lips(&self, image: &RgbImage) -> RegionMask {
        self.segmenter.segment(image)
    }

    fn try_forward(&self, images: ArrayViewD<'_, f32>) -> Result<SegmentationResult> {
        let image = tensor_to_image(images)?;
        let region = self.parse_lips(&image);
        let result = wrap_mask(region.mask());

        let (height, width) = result.dimensions();
        if (width as u32, height as u32) != image.dimensions() {
            return Err(SeasonError::validation(
                "mask",
                format!(
                    "is {width}x{height} for a {}x{} image",
                    image.width(),
                    image.height()
                ),
            ));
        }
        Ok(result)
    }
}

impl ReleaseCache for LightweightFaceParser {}

impl SegmentationBackend for LightweightFaceParser {
    fn forward(&self, images: ArrayViewD<'_, f32>, mut data: FaceData) -> Result<FaceData> {
        let extent = spatial_extent(&images);
        let seg = match self.try_forward(images) {
            Ok(seg) => seg,
            Err(err) => {
                let (height, width) = extent.unwrap_or(DEFAULT_FALLBACK_SIZE);
                warn!(error = %err, height, width, "face parser failed, returning all-background result");
                SegmentationResult::background(height, width)
            }
        };
        data.seg = Some(seg);
        Ok(data)
    }
}
