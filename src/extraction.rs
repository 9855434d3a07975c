use image::{GrayImage, Luma, Rgb, RgbImage};

use crate::adapter::SegmentationResult;
use crate::config::ExtractionConfig;
use crate::errors::{Result, SeasonError};
use crate::segmenter::fallback_start_row;

/// Where the pixels of a [`PixelSet`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelSource {
    Mask,
    /// Nothing passed the threshold; the lower-region rows were used.
    LowerRegion,
}

/// Unordered RGB triples selected from an image.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelSet {
    pub pixels: Vec<[u8; 3]>,
    pub source: PixelSource,
}

impl PixelSet {
    pub fn empty() -> Self {
        Self {
            pixels: Vec::new(),
            source: PixelSource::Mask,
        }
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn is_fallback(&self) -> bool {
        self.source == PixelSource::LowerRegion
    }

    pub fn mean(&self) -> Option<[u8; 3]> {
        if self.pixels.is_empty() {
            return None;
        }
        let mut sum = [0u64; 3];
        for p in &self.pixels {
            for c in 0..3 {
                sum[c] += u64::from(p[c]);
            }
        }
        let n = self.pixels.len() as u64;
        Some(sum.map(|s| ((s + n / 2) / n) as u8))
    }
}

fn lower_region_pixels(image: &RgbImage) -> Vec<[u8; 3]> {
    let start = fallback_start_row(image.height());
    image
        .enumerate_pixels()
        .filter(|(_, y, _)| *y >= start)
        .map(|(_, _, Rgb(p))| *p)
        .collect()
}

/// Binary mask (255 = selected) of the pixels that pass the threshold.
pub fn selection_mask(seg: &SegmentationResult, config: &ExtractionConfig) -> GrayImage {
    let probability = seg.target_probability(&config.target_labels);
    let (height, width) = seg.dimensions();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        if probability[[y as usize, x as usize]] >= config.threshold {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// Raw pixels where `mask` is set, or the lower-region rows when none are.
pub fn pixels_under(image: &RgbImage, mask: &GrayImage) -> Result<PixelSet> {
    if mask.dimensions() != image.dimensions() {
        return Err(SeasonError::validation(
            "mask",
            format!(
                "is {}x{} for a {}x{} image",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            ),
        ));
    }

    let pixels: Vec<[u8; 3]> = image
        .pixels()
        .zip(mask.pixels())
        .filter(|(_, m)| m[0] > 0)
        .map(|(Rgb(p), _)| *p)
        .collect();

    if pixels.is_empty() {
        return Ok(PixelSet {
            pixels: lower_region_pixels(image),
            source: PixelSource::LowerRegion,
        });
    }
    Ok(PixelSet {
        pixels,
        source: PixelSource::Mask,
    })
}

/// Select the raw pixels whose target-label probability reaches the threshold.
pub fn extract_pixels(
    image: &RgbImage,
    seg: &SegmentationResult,
    config: &ExtractionConfig,
) -> Result<PixelSet> {
    let (height, width) = seg.dimensions();
    if (width as u32, height as u32) != image.dimensions() {
        return Err(SeasonError::validation(
            "segmentation",
            format!(
                "is {width}x{height} for a {}x{} image",
                image.width(),
                image.height()
            ),
        ));
    }
    pixels_under(image, &selection_mask(seg, config))
}
