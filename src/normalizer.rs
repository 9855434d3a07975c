//! Decoding and bounded resizing of input photographs.
//!
//! Every decode goes through [`bounded_limits`], so a malformed or hostile
//! header cannot make the decoder allocate past a fixed budget. Downstream
//! cost is then fixed by one of two policies: "compress" before
//! segmentation and "classifier resize" before classification.

use std::io::Cursor;
use std::path::Path;

use image::{
    codecs::jpeg::JpegEncoder,
    imageops::{self, FilterType},
    DynamicImage, ImageFormat, ImageReader, Limits, Rgb, RgbImage,
};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use tracing::debug;

use crate::config::CompressPolicy;
use crate::errors::{Result, SeasonError};

/// Largest edge the decoder will accept.
pub const MAX_DECODE_DIMENSION: u32 = 16_384;
/// Decoder allocation ceiling in bytes.
pub const MAX_DECODE_ALLOC: u64 = 256 * 1024 * 1024;

pub fn bounded_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DECODE_DIMENSION);
    limits.max_image_height = Some(MAX_DECODE_DIMENSION);
    limits.max_alloc = Some(MAX_DECODE_ALLOC);
    limits
}

/// Decode with an explicit format, or sniff it from the content when `None`.
fn decode_with(bytes: &[u8], format: Option<ImageFormat>, origin: &Path) -> Result<DynamicImage> {
    if bytes.is_empty() {
        return Err(SeasonError::decode(origin, "input is empty"));
    }

    let mut reader = match format {
        Some(format) => ImageReader::with_format(Cursor::new(bytes), format),
        None => ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| SeasonError::decode(origin, e))?,
    };
    reader.limits(bounded_limits());
    reader.decode().map_err(|e| SeasonError::decode(origin, e))
}

/// Decode encoded bytes into an RGB image.
pub fn decode(bytes: &[u8]) -> Result<RgbImage> {
    decode_with(bytes, None, Path::new("<memory>")).map(DynamicImage::into_rgb8)
}

pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| SeasonError::decode(path, e))
}

/// Bound the longer side to `policy.max_side` and re-encode as JPEG.
pub fn compress(bytes: &[u8], policy: &CompressPolicy) -> Result<Vec<u8>> {
    policy.validate()?;
    let image = decode_with(bytes, None, Path::new("<memory>"))?;

    let image = if image.width().max(image.height()) > policy.max_side {
        image.resize(policy.max_side, policy.max_side, FilterType::Lanczos3)
    } else {
        image
    };
    let rgb = image.into_rgb8();

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, policy.quality)
        .encode_image(&rgb)
        .map_err(|e| SeasonError::Model {
            operation: "JPEG encode".to_string(),
            source: Box::new(e),
        })?;

    debug!(
        width = rgb.width(),
        height = rgb.height(),
        bytes = encoded.len(),
        "compressed image"
    );
    Ok(encoded)
}

/// Compress then decode, yielding the image segmentation works on.
pub fn load_compressed(bytes: &[u8], policy: &CompressPolicy) -> Result<RgbImage> {
    let compressed = compress(bytes, policy)?;
    decode(&compressed)
}

/// Force both sides to `size` for the classifier.
///
/// The fast path trusts the format implied by `hint` and downsizes with
/// area averaging. If it rejects the input, the content is sniffed and
/// resized with Lanczos3 instead.
pub fn classifier_resize(bytes: &[u8], hint: &Path, size: u32) -> Result<RgbImage> {
    if bytes.is_empty() {
        return Err(SeasonError::decode(hint, "input is empty"));
    }

    let fast = ImageFormat::from_path(hint)
        .ok()
        .and_then(|format| decode_with(bytes, Some(format), hint).ok());

    match fast {
        Some(image) => Ok(resize_area(&image.into_rgb8(), size, size)),
        None => {
            debug!(path = %hint.display(), "fast decode rejected input, sniffing format");
            let image = decode_with(bytes, None, hint)?.into_rgb8();
            Ok(imageops::resize(&image, size, size, FilterType::Lanczos3))
        }
    }
}

/// For every destination index, the source indices it covers and their weights.
fn area_weights(src: u32, dst: u32) -> Vec<Vec<(u32, f32)>> {
    let scale = f64::from(src) / f64::from(dst);
    (0..dst)
        .map(|i| {
            let start = f64::from(i) * scale;
            let end = (start + scale).min(f64::from(src));
            let first = start.floor() as u32;
            let last = (end.ceil() as u32).min(src);
            (first..last)
                .filter_map(|s| {
                    let overlap = end.min(f64::from(s) + 1.0) - start.max(f64::from(s));
                    (overlap > 1e-9).then_some((s, (overlap / scale) as f32))
                })
                .collect()
        })
        .collect()
}

/// Area-averaging resize; falls back to bilinear when any side grows.
pub fn resize_area(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (src_w, src_h) = image.dimensions();
    if src_w == 0 || src_h == 0 || width == 0 || height == 0 {
        return RgbImage::new(width, height);
    }
    if (src_w, src_h) == (width, height) {
        return image.clone();
    }
    if width > src_w || height > src_h {
        return imageops::resize(image, width, height, FilterType::Triangle);
    }

    let x_weights = area_weights(src_w, width);
    let y_weights = area_weights(src_h, height);

    RgbImage::from_fn(width, height, |x, y| {
        let mut acc = [0f32; 3];
        for &(sy, wy) in &y_weights[y as usize] {
            for &(sx, wx) in &x_weights[x as usize] {
                let Rgb(p) = *image.get_pixel(sx, sy);
                let w = wx * wy;
                for c in 0..3 {
                    acc[c] += f32::from(p[c]) * w;
                }
            }
        }
        Rgb(acc.map(|v| v.round().clamp(0.0, 255.0) as u8))
    })
}

/// NCHW tensor with values in [0, 1].
pub fn image_to_tensor(image: &RgbImage) -> Array4<f32> {
    image
        .as_ndarray3()
        .mapv(|v| f32::from(v) / 255.0)
        .insert_axis(Axis(0))
}
