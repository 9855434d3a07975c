use std::path::Path;

use image::{
    imageops::{self, FilterType},
    ImageBuffer, Luma, RgbImage,
};
use ndarray::prelude::*;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::Session,
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::info;

use crate::{
    adapter::{tensor_to_image, FaceData, SegmentationBackend, SegmentationResult},
    errors::{Result, SeasonError},
    governor::ReleaseCache,
    normalizer::image_to_tensor,
};

fn model_error(operation: &str, err: impl std::fmt::Display) -> SeasonError {
    SeasonError::Model {
        operation: operation.to_string(),
        source: err.to_string().into(),
    }
}

/// Face-parsing network exported to ONNX, used in place of the color
/// segmenter when precision matters more than memory.
pub struct OnnxFaceParser {
    pub image_size: u32,
    label_names: Vec<String>,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl OnnxFaceParser {
    pub fn new(model_path: &Path, device_id: i32, label_names: Vec<String>) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| model_error("session builder", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| model_error("execution providers", e))?
            .with_memory_pattern(true)
            .map_err(|e| model_error("memory pattern", e))?
            .commit_from_file(model_path)
            .map_err(|e| model_error(&format!("face parser load: {}", model_path.display()), e))?;

        let input = session.inputs.first().ok_or_else(|| SeasonError::Configuration {
            message: "face parser declares no inputs".to_string(),
        })?;
        let image_size = input
            .input_type
            .tensor_shape()
            .and_then(|shape| shape.get(2).copied())
            .filter(|side| *side > 0)
            .ok_or_else(|| SeasonError::Configuration {
                message: "face parser input must have a fixed spatial size".to_string(),
            })? as u32;
        let input_name = input.name.clone();
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| SeasonError::Configuration {
                message: "face parser declares no outputs".to_string(),
            })?;

        info!(
            path = %model_path.display(),
            image_size,
            classes = label_names.len(),
            "face parser loaded"
        );

        Ok(Self {
            image_size,
            label_names,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }

    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<Array4<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned())
    }
}

impl ReleaseCache for OnnxFaceParser {}

impl SegmentationBackend for OnnxFaceParser {
    fn forward(&self, images: ArrayViewD<'_, f32>, mut data: FaceData) -> Result<FaceData> {
        let image = tensor_to_image(images)?;
        let (width, height) = image.dimensions();
        let (padded, crop) = letterbox(&image, self.image_size);
        drop(image);

        let input = image_to_tensor(&padded);
        drop(padded);
        let logits = self.predict(input.view())?;
        drop(input);

        let classes = logits.shape()[1];
        if classes != self.label_names.len() {
            return Err(SeasonError::validation(
                "label_names",
                format!(
                    "has {} entries but the parser emits {classes} classes",
                    self.label_names.len()
                ),
            ));
        }

        let restored = restore_logits(
            logits.index_axis(Axis(0), 0),
            crop,
            self.image_size,
            width,
            height,
        )?;
        data.seg = Some(SegmentationResult::new(
            restored.insert_axis(Axis(0)),
            self.label_names.clone(),
        )?);
        Ok(data)
    }
}

/// Fit the image inside a `size` square, centered on black.
/// Returns the canvas and the placed region as `[x, y, w, h]`.
pub fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, [u32; 4]) {
    let (width, height) = image.dimensions();
    let scale = size as f32 / width.max(height).max(1) as f32;
    let w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let h = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = imageops::resize(image, w, h, FilterType::Lanczos3);
    let (x, y) = ((size - w) / 2, (size - h) / 2);
    let mut canvas = RgbImage::new(size, size);
    imageops::overlay(&mut canvas, &resized, i64::from(x), i64::from(y));
    (canvas, [x, y, w, h])
}

/// Map a region of the `input_size` square onto a `cols` x `rows` plane.
/// Parsers may emit logits at a coarser stride than their input.
fn scale_crop(crop: [u32; 4], input_size: u32, cols: usize, rows: usize) -> Result<[u32; 4]> {
    if input_size == 0 || cols == 0 || rows == 0 {
        return Err(SeasonError::validation(
            "logits",
            format!("plane is {cols}x{rows} for a {input_size} input"),
        ));
    }
    let (cols, rows) = (cols as u32, rows as u32);
    let scale = |v: u32, extent: u32| (u64::from(v) * u64::from(extent) / u64::from(input_size)) as u32;

    let [x, y, w, h] = crop;
    let x0 = scale(x, cols).min(cols - 1);
    let y0 = scale(y, rows).min(rows - 1);
    let x1 = scale(x + w, cols).clamp(x0 + 1, cols);
    let y1 = scale(y + h, rows).clamp(y0 + 1, rows);
    Ok([x0, y0, x1 - x0, y1 - y0])
}

/// Crop each class plane back to the placed region and resize it to the
/// source extent. `crop` is in coordinates of the `input_size` square.
pub fn restore_logits(
    logits: ArrayView3<f32>,
    crop: [u32; 4],
    input_size: u32,
    width: u32,
    height: u32,
) -> Result<Array3<f32>> {
    let (classes, rows, cols) = logits.dim();
    let [x, y, w, h] = scale_crop(crop, input_size, cols, rows)?;
    let mut restored = Array3::<f32>::zeros((classes, height as usize, width as usize));

    for (plane, mut target) in logits
        .axis_iter(Axis(0))
        .zip(restored.axis_iter_mut(Axis(0)))
    {
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(cols as u32, rows as u32, plane.iter().copied().collect())
                .ok_or_else(|| SeasonError::validation("logits", "plane size mismatch"))?;
        let cropped = imageops::crop_imm(&buffer, x, y, w, h).to_image();
        let resized = imageops::resize(&cropped, width, height, FilterType::Triangle);
        for (px, py, Luma([v])) in resized.enumerate_pixels() {
            target[[py as usize, px as usize]] = *v;
        }
    }
    Ok(restored)
}
