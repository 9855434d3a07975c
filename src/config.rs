use clap::Parser;
use image::ImageFormat;
use std::path::PathBuf;

use crate::errors::{Result, SeasonError};

/// Longer-side bound applied before segmentation.
pub const DEFAULT_MAX_SIDE: u32 = 600;
pub const DEFAULT_JPEG_QUALITY: u8 = 80;
/// Fixed classifier input edge.
pub const DEFAULT_CLASSIFIER_SIZE: u32 = 160;
pub const DEFAULT_CLASS_COUNT: usize = 4;
/// Probability a pixel needs under the target labels to be extracted.
pub const DEFAULT_LIP_THRESHOLD: f32 = 0.3;
pub const DEFAULT_MEMORY_CEILING_MB: f64 = 500.0;

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Config {
    pub input_dir: PathBuf,

    /// Season classifier checkpoint (ONNX)
    #[arg(short, long, env = "SEASON_MODEL_PATH")]
    pub model_path: PathBuf,

    /// Where lip masks are written; nothing is written when omitted
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Optional ONNX face parser used instead of the color segmenter
    #[arg(long)]
    pub parser_model: Option<PathBuf>,

    /// Label names emitted by --parser-model, in channel order
    #[arg(long, value_delimiter = ',')]
    pub parser_labels: Vec<String>,

    #[arg(short, long, default_value = "png", value_parser = check_format)]
    pub format: String,

    #[arg(short, long, default_value_t = DEFAULT_LIP_THRESHOLD)]
    pub threshold: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_SIDE)]
    pub max_side: u32,

    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    pub quality: u8,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    #[arg(short, long, default_value_t = 1)]
    pub num_threads: usize,

    #[arg(long, default_value_t = DEFAULT_MEMORY_CEILING_MB)]
    pub memory_ceiling_mb: f64,

    /// Enable debug logging (memory samples per stage)
    #[arg(long)]
    pub debug: bool,
}

impl Config {
    pub fn compress_policy(&self) -> CompressPolicy {
        CompressPolicy {
            max_side: self.max_side,
            quality: self.quality,
        }
    }

    pub fn extraction(&self) -> ExtractionConfig {
        ExtractionConfig {
            threshold: self.threshold,
            ..ExtractionConfig::default()
        }
    }
}

/// Formats a lip mask can be written in.
pub const MASK_FORMATS: [ImageFormat; 5] = [
    ImageFormat::Png,
    ImageFormat::Jpeg,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
    ImageFormat::WebP,
];

fn is_mask_format(format: ImageFormat) -> bool {
    format.writing_enabled() && MASK_FORMATS.contains(&format)
}

fn check_format(s: &str) -> std::result::Result<String, String> {
    let supported: Vec<_> = ImageFormat::all()
        .filter(|f| is_mask_format(*f))
        .flat_map(|f| f.extensions_str())
        .map(|s| format!("`{}`", s))
        .collect();
    let supported_message = format!("Supported formats: {}", supported.join(", "));

    let format = ImageFormat::from_extension(s)
        .ok_or(format!("{} is not supported. {}", s, supported_message))?;
    if !is_mask_format(format) {
        return Err(format!("{} is not supported. {}", s, supported_message));
    }

    Ok(s.to_string())
}

/// "compress" policy: bound the longer side and re-encode as JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressPolicy {
    pub max_side: u32,
    pub quality: u8,
}

impl Default for CompressPolicy {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_SIDE,
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl CompressPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_side == 0 {
            return Err(SeasonError::validation("max_side", "must be positive"));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(SeasonError::validation("quality", "must be within 1..=100"));
        }
        Ok(())
    }
}

/// Inclusive HSV box, hue on the 0..=180 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HsvRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl HsvRange {
    pub const fn new(lower: [u8; 3], upper: [u8; 3]) -> Self {
        Self { lower, upper }
    }

    pub fn contains(&self, hsv: [u8; 3]) -> bool {
        (0..3).all(|c| self.lower[c] <= hsv[c] && hsv[c] <= self.upper[c])
    }

    pub fn validate(&self) -> Result<()> {
        if self.upper[0] > 180 {
            return Err(SeasonError::validation("hue", "upper bound exceeds 180"));
        }
        if (0..3).any(|c| self.lower[c] > self.upper[c]) {
            return Err(SeasonError::validation(
                "hsv range",
                format!("lower {:?} exceeds upper {:?}", self.lower, self.upper),
            ));
        }
        Ok(())
    }
}

/// Thresholds for the color segmenter.
///
/// Tuned for reddish lips under ordinary indoor light; other lighting needs
/// re-tuning rather than new code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Hue ranges OR-ed together (red wraps around hue 0).
    pub ranges: Vec<HsvRange>,
    /// Chebyshev radius of the square structuring element (1 = 3x3).
    pub kernel_radius: u8,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            ranges: vec![
                HsvRange::new([0, 50, 50], [10, 255, 255]),
                HsvRange::new([170, 50, 50], [180, 255, 255]),
            ],
            kernel_radius: 1,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ranges.is_empty() {
            return Err(SeasonError::validation("ranges", "at least one range required"));
        }
        self.ranges.iter().try_for_each(HsvRange::validate)
    }
}

/// Preprocessing fixed for the season classifier.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub class_count: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_CLASSIFIER_SIZE,
            mean: [0.5; 3],
            std: [0.5; 3],
            class_count: DEFAULT_CLASS_COUNT,
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        if self.input_size == 0 {
            return Err(SeasonError::validation("input_size", "must be positive"));
        }
        if self.class_count == 0 {
            return Err(SeasonError::validation("class_count", "must be positive"));
        }
        if let Some(s) = self.std.iter().find(|s| **s <= 0.0) {
            return Err(SeasonError::validation(
                "std",
                format!("must be greater than 0, got {s}"),
            ));
        }
        Ok(())
    }
}

/// Labels that count as lips across the supported parsers.
pub const LIP_LABELS: [&str; 5] = ["lips", "ulip", "llip", "u_lip", "l_lip"];

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionConfig {
    pub threshold: f32,
    pub target_labels: Vec<String>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_LIP_THRESHOLD,
            target_labels: LIP_LABELS.iter().map(|s| s.to_string()).collect(),
        }
    }
}
