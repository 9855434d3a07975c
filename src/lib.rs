pub mod adapter;
pub mod classifier;
pub mod config;
pub mod errors;
pub mod extraction;
pub mod governor;
pub mod normalizer;
pub mod onnx_parser;
pub mod segmenter;

pub mod mocks;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub use adapter::{FaceData, LightweightFaceParser, SegmentationBackend, SegmentationResult};
pub use classifier::{ClassifierModel, LazyClassifier, OnnxClassifier, Season, SeasonClassifier};
pub use config::{ClassifierConfig, CompressPolicy, Config, ExtractionConfig, SegmenterConfig};
pub use errors::{Result, SeasonError};
pub use extraction::{PixelSet, PixelSource};
pub use governor::{CacheRelease, ReleaseCache, ResourceGovernor};
pub use onnx_parser::OnnxFaceParser;
pub use segmenter::{RegionMask, RegionSegmenter};

/// Everything [`PaletteAnalyzer::analyze`] learns about one photograph.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub season: Season,
    pub pixels: PixelSet,
    /// Selected pixels (255) over the compressed image extent.
    pub mask: GrayImage,
}

/// Lip color extraction and season classification for single photographs.
///
/// Each call is self-contained: the compressed image, tensors and
/// segmentation scores it creates are released when it returns, and the
/// backend is asked to return pooled memory on every exit path.
pub struct PaletteAnalyzer<B: SegmentationBackend, M: ClassifierModel> {
    backend: B,
    classifier: Arc<LazyClassifier<M>>,
    governor: ResourceGovernor,
    compress: CompressPolicy,
    extraction: ExtractionConfig,
}

impl<B: SegmentationBackend, M: ClassifierModel> PaletteAnalyzer<B, M> {
    pub fn new(backend: B, classifier: Arc<LazyClassifier<M>>) -> Self {
        Self {
            backend,
            classifier,
            governor: ResourceGovernor::default(),
            compress: CompressPolicy::default(),
            extraction: ExtractionConfig::default(),
        }
    }

    pub fn with_governor(mut self, governor: ResourceGovernor) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_compress_policy(mut self, compress: CompressPolicy) -> Self {
        self.compress = compress;
        self
    }

    pub fn with_extraction(mut self, extraction: ExtractionConfig) -> Self {
        self.extraction = extraction;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn classifier(&self) -> &LazyClassifier<M> {
        &self.classifier
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    /// RGB triples of the lip region of the image at `path`.
    ///
    /// Decode failures are errors. Segmentation failures are not: they fall
    /// back to the lower part of the image.
    pub fn extract_rgb_codes(&self, path: &Path) -> Result<PixelSet> {
        let bytes = read_image(path)?;
        let (image, seg) = self.segment_bytes(&bytes, path)?;
        drop(bytes);
        extraction::extract_pixels(&image, &seg, &self.extraction)
    }

    /// Season class index of the image at `path`.
    pub fn classify(&self, path: &Path) -> Result<usize> {
        let _stage = self.governor.stage("classify");
        self.classifier.predict(path)
    }

    pub fn analyze(&self, path: &Path) -> Result<Analysis> {
        let bytes = read_image(path)?;

        let (pixels, mask) = {
            let (image, seg) = self.segment_bytes(&bytes, path)?;
            let mask = extraction::selection_mask(&seg, &self.extraction);
            drop(seg);
            (extraction::pixels_under(&image, &mask)?, mask)
        };

        let index = {
            let _stage = self.governor.stage("classify");
            self.classifier.predict_bytes(&bytes, path)?
        };
        let season = Season::from_index(index).ok_or_else(|| SeasonError::Model {
            operation: "classification".to_string(),
            source: format!("class index {index} has no season").into(),
        })?;

        debug!(path = %path.display(), %season, pixels = pixels.len(), "analyzed");
        Ok(Analysis {
            season,
            pixels,
            mask,
        })
    }

    /// Compress, decode and segment. Always yields a result matching the
    /// decoded image extent.
    fn segment_bytes(&self, bytes: &[u8], path: &Path) -> Result<(RgbImage, SegmentationResult)> {
        let _stage = self.governor.stage("segment");
        let _release = CacheRelease::new(&self.backend);

        let image = normalizer::load_compressed(bytes, &self.compress)
            .map_err(|err| attribute_decode(err, path))?;
        let (width, height) = image.dimensions();
        let extent = (height as usize, width as usize);

        let tensor = normalizer::image_to_tensor(&image).into_dyn();
        let forwarded = self.backend.forward(tensor.view(), FaceData::new(vec![0]));
        drop(tensor);

        let seg = match forwarded {
            Ok(FaceData { seg: Some(seg), .. }) if seg.dimensions() == extent => seg,
            Ok(FaceData { seg: Some(seg), .. }) => {
                warn!(
                    path = %path.display(),
                    got = ?seg.dimensions(),
                    expected = ?extent,
                    "segmentation extent mismatch, treating as background"
                );
                SegmentationResult::background(extent.0, extent.1)
            }
            Ok(FaceData { seg: None, .. }) => {
                warn!(path = %path.display(), "backend produced no segmentation");
                SegmentationResult::background(extent.0, extent.1)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "segmentation backend failed");
                SegmentationResult::background(extent.0, extent.1)
            }
        };
        Ok((image, seg))
    }
}

impl<M: ClassifierModel> PaletteAnalyzer<LightweightFaceParser, M> {
    pub fn lightweight(classifier: Arc<LazyClassifier<M>>) -> Self {
        Self::new(LightweightFaceParser::default(), classifier)
    }
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    normalizer::read_file(path)
}

/// Decode errors raised on in-memory buffers name the file they came from.
fn attribute_decode(err: SeasonError, path: &Path) -> SeasonError {
    match err {
        SeasonError::Decode { source, .. } => SeasonError::Decode {
            path: path.to_path_buf(),
            source,
        },
        other => other,
    }
}

/// Write a lip mask, in the format implied by the extension of `path`.
pub fn save_mask(mask: &GrayImage, path: &Path) -> Result<()> {
    let format = ImageFormat::from_path(path).map_err(|e| SeasonError::Validation {
        field: "mask path".to_string(),
        reason: e.to_string(),
    })?;
    let image = DynamicImage::ImageLuma8(mask.clone());
    // the WebP encoder only takes RGB(A)
    let image = match format {
        ImageFormat::WebP => DynamicImage::ImageRgb8(image.into_rgb8()),
        _ => image,
    };
    image
        .save_with_format(path, format)
        .map_err(|e| SeasonError::Model {
            operation: format!("mask save: {}", path.display()),
            source: Box::new(e),
        })
}

pub fn is_supported_image_format(path: &Path) -> bool {
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        matches!(
            extension.to_lowercase().as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "gif" | "tiff"
        )
    } else {
        false
    }
}

pub fn get_relative_path(input_dir: &Path, input_file: &Path) -> Result<PathBuf> {
    input_file
        .strip_prefix(input_dir)
        .map(|p| p.to_path_buf())
        .map_err(|_| SeasonError::FileSystem {
            path: input_file.to_path_buf(),
            operation: "relative path".to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "input file is not inside the input directory",
            ),
        })
}
