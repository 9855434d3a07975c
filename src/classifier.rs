use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use image::RgbImage;
use ndarray::prelude::*;
use nshare::AsNdarray3;
use once_cell::sync::OnceCell;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::Session,
    value::TensorRef,
};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::config::ClassifierConfig;
use crate::errors::{Result, SeasonError};
use crate::governor::{CacheRelease, ReleaseCache};
use crate::normalizer::{classifier_resize, read_file, resize_area};

/// Seasonal skin-tone categories in class-index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Season {
    Autumn,
    Spring,
    Summer,
    Winter,
}

impl Season {
    pub const ALL: [Season; 4] = [Self::Autumn, Self::Spring, Self::Summer, Self::Winter];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Autumn => "autumn",
            Self::Spring => "spring",
            Self::Summer => "summer",
            Self::Winter => "winter",
        }
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index of the first maximum.
pub fn argmax(scores: ArrayView1<f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if best.map_or(true, |(_, b)| score > b) {
            best = Some((index, score));
        }
    }
    best.map(|(index, _)| index)
}

/// A network mapping a normalized NCHW batch to per-class scores `(N, classes)`.
pub trait ClassifierModel: ReleaseCache + Send + Sync {
    fn forward(&self, input: ArrayView4<f32>) -> Result<Array2<f32>>;
}

fn construction_error(path: &Path, operation: &str, err: impl fmt::Display) -> SeasonError {
    SeasonError::Construction {
        path: path.to_path_buf(),
        message: format!("{operation}: {err}"),
    }
}

/// Classifier network loaded from an ONNX checkpoint.
///
/// ONNX Runtime sessions need exclusive access to run, so the forward pass
/// is serialized behind a mutex; decode and preprocessing stay outside it.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    pub fn new(model_path: &Path, device_id: i32, config: &ClassifierConfig) -> Result<Self> {
        if !model_path.is_file() {
            return Err(construction_error(
                model_path,
                "checkpoint lookup",
                "file does not exist",
            ));
        }

        let mut session = Session::builder()
            .map_err(|e| construction_error(model_path, "session builder", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| construction_error(model_path, "execution providers", e))?
            .with_memory_pattern(false)
            .map_err(|e| construction_error(model_path, "memory pattern", e))?
            .commit_from_file(model_path)
            .map_err(|e| construction_error(model_path, "checkpoint load", e))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| construction_error(model_path, "model inputs", "none declared"))?;
        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| construction_error(model_path, "model outputs", "none declared"))?;

        // a dry run rejects checkpoints whose head does not match the config
        let size = config.input_size as usize;
        let data = Array4::<f32>::zeros((1, 3, size, size));
        let class_count = {
            let outputs = session
                .run(ort::inputs![
                    input_name.as_str() => TensorRef::from_array_view(&data)
                        .map_err(|e| construction_error(model_path, "warm-up tensor", e))?
                ])
                .map_err(|e| construction_error(model_path, "warm-up run", e))?;
            let scores = outputs[output_name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| construction_error(model_path, "warm-up output", e))?;
            scores.shape().last().copied().unwrap_or(0)
        };
        if class_count != config.class_count {
            return Err(construction_error(
                model_path,
                "classification head",
                format!("emits {class_count} classes, expected {}", config.class_count),
            ));
        }

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

impl ReleaseCache for OnnxClassifier {}

impl ClassifierModel for OnnxClassifier {
    fn forward(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&input.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix2>()?
            .to_owned())
    }
}

/// A loaded network plus its fixed preprocessing.
pub struct SeasonClassifier<M: ClassifierModel> {
    model: M,
    config: ClassifierConfig,
}

impl<M: ClassifierModel> SeasonClassifier<M> {
    pub fn new(model: M, config: ClassifierConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { model, config })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// NCHW tensor normalized with the fixed per-channel mean and std.
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let size = self.config.input_size;
        let resized;
        let image = if image.dimensions() != (size, size) {
            resized = resize_area(image, size, size);
            &resized
        } else {
            image
        };

        let mut tensor = image.as_ndarray3().mapv(|v| f32::from(v) / 255.0);
        for (c, mut channel) in tensor.axis_iter_mut(Axis(0)).enumerate() {
            let (mean, std) = (self.config.mean[c], self.config.std[c]);
            channel.mapv_inplace(|v| (v - mean) / std);
        }
        tensor.insert_axis(Axis(0))
    }

    pub fn predict_image(&self, image: &RgbImage) -> Result<usize> {
        let input = self.preprocess(image);
        let scores = self.model.forward(input.view())?;
        drop(input);

        if scores.nrows() != 1 || scores.ncols() != self.config.class_count {
            return Err(SeasonError::Model {
                operation: "classification".to_string(),
                source: format!(
                    "expected scores of shape [1, {}], got {:?}",
                    self.config.class_count,
                    scores.shape()
                )
                .into(),
            });
        }

        let index = argmax(scores.row(0)).unwrap_or(0);
        debug!(index, scores = ?scores.row(0).to_vec(), "season scores");
        Ok(index)
    }

    /// Decode, resize to the fixed input and classify. `hint` names the
    /// source (its extension selects the fast decode path).
    pub fn predict_bytes(&self, bytes: &[u8], hint: &Path) -> Result<usize> {
        let image = classifier_resize(bytes, hint, self.config.input_size)?;
        self.predict_image(&image)
    }
}

type Loader<M> = Box<dyn Fn() -> Result<SeasonClassifier<M>> + Send + Sync>;

/// Process-wide classifier built on first use.
///
/// Concurrent first callers block until the single construction finishes;
/// afterwards every caller shares the same immutable state. A failed
/// construction is remembered and reported to every later caller.
pub struct LazyClassifier<M: ClassifierModel> {
    source: PathBuf,
    loader: Loader<M>,
    state: OnceCell<std::result::Result<SeasonClassifier<M>, String>>,
    load_count: AtomicUsize,
}

impl<M: ClassifierModel> LazyClassifier<M> {
    pub fn new<F>(source: impl Into<PathBuf>, loader: F) -> Self
    where
        F: Fn() -> Result<SeasonClassifier<M>> + Send + Sync + 'static,
    {
        Self {
            source: source.into(),
            loader: Box::new(loader),
            state: OnceCell::new(),
            load_count: AtomicUsize::new(0),
        }
    }

    /// How many times construction ran (0 or 1).
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state.get(), Some(Ok(_)))
    }

    pub fn get(&self) -> Result<&SeasonClassifier<M>> {
        let state = self.state.get_or_init(|| {
            self.load_count.fetch_add(1, Ordering::SeqCst);
            info!(source = %self.source.display(), "loading season classifier");
            match (self.loader)() {
                Ok(classifier) => {
                    info!("season classifier loaded");
                    Ok(classifier)
                }
                Err(err) => {
                    error!(error = %err, "season classifier construction failed");
                    Err(err.to_string())
                }
            }
        });

        state.as_ref().map_err(|message| SeasonError::Construction {
            path: self.source.clone(),
            message: message.clone(),
        })
    }

    /// Class index for the image stored at `image_path`.
    pub fn predict(&self, image_path: &Path) -> Result<usize> {
        let classifier = self.get()?;
        let _release = CacheRelease::new(classifier.model());
        let bytes = read_file(image_path)?;
        classifier.predict_bytes(&bytes, image_path)
    }

    pub fn predict_bytes(&self, bytes: &[u8], hint: &Path) -> Result<usize> {
        let classifier = self.get()?;
        let _release = CacheRelease::new(classifier.model());
        classifier.predict_bytes(bytes, hint)
    }
}

impl LazyClassifier<OnnxClassifier> {
    /// Lazily load an ONNX checkpoint with the reference preprocessing.
    pub fn from_checkpoint(model_path: impl Into<PathBuf>, device_id: i32) -> Self {
        let model_path = model_path.into();
        let path = model_path.clone();
        Self::new(model_path, move || {
            let config = ClassifierConfig::default();
            let model = OnnxClassifier::new(&path, device_id, &config)?;
            SeasonClassifier::new(model, config)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockClassifierModel;
    use image::Rgb;

    #[test]
    fn test_argmax_first_maximum_wins() {
        assert_eq!(argmax(array![0.1, 0.9, 0.9, 0.2].view()), Some(1));
        assert_eq!(argmax(array![3.0, 1.0].view()), Some(0));
        assert_eq!(argmax(Array1::<f32>::zeros(0).view()), None);
    }

    #[test]
    fn test_season_index_order() {
        assert_eq!(Season::from_index(0), Some(Season::Autumn));
        assert_eq!(Season::from_index(3), Some(Season::Winter));
        assert_eq!(Season::from_index(4), None);
        assert_eq!(Season::Summer.index(), 2);
        assert_eq!(Season::Spring.to_string(), "spring");
    }

    #[test]
    fn test_preprocess_normalizes_to_unit_range() {
        let classifier = SeasonClassifier::new(
            MockClassifierModel::new(vec![0.0, 1.0, 0.0, 0.0]),
            ClassifierConfig::default(),
        )
        .unwrap();
        let image = RgbImage::from_pixel(320, 320, Rgb([255, 0, 255]));
        let tensor = classifier.preprocess(&image);

        assert_eq!(tensor.shape(), &[1, 3, 160, 160]);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_predict_image_returns_argmax() {
        let classifier = SeasonClassifier::new(
            MockClassifierModel::new(vec![0.2, 0.1, 0.7, 0.7]),
            ClassifierConfig::default(),
        )
        .unwrap();
        let image = RgbImage::from_pixel(160, 160, Rgb([90, 60, 40]));
        assert_eq!(classifier.predict_image(&image).unwrap(), 2);
    }

    #[test]
    fn test_wrong_class_count_is_model_error() {
        let classifier = SeasonClassifier::new(
            MockClassifierModel::new(vec![0.2, 0.8]),
            ClassifierConfig::default(),
        )
        .unwrap();
        let image = RgbImage::from_pixel(160, 160, Rgb([90, 60, 40]));
        assert!(matches!(
            classifier.predict_image(&image),
            Err(SeasonError::Model { .. })
        ));
    }

    #[test]
    fn test_missing_checkpoint_is_construction_error() {
        let lazy = LazyClassifier::from_checkpoint("/nonexistent/season.onnx", 0);
        let err = lazy.get().err().unwrap();
        assert!(err.is_construction());
        assert!(!lazy.is_loaded());

        assert!(lazy.predict(Path::new("face.jpg")).unwrap_err().is_construction());
        assert_eq!(lazy.load_count(), 1);
    }
}
