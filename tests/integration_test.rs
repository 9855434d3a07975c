use image::{Rgb, RgbImage};
use ndarray::{Array2, ArrayView4, Axis};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use skin_season::adapter::DEFAULT_FALLBACK_SIZE;
use skin_season::mocks::{CountingBackend, MockClassifierModel};
use skin_season::{
    ClassifierConfig, ClassifierModel, FaceData, LazyClassifier, LightweightFaceParser,
    PaletteAnalyzer, ReleaseCache, Season, SeasonClassifier, SegmentationBackend,
};

// Always picks the class given at construction and counts constructions.
struct FixedSeasonModel {
    class: usize,
}

impl ReleaseCache for FixedSeasonModel {}

impl ClassifierModel for FixedSeasonModel {
    fn forward(&self, input: ArrayView4<f32>) -> skin_season::Result<Array2<f32>> {
        let mut scores = Array2::<f32>::zeros((input.shape()[0], 4));
        scores.column_mut(self.class).fill(1.0);
        Ok(scores)
    }
}

fn counting_classifier(
    class: usize,
    constructions: Arc<AtomicUsize>,
) -> LazyClassifier<FixedSeasonModel> {
    LazyClassifier::new("fixed.onnx", move || {
        constructions.fetch_add(1, Ordering::SeqCst);
        SeasonClassifier::new(FixedSeasonModel { class }, ClassifierConfig::default())
    })
}

fn write_image(dir: &Path, name: &str, image: &RgbImage) -> PathBuf {
    let path = dir.join(name);
    image.save(&path).unwrap();
    path
}

fn red_rectangle_face() -> RgbImage {
    let mut image = RgbImage::from_pixel(200, 160, Rgb([215, 185, 160]));
    for y in 100..125 {
        for x in 60..140 {
            image.put_pixel(x, y, Rgb([185, 20, 40]));
        }
    }
    image
}

#[test]
fn test_classifier_constructed_once_across_threads() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_image(temp_dir.path(), "face.png", &red_rectangle_face());

    let constructions = Arc::new(AtomicUsize::new(0));
    let classifier = Arc::new(counting_classifier(1, constructions.clone()));

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let classifier = classifier.clone();
            let path = path.clone();
            scope.spawn(move || {
                for _ in 0..3 {
                    assert_eq!(classifier.predict(&path).unwrap(), 1);
                }
            });
        }
    });

    assert_eq!(constructions.load(Ordering::SeqCst), 1);
    assert_eq!(classifier.load_count(), 1);
    assert!(classifier.is_loaded());
}

#[test]
fn test_construction_failure_is_reported_every_call() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let classifier: LazyClassifier<MockClassifierModel> =
        LazyClassifier::new("broken.onnx", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            SeasonClassifier::new(
                MockClassifierModel::new(vec![1.0; 4]),
                ClassifierConfig {
                    input_size: 0,
                    ..ClassifierConfig::default()
                },
            )
        });

    for _ in 0..3 {
        let err = classifier.predict(Path::new("unused.png")).unwrap_err();
        assert!(err.is_construction());
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn test_empty_file_is_decode_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("empty.jpg");
    fs::write(&path, b"").unwrap();

    let constructions = Arc::new(AtomicUsize::new(0));
    let classifier = Arc::new(counting_classifier(0, constructions));
    assert!(classifier.predict(&path).unwrap_err().is_decode());

    let analyzer = PaletteAnalyzer::lightweight(classifier);
    assert!(analyzer.extract_rgb_codes(&path).unwrap_err().is_decode());
    assert!(analyzer.analyze(&path).unwrap_err().is_decode());
}

#[test]
fn test_garbage_bytes_are_decode_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("noise.png");
    fs::write(&path, b"definitely not a png").unwrap();

    let analyzer =
        PaletteAnalyzer::lightweight(Arc::new(counting_classifier(0, Arc::default())));
    assert!(analyzer.extract_rgb_codes(&path).unwrap_err().is_decode());
}

#[test]
fn test_analyze_red_rectangle() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_image(temp_dir.path(), "face.png", &red_rectangle_face());

    let analyzer =
        PaletteAnalyzer::lightweight(Arc::new(counting_classifier(2, Arc::default())));
    let analysis = analyzer.analyze(&path).unwrap();

    assert_eq!(analysis.season, Season::Summer);
    assert!(!analysis.pixels.is_fallback());
    // interior of the rectangle, allowing for JPEG ringing at the border
    assert!(analysis.pixels.len() >= 76 * 21);
    assert!(analysis.pixels.len() <= 84 * 29);
    let [r, g, _] = analysis.pixels.mean().unwrap();
    assert!(r > 140 && g < 80);
}

#[test]
fn test_uniform_image_falls_back_to_lower_rows() {
    let temp_dir = TempDir::new().unwrap();
    let image = RgbImage::from_pixel(50, 40, Rgb([240, 240, 240]));
    let path = write_image(temp_dir.path(), "blank.png", &image);

    let analyzer =
        PaletteAnalyzer::lightweight(Arc::new(counting_classifier(0, Arc::default())));
    let pixels = analyzer.extract_rgb_codes(&path).unwrap();

    assert!(pixels.is_fallback());
    assert_eq!(pixels.len(), 50 * (40 - 24));
}

#[test]
fn test_large_image_is_bounded_before_segmentation() {
    let temp_dir = TempDir::new().unwrap();
    let image = RgbImage::from_pixel(1200, 300, Rgb([240, 240, 240]));
    let path = write_image(temp_dir.path(), "wide.png", &image);

    let analyzer =
        PaletteAnalyzer::lightweight(Arc::new(counting_classifier(3, Arc::default())));
    let analysis = analyzer.analyze(&path).unwrap();
    assert_eq!(analysis.mask.dimensions(), (600, 150));
    assert_eq!(analysis.pixels.len(), 600 * (150 - 90));
}

#[test]
fn test_failing_backend_still_releases_cache() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_image(temp_dir.path(), "face.png", &red_rectangle_face());

    let analyzer = PaletteAnalyzer::new(
        CountingBackend::failing(LightweightFaceParser::default()),
        Arc::new(counting_classifier(0, Arc::default())),
    );
    for _ in 0..3 {
        let pixels = analyzer.extract_rgb_codes(&path).unwrap();
        assert!(pixels.is_fallback());
    }
    assert_eq!(analyzer.backend().forward_calls(), 3);
    assert_eq!(analyzer.backend().releases(), 3);
}

#[test]
fn test_cache_released_when_decode_fails() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.png");
    fs::write(&path, b"\x89PNG broken").unwrap();

    let analyzer = PaletteAnalyzer::new(
        CountingBackend::new(LightweightFaceParser::default()),
        Arc::new(counting_classifier(0, Arc::default())),
    );
    assert!(analyzer.extract_rgb_codes(&path).is_err());
    assert_eq!(analyzer.backend().forward_calls(), 0);
    assert_eq!(analyzer.backend().releases(), 1);
}

#[test]
fn test_backend_output_is_two_channel_and_normalized() {
    let image = red_rectangle_face();
    let tensor = skin_season::normalizer::image_to_tensor(&image).into_dyn();
    let data = LightweightFaceParser::default()
        .forward(tensor.view(), FaceData::new(vec![7]))
        .unwrap();
    let seg = data.seg.unwrap();

    assert_eq!(seg.logits.shape(), &[1, 2, 160, 200]);
    let sums = seg.logits.sum_axis(Axis(1));
    assert!(sums.iter().all(|v| (v - 1.0).abs() < 1e-6));
    assert_eq!(data.image_ids, vec![7]);
}

#[test]
fn test_unshaped_input_yields_default_background() {
    let tensor = ndarray::ArrayD::<f32>::zeros(ndarray::IxDyn(&[2, 2]));
    let data = LightweightFaceParser::default()
        .forward(tensor.view(), FaceData::default())
        .unwrap();
    let seg = data.seg.unwrap();
    assert_eq!(seg.dimensions(), DEFAULT_FALLBACK_SIZE);
    assert!(seg.logits.index_axis(Axis(1), 0).iter().all(|v| *v == 1.0));
}
