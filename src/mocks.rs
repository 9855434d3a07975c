//! Stand-ins for the model-backed traits, so the lazy construction, cleanup
//! and pipeline logic can be exercised without an ONNX checkpoint.

use std::sync::atomic::{AtomicUsize, Ordering};

use ndarray::prelude::*;

use crate::adapter::{FaceData, SegmentationBackend};
use crate::classifier::ClassifierModel;
use crate::errors::{Result, SeasonError};
use crate::governor::{MemoryProbe, ReleaseCache};

/// Classifier that returns the same scores for every input.
#[derive(Debug, Default)]
pub struct MockClassifierModel {
    pub scores: Vec<f32>,
    forward_calls: AtomicUsize,
    releases: AtomicUsize,
}

impl MockClassifierModel {
    pub fn new(scores: Vec<f32>) -> Self {
        Self {
            scores,
            ..Self::default()
        }
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl ReleaseCache for MockClassifierModel {
    fn release_cache(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl ClassifierModel for MockClassifierModel {
    fn forward(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        let batch = input.shape()[0];
        let row = Array1::from(self.scores.clone());
        Ok(row
            .broadcast((batch, self.scores.len()))
            .map(|view| view.to_owned())
            .unwrap_or_else(|| Array2::zeros((batch, self.scores.len()))))
    }
}

/// Wraps a backend, counting forward passes and cache releases.
/// With `fail` set, every forward pass errors.
#[derive(Debug, Default)]
pub struct CountingBackend<B> {
    pub inner: B,
    pub fail: bool,
    forward_calls: AtomicUsize,
    releases: AtomicUsize,
}

impl<B> CountingBackend<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            fail: false,
            forward_calls: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn failing(inner: B) -> Self {
        Self {
            fail: true,
            ..Self::new(inner)
        }
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

impl<B: SegmentationBackend> ReleaseCache for CountingBackend<B> {
    fn release_cache(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release_cache();
    }
}

impl<B: SegmentationBackend> SegmentationBackend for CountingBackend<B> {
    fn forward(&self, images: ArrayViewD<'_, f32>, data: FaceData) -> Result<FaceData> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(SeasonError::Model {
                operation: "mock forward".to_string(),
                source: "backend configured to fail".into(),
            });
        }
        self.inner.forward(images, data)
    }
}

/// Probe that always reports the same resident size.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub f64);

impl MemoryProbe for FixedMemoryProbe {
    fn resident_mb(&self) -> Option<f64> {
        Some(self.0)
    }
}
