use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for lip extraction and season classification.
///
/// Segmentation never surfaces here: an internal segmentation failure is a
/// [`crate::segmenter::RegionMask::Fallback`], not an error.
#[derive(Error, Debug)]
pub enum SeasonError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Decode error: could not decode image {path:?}")]
    Decode {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Construction error: classifier could not be built from {path:?}: {message}")]
    Construction { path: PathBuf, message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SeasonError>;

impl SeasonError {
    pub(crate) fn decode<E>(path: impl Into<PathBuf>, source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Decode {
            path: path.into(),
            source: source.into(),
        }
    }

    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode { .. })
    }

    pub fn is_construction(&self) -> bool {
        matches!(self, Self::Construction { .. })
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Only the binary speaks anyhow; anything crossing back into the library
/// is treated as a configuration problem.
impl From<anyhow::Error> for SeasonError {
    fn from(err: anyhow::Error) -> Self {
        SeasonError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Callers that know the path should build `SeasonError::FileSystem`
/// directly; this is the context-free fallback.
impl From<std::io::Error> for SeasonError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Image crate errors outside of decoding are encoder/resize failures.
impl From<image::ImageError> for SeasonError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::Decoding(_) | image::ImageError::Unsupported(_) => {
                Self::decode("unknown", err)
            }
            _ => Self::Model {
                operation: "image processing".to_string(),
                source: Box::new(err),
            },
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for SeasonError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor plumbing around inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for SeasonError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display_mentions_path() {
        let err = SeasonError::decode("face.jpg", "truncated");
        assert!(err.is_decode());
        assert!(err.to_string().contains("face.jpg"));
    }

    #[test]
    fn test_io_error_conversion() {
        let err: SeasonError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SeasonError::FileSystem { .. }));
    }
}
