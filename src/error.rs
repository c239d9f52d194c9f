use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Error groups reported to clients next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InputError,
    ProviderError,
    ShapeError,
    SerializationError,
}

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("No file provided. Please upload an image file using 'file' or 'imageFile' parameter.")]
    NoFile,

    #[error("Upload exceeds the limit of {0} bytes")]
    UploadTooLarge(usize),

    #[error("Could not read upload: {0}")]
    Upload(String),

    #[error("Could not load image: {0}")]
    ImageDecode(#[from] image::ImageError),

    #[error("Could not store upload: {0}")]
    Storage(String),

    #[error("Model not loaded.")]
    ModelNotLoaded,

    #[error("Error during prediction: {0}")]
    Provider(String),

    #[error("Inference timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("no results")]
    NoResults,

    #[error("unrecognized result shape")]
    UnrecognizedShape,

    #[error("{0}")]
    Shape(String),

    #[error("Failed to serialize response: {0}")]
    Serialization(String),
}

impl PredictError {
    /// The error kind reported next to the message in a failed response.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PredictError::NoFile
            | PredictError::UploadTooLarge(_)
            | PredictError::Upload(_)
            | PredictError::ImageDecode(_) => ErrorKind::InputError,
            PredictError::Storage(_)
            | PredictError::ModelNotLoaded
            | PredictError::Provider(_)
            | PredictError::Timeout(_) => ErrorKind::ProviderError,
            PredictError::NoResults | PredictError::UnrecognizedShape | PredictError::Shape(_) => {
                ErrorKind::ShapeError
            }
            PredictError::Serialization(_) => ErrorKind::SerializationError,
        }
    }

    pub fn shape(msg: impl Into<String>) -> Self {
        PredictError::Shape(msg.into())
    }
}

/// Local file system failures while handling an upload are server faults,
/// not client input errors.
impl From<std::io::Error> for PredictError {
    fn from(e: std::io::Error) -> Self {
        PredictError::Storage(e.to_string())
    }
}
