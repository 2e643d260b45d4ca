use thiserror::Error;

/// Faults raised while turning uploaded bytes into a label set.
///
/// Every variant ends up in the same `{"error": ...}` body, so the message is
/// the only thing a client ever sees.
#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Error decoding image: {0}")]
    Decode(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected detection result: {0}")]
    Shape(String),
}

impl From<image::ImageError> for PredictError {
    fn from(err: image::ImageError) -> Self {
        PredictError::Decode(err.to_string())
    }
}

impl From<ort::Error> for PredictError {
    fn from(err: ort::Error) -> Self {
        PredictError::Inference(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PredictError {
    fn from(err: tokio::task::JoinError) -> Self {
        PredictError::Inference(format!("inference task aborted: {}", err))
    }
}
