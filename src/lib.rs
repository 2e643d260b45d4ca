mod detection;
mod error;
mod inference_service;
mod labels;
mod model_service;
mod ort_service;
mod routes;
mod server;

pub mod app;
pub mod config;

pub use app::start_app;
pub use detection::{BoundingBox, Detection, DetectionResult};
pub use error::PredictError;
pub use inference_service::{unique_labels, InferenceService, INFERENCE_SIZE};
pub use labels::{ClassNames, LabelsError};
pub use model_service::ModelService;
pub use ort_service::OrtModelService;
pub use routes::{PredictResponse, UPLOAD_FIELD};
pub use server::{build_router, HttpServer};
