mod health;
mod predict;

use crate::{inference_service::InferenceService, model_service::ModelService};
use axum::{
    routing::{get, post},
    Router,
};

pub use predict::{PredictResponse, UPLOAD_FIELD};

pub fn api_routes<M: ModelService>() -> Router<InferenceService<M>> {
    Router::new()
        .route("/predict", post(predict::predict::<M>))
        .route("/health", get(health::healthcheck))
}
