use crate::{inference_service::InferenceService, model_service::ModelService};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

/// Multipart field carrying the uploaded image.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Serialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum PredictResponse {
    Labels { labels: Vec<String> },
    Error { error: String },
}

#[derive(Error, Debug)]
enum UploadError {
    #[error("Invalid multipart request: {0}")]
    Rejection(#[from] MultipartRejection),
    #[error("Invalid multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing multipart field `file`")]
    MissingField,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadError::Rejection(rejection) => rejection.status(),
            UploadError::Multipart(err) => err.status(),
            UploadError::MissingField => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = PredictResponse::Error {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn read_upload(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Bytes, UploadError> {
    let mut multipart = multipart?;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(UPLOAD_FIELD) {
            return Ok(field.bytes().await?);
        }
    }
    Err(UploadError::MissingField)
}

/// Every failure after the upload has been read is answered with a 200 and
/// an `error` body.
#[instrument(skip(service, multipart))]
pub async fn predict<M: ModelService>(
    State(service): State<InferenceService<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let image_data = match read_upload(multipart).await {
        Ok(image_data) => image_data,
        Err(err) => {
            tracing::warn!("Rejected upload: {}", err);
            return err.into_response();
        }
    };

    let body = match service.predict(&image_data).await {
        Ok(labels) => {
            tracing::info!("Detected labels: {:?}", labels);
            PredictResponse::Labels { labels }
        }
        Err(err) => {
            tracing::warn!("Prediction failed: {}", err);
            PredictResponse::Error {
                error: err.to_string(),
            }
        }
    };

    (StatusCode::OK, Json(body)).into_response()
}
