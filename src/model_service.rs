use crate::{detection::DetectionResult, error::PredictError};
use async_trait::async_trait;
use image::RgbImage;

/// The object detector the request handler delegates to.
#[async_trait]
pub trait ModelService: Send + Sync + 'static {
    async fn predict(
        &self,
        image: RgbImage,
        inference_size: u32,
    ) -> Result<DetectionResult, PredictError>;
}
