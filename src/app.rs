use crate::{
    config::Config, inference_service::InferenceService, ort_service::OrtModelService,
    server::HttpServer,
};

pub async fn start_app(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let model_service =
        OrtModelService::new(&config.model, config.labels.as_ref()).map_err(|e| {
            tracing::error!("Failed to instantiate ort model service: {}", e);
            e
        })?;

    let inference_service = InferenceService::new(model_service);
    let server = HttpServer::new(inference_service, &config.server).await?;

    server.run().await?;

    Ok(())
}
