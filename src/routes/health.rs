use axum::Json;
use serde::Serialize;

#[derive(Serialize, Debug)]
pub struct Health {
    status: &'static str,
}

/// Liveness probe; the model is loaded before the listener binds.
pub async fn healthcheck() -> Json<Health> {
    Json(Health {
        status: "Available",
    })
}
