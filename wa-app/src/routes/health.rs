use axum::Json;
use axum::routing::get;

pub const SERVICE_NAME: &str = "wa-relay";

pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/health", get(get_health))
        .route("/", get(get_root))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn get_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn get_root() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
    }))
}
