use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, CorsLayer};

use crate::inference::InferenceService;

pub mod handlers;
pub mod types;

#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<InferenceService>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chat", post(handlers::chat))
        .route("/health", get(handlers::health))
}

/// Single-origin CORS. Credentials are allowed, so methods and headers are
/// mirrored from the preflight instead of answered with `*`.
pub fn cors_layer(origin: HeaderValue) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

pub fn app(state: AppState, allowed_origin: HeaderValue) -> Router {
    router()
        .layer(cors_layer(allowed_origin))
        .with_state(state)
}
