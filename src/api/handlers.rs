use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use std::time::Instant;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::api::{
    types::{ChatRequest, ChatResponse, HealthResponse},
    AppState,
};

// The body is parsed as JSON whatever Content-Type the client sends;
// browser frontends posting `text/plain` to skip preflight still work.
pub async fn chat(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ChatResponse>, (StatusCode, String)> {
    let req: ChatRequest = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?;

    let request_id = Uuid::new_v4();
    let span = info_span!("chat", %request_id);

    async move {
        let started = Instant::now();
        let prompt_chars = req.message.chars().count();

        match state.infer.generate(req.message).await {
            Ok(out) => {
                info!(
                    prompt_chars,
                    prompt_tokens = out.prompt_tokens,
                    new_tokens = out.new_tokens,
                    finish = out.finish.as_str(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "generation complete"
                );
                Ok(Json(ChatResponse { response: out.text }))
            }
            Err(e) => {
                error!("generation failed: {e:#}");
                Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                ))
            }
        }
    }
    .instrument(span)
    .await
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        model: state.infer.model_id().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
