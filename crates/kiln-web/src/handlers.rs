use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use kiln_types::{KilnError, PipelineError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::page;
use crate::state::SharedState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DreamRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub kind: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            kind: kind.into(),
        }
    }
}

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

fn api_error(e: KilnError) -> (StatusCode, Json<ApiError>) {
    let status = match e {
        KilnError::Pipeline(PipelineError::ArtifactMissing { .. }) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        KilnError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error!("Request failed: {}", e);
    (status, Json(ApiError::new(e.to_string(), "server_error")))
}

pub async fn health_check() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn index(State(state): State<SharedState>) -> Html<String> {
    Html(page::render(&state))
}

pub async fn examples(State(state): State<SharedState>) -> Json<Vec<String>> {
    Json(state.examples.clone())
}

/// Generate one image; an empty prompt falls back to the first example.
pub async fn dream(
    State(state): State<SharedState>,
    Json(req): Json<DreamRequest>,
) -> ApiResult<Response> {
    let prompt = if req.text.trim().is_empty() {
        state.examples.first().cloned().unwrap_or_default()
    } else {
        req.text
    };
    info!("Dreaming {:?}", prompt);

    let image = state
        .pipeline
        .generate(&prompt, &state.app_config)
        .await
        .map_err(api_error)?;

    Ok(([(header::CONTENT_TYPE, "image/png")], image.png).into_response())
}

async fn asset(state: &SharedState, name: &str, content_type: &'static str) -> ApiResult<Response> {
    let path = state.assets_dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response()),
        Err(e) => {
            error!("Asset {} unavailable: {}", path.display(), e);
            Err((
                StatusCode::NOT_FOUND,
                Json(ApiError::new(format!("asset {name} not found"), "not_found")),
            ))
        }
    }
}

pub async fn favicon(State(state): State<SharedState>) -> ApiResult<Response> {
    asset(&state, "favicon.svg", "image/svg+xml").await
}

pub async fn background(State(state): State<SharedState>) -> ApiResult<Response> {
    asset(&state, "background.svg", "image/svg+xml").await
}

pub async fn stylesheet(State(state): State<SharedState>) -> ApiResult<Response> {
    asset(&state, "index.css", "text/css").await
}
