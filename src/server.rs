use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::images::{HttpImagePipeline, ImagePipeline, NoopImagePipeline};
use crate::logging::{DiagnosticLog, DiagnosticSink, TracingSink};
use crate::models::{family_of, ModelRegistry};
use crate::proxy;
use crate::translate::streaming::StreamMode;
use crate::usage::TokenCounter;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub client: reqwest::Client,
    pub registry: ModelRegistry,
    pub tokens: TokenCounter,
    pub diagnostics: Arc<dyn DiagnosticSink>,
    pub images: Arc<dyn ImagePipeline>,
}

impl AppState {
    /// Wire up the shared collaborators from `config`.
    pub fn new(config: GatewayConfig, client: reqwest::Client) -> Result<Self> {
        let diagnostics: Arc<dyn DiagnosticSink> = match &config.leaked_tools.log_path {
            Some(path) => Arc::new(DiagnosticLog::new(path)?),
            None => Arc::new(TracingSink),
        };
        let images: Arc<dyn ImagePipeline> = if config.images.inline_remote {
            Arc::new(HttpImagePipeline::new(client.clone(), config.images.max_bytes))
        } else {
            Arc::new(NoopImagePipeline)
        };

        Ok(Self {
            registry: ModelRegistry::with_overrides(&config.models),
            tokens: TokenCounter::new()?,
            config,
            client,
            diagnostics,
            images,
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/messages", post(handle_messages))
        .route("/v1/models", get(handle_models))
        .route("/refresh", post(handle_refresh))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "Failed to parse request");
            return GatewayError::from(e).into_response();
        }
    };

    let prepared = match proxy::prepare(&state, &payload).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!(error = %e, "Rejected request");
            return e.into_response();
        }
    };

    if prepared.mode == StreamMode::NonStreaming {
        handle_non_streaming(&state, &prepared).await
    } else {
        handle_streaming(&state, &prepared).await
    }
}

async fn handle_non_streaming(state: &AppState, prepared: &proxy::PreparedRequest) -> Response {
    match proxy::proxy_non_streaming(state, prepared).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Proxy error");
            e.into_response()
        }
    }
}

async fn handle_streaming(state: &AppState, prepared: &proxy::PreparedRequest) -> Response {
    let sse_stream = match proxy::proxy_streaming(state, prepared).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Streaming setup error");
            return e.into_response();
        }
    };

    // An Err item ends the body without the usage chunk or [DONE]
    let event_stream = sse_stream.map(|result| result.map(|frame| Event::default().data(frame.data())));

    Sse::new(event_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req_headers = reqwest_headers_from_axum(&headers);

    let upstream = match proxy::proxy_passthrough(&state, &body, &req_headers).await {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "Passthrough error");
            return e.into_response();
        }
    };

    let status_code =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    let mut builder = Response::builder()
        .status(status_code)
        .header("content-type", &content_type);
    if content_type.contains("text/event-stream") {
        builder = builder.header("cache-control", "no-cache");
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "models": state.registry.snapshot().len(),
    }))
}

/// Re-fetch the alias table from `upstream.models_url` now.
async fn handle_refresh(State(state): State<Arc<AppState>>) -> Response {
    let Some(url) = state.config.upstream.models_url.as_deref() else {
        return GatewayError::config("`upstream.models_url` is not set").into_response();
    };
    match state.registry.refresh_from(&state.client, url).await {
        Ok(count) => Json(serde_json::json!({"status": "ok", "models": count})).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, url, "On-demand model refresh failed");
            e.into_response()
        }
    }
}

async fn handle_models(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let snapshot = state.registry.snapshot();
    let mut aliases: Vec<(&String, &String)> = snapshot.aliases().collect();
    aliases.sort();

    let models: Vec<serde_json::Value> = aliases
        .into_iter()
        .map(|(alias, internal)| {
            serde_json::json!({
                "id": alias,
                "object": "model",
                "owned_by": family_of(internal).as_str(),
                "internal_id": internal,
            })
        })
        .collect();

    Json(serde_json::json!({ "data": models, "object": "list" }))
}

fn reqwest_headers_from_axum(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (key, value) in headers.iter() {
        if let Ok(name) = reqwest::header::HeaderName::from_bytes(key.as_str().as_bytes()) {
            if let Ok(val) = reqwest::header::HeaderValue::from_bytes(value.as_bytes()) {
                out.insert(name, val);
            }
        }
    }
    out
}
