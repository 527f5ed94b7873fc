//! Prefill and decode worker services answering the router's RPC calls.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::StreamExt;
use llmserve_backend::mock::StubPrefillEngine;
use llmserve_backend::{strategy, DecodeEngine, PrefillEngine};
use llmserve_common::config::ServeConfig;
use llmserve_common::{Result, ServeError};
use llmserve_remote::proto::{
    DecodeChunk, DecodeRequest, PrefillChunkReply, PrefillChunkRequest, DECODE_STREAM_PATH, NDJSON, PREFILL_CHUNK_PATH,
};

pub fn prefill_app(engine: Arc<dyn PrefillEngine>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(PREFILL_CHUNK_PATH, post(prefill_chunk))
        .with_state(engine)
}

pub fn decode_app(engine: Arc<dyn DecodeEngine>) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(DECODE_STREAM_PATH, post(decode_stream))
        .with_state(engine)
}

/// The prefill worker only needs token counts today, which the stub engine gives.
pub fn stub_prefill_app() -> axum::Router {
    tracing::info!(target: "worker", "prefill worker ready");
    prefill_app(Arc::new(StubPrefillEngine::new()))
}

/// Decode worker over the configured strategy, falling back as the manifest says.
pub fn decode_app_from_config(cfg: &ServeConfig) -> Result<axum::Router> {
    let resolved = strategy::resolve_from_config(cfg)?;
    tracing::info!(target: "worker", strategy = %resolved.name, fell_back = resolved.fell_back, "decode worker ready");
    Ok(decode_app(resolved.engine))
}

async fn prefill_chunk(
    State(engine): State<Arc<dyn PrefillEngine>>,
    Json(req): Json<PrefillChunkRequest>,
) -> Response {
    match engine.prefill(&req.prompt).await {
        Ok(result) => {
            tracing::debug!(
                target: "worker",
                req = %req.req_id,
                start_token = req.start_token,
                n_tokens = req.n_tokens,
                prompt_tokens = result.prompt_tokens,
                "prefill chunk"
            );
            Json(PrefillChunkReply {
                ok: true,
                prompt_tokens: result.prompt_tokens as u64,
                kv_handle: result.kv_handle.unwrap_or_default(),
            })
            .into_response()
        }
        Err(err) => {
            tracing::warn!(target: "worker", req = %req.req_id, error = %err, "prefill failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Streams `{"delta": ...}` lines. An engine error mid-stream aborts the body,
/// which the client sees as a transport failure.
async fn decode_stream(State(engine): State<Arc<dyn DecodeEngine>>, Json(req): Json<DecodeRequest>) -> Response {
    tracing::debug!(target: "worker", req = %req.req_id, tenant = %req.tenant, "decode stream");
    let opts = req.options();
    let frames = engine.stream(req.prompt, opts).map(|item| {
        let line = serde_json::to_string(&DecodeChunk { delta: item? })?;
        Ok::<_, ServeError>(line + "\n")
    });
    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(frames)).into_response()
}
