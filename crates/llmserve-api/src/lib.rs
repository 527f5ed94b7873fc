//! HTTP front end: completions over the router, plus health and metrics.

pub mod worker;

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures::{stream, StreamExt};
use llmserve_backend::{strategy, DecodeOptions};
use llmserve_common::config::{DisaggProvider, ServeConfig};
use llmserve_common::{Result, ServeError};
use llmserve_core::{LocalCallbacks, RequestStream, Router, RouterMetrics, SchedulerCallbacks};
use llmserve_obs::PrometheusMetrics;
use llmserve_remote::proto::NDJSON;
use llmserve_remote::{ExternalProxyCallbacks, RpcCallbacks};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub const TENANT_HEADER: &str = "x-tenant-id";

#[derive(Clone)]
pub struct AppState {
    router: Arc<Router>,
    metrics: Arc<PrometheusMetrics>,
    model_id: Arc<str>,
}

impl AppState {
    pub fn router(&self) -> &Arc<Router> { &self.router }
    pub fn model_id(&self) -> &str { &self.model_id }
}

/// Picks the backend once, from the deployment mode.
pub fn select_callbacks(cfg: &ServeConfig) -> Result<Arc<dyn SchedulerCallbacks>> {
    if !cfg.deployment.disaggregated {
        let resolved = strategy::resolve_from_config(cfg)?;
        let replicas = cfg.deployment.replicas_for("decode");
        let factory = strategy::lookup(&resolved.name)?;
        let mut pool = vec![resolved.engine];
        pool.extend((1..replicas).map(|_| factory()));
        tracing::info!(target: "api", strategy = %resolved.name, replicas, fell_back = resolved.fell_back, "using local decode engines");
        return Ok(Arc::new(LocalCallbacks::new(pool)?));
    }
    match cfg.disagg.provider {
        DisaggProvider::Custom => {
            tracing::info!(
                target: "api",
                prefill = %cfg.rpc.prefill_service,
                decode = %cfg.rpc.decode_service,
                "using prefill/decode workers"
            );
            Ok(Arc::new(RpcCallbacks::new(&cfg.rpc)?))
        }
        DisaggProvider::External => {
            let callbacks = ExternalProxyCallbacks::from_config(cfg)?;
            tracing::info!(target: "api", endpoint = callbacks.endpoint(), "using external inference stack");
            Ok(Arc::new(callbacks))
        }
    }
}

/// Starts the router with Prometheus metrics; must run inside a tokio runtime.
pub fn build_state(cfg: &ServeConfig) -> Result<AppState> {
    let callbacks = select_callbacks(cfg)?;
    let metrics = Arc::new(
        PrometheusMetrics::new().map_err(|e| ServeError::Config(format!("metrics registry: {e}")))?,
    );
    let router = Router::start(&cfg.scheduling, callbacks, metrics.clone() as Arc<dyn RouterMetrics>);
    Ok(AppState { router: Arc::new(router), metrics, model_id: cfg.primary_model().into() })
}

pub fn app(cfg: &ServeConfig) -> Result<axum::Router> {
    Ok(routes(build_state(cfg)?))
}

pub fn routes(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/completions", post(completions))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/openapi.json", get(openapi))
        .with_state(state)
}

async fn readyz(State(state): State<AppState>) -> Response {
    if state.router.is_running() {
        ([(header::CONTENT_TYPE, "text/plain")], "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => ([(header::CONTENT_TYPE, state.metrics.content_type())], text).into_response(),
        Err(err) => {
            tracing::error!(target: "api", error = %err, "metrics encode failed");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

pub enum ApiError {
    BadRequest(&'static str),
    Serve(ServeError),
}

impl From<ServeError> for ApiError {
    fn from(err: ServeError) -> Self { Self::Serve(err) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_request", msg.to_string()),
            ApiError::Serve(err) => {
                let (status, kind) = match &err {
                    ServeError::RateLimited { .. } => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
                    ServeError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
                    ServeError::SchedulerStopped => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                (status, kind, err.to_string())
            }
        };
        (status, Json(json!({ "error": { "type": kind, "message": message } }))).into_response()
    }
}

fn tenant_id(headers: &HeaderMap) -> Option<&str> {
    headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok()).map(str::trim).filter(|t| !t.is_empty())
}

fn admit(state: &AppState, headers: &HeaderMap, prompt: String, opts: DecodeOptions) -> std::result::Result<RequestStream, ApiError> {
    if prompt.trim().is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty"));
    }
    Ok(state.router.submit_and_stream(prompt, tenant_id(headers), opts)?)
}

#[derive(Deserialize)]
struct CompletionRequest {
    prompt: String,
    #[serde(default)]
    stream: bool,
    #[serde(flatten)]
    opts: DecodeOptions,
}

#[derive(Serialize)]
struct CompletionChoice { index: u32, text: String, finish_reason: String }

#[derive(Serialize)]
struct CompletionResponse {
    id: String,
    object: String,
    model: String,
    choices: Vec<CompletionChoice>,
}

async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CompletionRequest>,
) -> std::result::Result<Response, ApiError> {
    let model = req.opts.model.clone().unwrap_or_else(|| state.model_id.to_string());
    let s = admit(&state, &headers, req.prompt, req.opts)?;
    tracing::info!(target: "api", req = %s.id(), stream = req.stream, "completion request");
    if req.stream {
        let lines = s.map(|delta| Ok::<_, Infallible>(format!("{}\n", json!({ "delta": delta }))));
        return Ok(([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response());
    }
    let id = format!("cmpl-{}", s.id());
    let text = s.into_text().await?;
    let resp = CompletionResponse {
        id,
        object: "text_completion".into(),
        model,
        choices: vec![CompletionChoice { index: 0, text, finish_reason: "stop".into() }],
    };
    Ok(Json(resp).into_response())
}

#[derive(Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatRequest {
    messages: Vec<ChatMessage>,
    #[serde(default)]
    stream: bool,
    #[serde(flatten)]
    opts: DecodeOptions,
}

#[derive(Serialize)]
struct ChatChoiceMessage { role: String, content: String }

#[derive(Serialize)]
struct ChatChoice { index: u32, message: ChatChoiceMessage, finish_reason: String }

#[derive(Serialize)]
struct ChatResponse {
    id: String,
    object: String,
    model: String,
    choices: Vec<ChatChoice>,
}

/// System and user turns joined with newlines; assistant turns are dropped.
fn chat_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for m in messages {
        if m.role == "system" || m.role == "user" {
            prompt.push_str(&m.content);
            prompt.push('\n');
        }
    }
    prompt
}

async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChatRequest>,
) -> std::result::Result<Response, ApiError> {
    let model = req.opts.model.clone().unwrap_or_else(|| state.model_id.to_string());
    let prompt = chat_prompt(&req.messages);
    let s = admit(&state, &headers, prompt, req.opts)?;
    let id = format!("chatcmpl-{}", s.id());
    tracing::info!(target: "api", req = %s.id(), messages = req.messages.len(), stream = req.stream, "chat request");
    if req.stream {
        let chunks = s.map(move |delta| {
            let chunk = json!({
                "id": id,
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{ "index": 0, "delta": { "content": delta } }],
            });
            Ok::<_, Infallible>(Event::default().data(chunk.to_string()))
        });
        let events = chunks.chain(stream::once(async { Ok(Event::default().data("[DONE]")) }));
        return Ok(Sse::new(events).into_response());
    }
    let text = s.into_text().await?;
    let resp = ChatResponse {
        id,
        object: "chat.completion".into(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage { role: "assistant".into(), content: text },
            finish_reason: "stop".into(),
        }],
    };
    Ok(Json(resp).into_response())
}

async fn openapi() -> impl IntoResponse {
    let spec = json!({
        "openapi": "3.0.0",
        "info": {"title": "LLMServe API", "version": env!("CARGO_PKG_VERSION")},
        "paths": {
            "/v1/completions": {"post": {"summary": "Text completion, JSON or NDJSON stream"}},
            "/v1/chat/completions": {"post": {"summary": "OpenAI chat subset, JSON or SSE stream"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "health"}},
            "/readyz": {"get": {"summary": "readiness"}}
        }
    });
    Json(spec)
}
