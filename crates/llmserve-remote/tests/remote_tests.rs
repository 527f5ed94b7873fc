use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Json;
use futures::StreamExt;
use llmserve_backend::DecodeOptions;
use llmserve_common::config::{ExternalConfig, RpcConfig, SchedulingConfig};
use llmserve_common::ServeError;
use llmserve_core::{NoopMetrics, Outcome, Router};
use llmserve_remote::proto::{DecodeRequest, PrefillChunkReply, PrefillChunkRequest};
use llmserve_remote::{ExternalProxyCallbacks, RemoteError, RpcCallbacks};
use serde_json::Value;

async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr.to_string()
}

const SSE_BODY: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    ": keep-alive\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo!\"}}]}\n\n",
    "data: [DONE]\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
);

#[derive(Default)]
struct Seen {
    auth: Mutex<Option<String>>,
    body: Mutex<Option<Value>>,
}

async fn chat(State(seen): State<Arc<Seen>>, headers: HeaderMap, Json(body): Json<Value>) -> &'static str {
    *seen.auth.lock().unwrap() = headers.get("authorization").and_then(|v| v.to_str().ok()).map(String::from);
    *seen.body.lock().unwrap() = Some(body);
    SSE_BODY
}

#[tokio::test]
async fn external_proxy_streams_sse_text() {
    let seen = Arc::new(Seen::default());
    let app = axum::Router::new().route("/v1/chat/completions", post(chat)).with_state(seen.clone());
    let addr = serve(app).await;

    let cfg = ExternalConfig {
        proxy_url: Some(format!("http://{addr}/")),
        decode_url: None,
        auth_header: Some("Bearer s3cret".into()),
    };
    let callbacks = ExternalProxyCallbacks::new(&cfg, "my-model").unwrap();
    assert_eq!(callbacks.endpoint(), format!("http://{addr}/v1/chat/completions"));
    let router = Router::start(&SchedulingConfig::default(), Arc::new(callbacks), Arc::new(NoopMetrics));

    let opts = DecodeOptions { max_tokens: Some(16), ..Default::default() };
    let text = router.complete("Say hello", Some("acme"), opts).await.unwrap();
    assert_eq!(text, "Hello!");

    assert_eq!(seen.auth.lock().unwrap().as_deref(), Some("Bearer s3cret"));
    let body = seen.body.lock().unwrap().clone().unwrap();
    assert_eq!(body["model"], "my-model");
    assert_eq!(body["stream"], true);
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "Say hello");
    assert_eq!(body["max_tokens"], 16);
    assert!(body.get("top_p").is_none());
    router.stop().await;
}

#[tokio::test]
async fn external_error_status_ends_stream_as_backend_failure() {
    let app = axum::Router::new().route("/v1/chat/completions", post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }));
    let addr = serve(app).await;
    let cfg = ExternalConfig { decode_url: Some(format!("http://{addr}")), ..Default::default() };
    let router = Router::start(
        &SchedulingConfig::default(),
        Arc::new(ExternalProxyCallbacks::new(&cfg, "m").unwrap()),
        Arc::new(NoopMetrics),
    );

    let mut s = router.submit_and_stream("hi", None, DecodeOptions::default()).unwrap();
    assert!(s.next().await.is_none());
    match s.outcome() {
        Some(Outcome::BackendFailed(msg)) => assert!(msg.contains("502"), "{msg}"),
        other => panic!("unexpected outcome {other:?}"),
    }
    router.stop().await;
}

#[test]
fn external_needs_a_url() {
    assert!(matches!(ExternalProxyCallbacks::new(&ExternalConfig::default(), "m"), Err(RemoteError::MissingUrl)));
}

fn decode_worker(label: &'static str) -> axum::Router {
    axum::Router::new().route(
        "/llmserve.DecodeService/DecodeStream",
        post(move |Json(req): Json<DecodeRequest>| async move {
            format!("{{\"delta\":\"{label}:\"}}\n\n{{\"delta\":\"{}\"}}\n", req.prompt)
        }),
    )
}

#[tokio::test]
async fn rpc_round_robins_decode_workers() {
    let prefills = Arc::new(AtomicUsize::new(0));
    let counter = prefills.clone();
    let prefill_app = axum::Router::new().route(
        "/llmserve.PrefillService/PrefillChunk",
        post(move |Json(req): Json<PrefillChunkRequest>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Json(PrefillChunkReply { ok: true, prompt_tokens: req.prompt.len() as u64 / 4, kv_handle: String::new() })
            }
        }),
    );
    let prefill = serve(prefill_app).await;
    let a = serve(decode_worker("a")).await;
    let b = serve(decode_worker("b")).await;

    let cfg = RpcConfig { prefill_service: prefill, decode_service: format!("{a}, {b}"), timeout_s: 5.0, round_robin: true };
    let router = Router::start(&SchedulingConfig::default(), Arc::new(RpcCallbacks::new(&cfg).unwrap()), Arc::new(NoopMetrics));

    let first = router.complete("ping", None, DecodeOptions::default()).await.unwrap();
    let second = router.complete("pong", None, DecodeOptions::default()).await.unwrap();
    assert_eq!(first, "a:ping");
    assert_eq!(second, "b:pong");
    assert_eq!(prefills.load(Ordering::SeqCst), 2);
    router.stop().await;
}

#[tokio::test]
async fn rpc_prefill_failure_does_not_block_decode() {
    let a = serve(decode_worker("a")).await;
    let cfg = RpcConfig { prefill_service: String::new(), decode_service: a, timeout_s: 5.0, round_robin: false };
    let router = Router::start(&SchedulingConfig::default(), Arc::new(RpcCallbacks::new(&cfg).unwrap()), Arc::new(NoopMetrics));
    assert_eq!(router.complete("still works", None, DecodeOptions::default()).await.unwrap(), "a:still works");
    router.stop().await;
}

#[tokio::test]
async fn rpc_unreachable_worker_yields_empty_completion() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let closed = listener.local_addr().unwrap().to_string();
    drop(listener);

    let cfg = RpcConfig { prefill_service: closed.clone(), decode_service: closed, timeout_s: 1.0, round_robin: true };
    let router = Router::start(&SchedulingConfig::default(), Arc::new(RpcCallbacks::new(&cfg).unwrap()), Arc::new(NoopMetrics));
    let mut s = router.submit_and_stream("anyone there?", None, DecodeOptions::default()).unwrap();
    assert!(s.next().await.is_none());
    assert!(matches!(s.outcome(), Some(Outcome::BackendFailed(_))));
    router.stop().await;
}

#[test]
fn rpc_needs_decode_addresses() {
    let cfg = RpcConfig { decode_service: " , ".into(), ..Default::default() };
    assert!(matches!(RpcCallbacks::new(&cfg), Err(ServeError::Backend(_))));
}

#[test]
fn decode_request_defaults_fill_zero_fields() {
    let req: DecodeRequest = serde_json::from_str(r#"{"req_id":"r","prompt":"p"}"#).unwrap();
    let opts = req.options();
    assert_eq!(opts.max_tokens(), 256);
    assert_eq!(opts.strategy_hint(), "auto");
    assert_eq!(opts.workload(), "general");
}
