//! Proxy to an external OpenAI-compatible endpoint that runs its own
//! prefill/decode split. Prefill is a no-op here; the decode call streams SSE.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use llmserve_backend::TextStream;
use llmserve_common::config::{ExternalConfig, ServeConfig};
use llmserve_common::{Result, ServeError};
use llmserve_core::{RequestContext, SchedulerCallbacks};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::lines::lines;
use crate::{ensure_success, RemoteError};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// One classified line of an SSE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Blank, comment, or an event with no text.
    Skip,
    /// The `[DONE]` sentinel; nothing after it is read.
    Done,
    Text(String),
}

/// SSE fields that carry no payload.
const IGNORED_FIELDS: [&str; 3] = ["event", "id", "retry"];

/// Classifies a line of an OpenAI-style stream. JSON events yield
/// `choices[0].delta.content`, then `choices[0].text`, then a top-level
/// `output` string; a line that is not JSON is passed through as text.
/// `event:`, `id:` and `retry:` fields are skipped.
pub fn parse_sse_line(raw: &str) -> SseLine {
    let line = raw.trim_end_matches('\r');
    if line.trim().is_empty() || line.starts_with(':') {
        return SseLine::Skip;
    }
    if let Some((field, _)) = line.split_once(':') {
        if IGNORED_FIELDS.contains(&field) {
            return SseLine::Skip;
        }
    }
    let line = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if line == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(event) => event_text(&event).map_or(SseLine::Skip, SseLine::Text),
        Err(_) => SseLine::Text(line.to_string()),
    }
}

fn event_text(event: &Value) -> Option<String> {
    let non_empty = |v: Option<&Value>| v.and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string);
    if let Some(first) = event.get("choices").and_then(Value::as_array).and_then(|c| c.first()) {
        return non_empty(first.get("delta").and_then(|d| d.get("content"))).or_else(|| non_empty(first.get("text")));
    }
    non_empty(event.get("output"))
}

pub struct ExternalProxyCallbacks {
    http: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    model: String,
}

impl ExternalProxyCallbacks {
    pub fn new(cfg: &ExternalConfig, model: impl Into<String>) -> std::result::Result<Self, RemoteError> {
        let base = cfg.base_url().filter(|u| !u.is_empty()).ok_or(RemoteError::MissingUrl)?;
        let http = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            http,
            url: format!("{base}{CHAT_COMPLETIONS_PATH}"),
            auth_header: cfg.auth_header.clone().filter(|h| !h.is_empty()),
            model: model.into(),
        })
    }

    pub fn from_config(cfg: &ServeConfig) -> Result<Self> {
        Ok(Self::new(&cfg.disagg.external, cfg.primary_model())?)
    }

    pub fn endpoint(&self) -> &str { &self.url }

    /// Chat payload with the caller's sampling overrides.
    pub fn payload(&self, ctx: &RequestContext) -> Value {
        let opts = &ctx.opts;
        let mut body = Map::new();
        body.insert("model".into(), json!(self.model));
        body.insert("messages".into(), json!([{ "role": "user", "content": ctx.prompt }]));
        body.insert("stream".into(), json!(true));
        if let Some(v) = opts.temperature {
            body.insert("temperature".into(), json!(v));
        }
        if let Some(v) = opts.top_p {
            body.insert("top_p".into(), json!(v));
        }
        if let Some(v) = opts.max_tokens {
            body.insert("max_tokens".into(), json!(v));
        }
        if !opts.stop.is_empty() {
            body.insert("stop".into(), json!(opts.stop));
        }
        if let Some(v) = opts.presence_penalty {
            body.insert("presence_penalty".into(), json!(v));
        }
        if let Some(v) = opts.frequency_penalty {
            body.insert("frequency_penalty".into(), json!(v));
        }
        Value::Object(body)
    }
}

#[async_trait]
impl SchedulerCallbacks for ExternalProxyCallbacks {
    fn backend(&self) -> &'static str { "external" }

    async fn prefill_chunk(&self, _ctx: &RequestContext, _start_token: usize, _n_tokens: usize) -> Result<()> {
        Ok(())
    }

    fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream {
        let mut req = self.http.post(&self.url).json(&self.payload(ctx));
        if let Some(auth) = &self.auth_header {
            req = req.header(reqwest::header::AUTHORIZATION, auth.as_str());
        }
        relay_sse(req, ctx.id.to_string()).boxed()
    }
}

fn relay_sse(req: reqwest::RequestBuilder, req_id: String) -> impl Stream<Item = Result<String>> + Send + 'static {
    try_stream! {
        let resp = req.send().await.map_err(|err| proxy_failed(&req_id, err.into()))?;
        let resp = ensure_success(resp, "external").await.map_err(|err| proxy_failed(&req_id, err))?;
        let body = lines(resp.bytes_stream());
        futures::pin_mut!(body);
        while let Some(line) = body.next().await {
            let line = line.map_err(|err| proxy_failed(&req_id, err.into()))?;
            match parse_sse_line(&line) {
                SseLine::Skip => continue,
                SseLine::Done => break,
                SseLine::Text(text) => yield text,
            }
        }
    }
}

fn proxy_failed(req_id: &str, err: RemoteError) -> ServeError {
    warn!(target: "external", req = req_id, error = %err, "proxy stream failed");
    err.into()
}
