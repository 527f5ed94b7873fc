//! Client side of the prefill/decode worker RPC.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use llmserve_backend::TextStream;
use llmserve_common::config::RpcConfig;
use llmserve_common::{Result, ServeError};
use llmserve_core::{RequestContext, SchedulerCallbacks};
use tracing::{debug, warn};

use crate::lines::lines;
use crate::proto::{DecodeChunk, DecodeRequest, PrefillChunkReply, PrefillChunkRequest, DECODE_STREAM_PATH, PREFILL_CHUNK_PATH};
use crate::{ensure_success, RemoteError};

pub struct RpcClient {
    http: reqwest::Client,
    prefill: Vec<String>,
    decode: Vec<String>,
    round_robin: bool,
    timeout: Duration,
    next_prefill: AtomicUsize,
    next_decode: AtomicUsize,
}

impl RpcClient {
    pub fn new(cfg: &RpcConfig) -> std::result::Result<Self, RemoteError> {
        let timeout = Duration::from_secs_f64(cfg.timeout_s.clamp(0.1, 3600.0));
        let http = reqwest::Client::builder().connect_timeout(timeout).pool_max_idle_per_host(32).build()?;
        let prefill = cfg.prefill_addresses();
        let decode = cfg.decode_addresses();
        if decode.is_empty() {
            return Err(RemoteError::NoAddresses("decode"));
        }
        Ok(Self {
            http,
            prefill,
            decode,
            round_robin: cfg.round_robin,
            timeout,
            next_prefill: AtomicUsize::new(0),
            next_decode: AtomicUsize::new(0),
        })
    }

    fn pick<'a>(&self, pool: &'a [String], next: &AtomicUsize) -> Option<&'a str> {
        if pool.is_empty() {
            return None;
        }
        let i = if self.round_robin { next.fetch_add(1, Ordering::Relaxed) % pool.len() } else { 0 };
        Some(pool[i].as_str())
    }

    pub async fn prefill_chunk(&self, req: &PrefillChunkRequest) -> std::result::Result<PrefillChunkReply, RemoteError> {
        let addr = self.pick(&self.prefill, &self.next_prefill).ok_or(RemoteError::NoAddresses("prefill"))?;
        let resp = self.http.post(endpoint(addr, PREFILL_CHUNK_PATH)).timeout(self.timeout).json(req).send().await?;
        Ok(ensure_success(resp, "prefill").await?.json().await?)
    }

    /// Opens a decode stream. The whole-request timeout does not apply here; a
    /// completion may legitimately stream for longer than a unary call.
    pub async fn decode_stream(
        &self,
        req: &DecodeRequest,
    ) -> std::result::Result<BoxStream<'static, std::result::Result<DecodeChunk, RemoteError>>, RemoteError> {
        let addr = self.pick(&self.decode, &self.next_decode).ok_or(RemoteError::NoAddresses("decode"))?;
        let resp = self.http.post(endpoint(addr, DECODE_STREAM_PATH)).json(req).send().await?;
        let resp = ensure_success(resp, "decode").await?;
        Ok(frames(resp.bytes_stream()).boxed())
    }
}

fn endpoint(addr: &str, path: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{}{path}", addr.trim_end_matches('/'))
    } else {
        format!("http://{addr}{path}")
    }
}

fn frames<S, B>(body: S) -> impl Stream<Item = std::result::Result<DecodeChunk, RemoteError>>
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    try_stream! {
        let body = lines(body);
        futures::pin_mut!(body);
        while let Some(line) = body.next().await {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: DecodeChunk = serde_json::from_str(&line)?;
            yield chunk;
        }
    }
}

/// Prefill and decode on remote workers. Failures are logged and surface as
/// the request's backend error; prefill failures never block decode.
pub struct RpcCallbacks {
    client: Arc<RpcClient>,
}

impl RpcCallbacks {
    pub fn new(cfg: &RpcConfig) -> Result<Self> {
        Ok(Self { client: Arc::new(RpcClient::new(cfg)?) })
    }

    pub fn with_client(client: Arc<RpcClient>) -> Self { Self { client } }
}

#[async_trait]
impl SchedulerCallbacks for RpcCallbacks {
    fn backend(&self) -> &'static str { "rpc" }

    async fn prefill_chunk(&self, ctx: &RequestContext, start_token: usize, n_tokens: usize) -> Result<()> {
        let req = PrefillChunkRequest {
            req_id: ctx.id.to_string(),
            prompt: ctx.prompt.clone(),
            start_token: start_token as u64,
            n_tokens: n_tokens as u64,
            tenant: ctx.tenant.clone(),
        };
        match self.client.prefill_chunk(&req).await {
            Ok(reply) => {
                debug!(target: "rpc", req = %ctx.id, start_token, prompt_tokens = reply.prompt_tokens, "prefill chunk done");
                Ok(())
            }
            Err(err) => {
                warn!(target: "rpc", req = %ctx.id, error = %err, "prefill chunk failed");
                Err(err.into())
            }
        }
    }

    fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream {
        relay(self.client.clone(), DecodeRequest::from_context(ctx)).boxed()
    }
}

fn relay(client: Arc<RpcClient>, req: DecodeRequest) -> impl Stream<Item = Result<String>> + Send + 'static {
    try_stream! {
        let mut frames = client.decode_stream(&req).await.map_err(|err| decode_failed(&req, err))?;
        while let Some(frame) = frames.next().await {
            let frame = frame.map_err(|err| decode_failed(&req, err))?;
            if !frame.delta.is_empty() {
                yield frame.delta;
            }
        }
    }
}

fn decode_failed(req: &DecodeRequest, err: RemoteError) -> ServeError {
    warn!(target: "rpc", req = %req.req_id, error = %err, "decode stream failed");
    err.into()
}
