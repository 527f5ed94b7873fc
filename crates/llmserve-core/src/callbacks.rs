use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use llmserve_backend::{DecodeEngine, TextStream};
use llmserve_common::{Result, ServeError};

use crate::request::RequestContext;

/// What the scheduler needs from an execution backend.
///
/// `prefill_chunk` is side-effect only; an error is logged by the scheduler and the
/// request moves on to decode. `decode_stream` yields fragments until the completion
/// ends. An `Err` item ends the stream early and is recorded on the request's outcome.
#[async_trait]
pub trait SchedulerCallbacks: Send + Sync {
    /// Short label for logs and metrics (`local`, `rpc`, `external`).
    fn backend(&self) -> &'static str;

    async fn prefill_chunk(&self, ctx: &RequestContext, start_token: usize, n_tokens: usize) -> Result<()>;

    fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream;
}

/// In-process engines, round-robin. Prefill is a no-op; the engine handles it.
pub struct LocalCallbacks {
    pool: Vec<Arc<dyn DecodeEngine>>,
    next: AtomicUsize,
}

impl LocalCallbacks {
    pub fn new(pool: Vec<Arc<dyn DecodeEngine>>) -> Result<Self> {
        if pool.is_empty() {
            return Err(ServeError::Config("local backend needs at least one decode engine".into()));
        }
        Ok(Self { pool, next: AtomicUsize::new(0) })
    }

    pub fn pool_size(&self) -> usize { self.pool.len() }

    fn pick(&self) -> Arc<dyn DecodeEngine> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[i].clone()
    }
}

#[async_trait]
impl SchedulerCallbacks for LocalCallbacks {
    fn backend(&self) -> &'static str { "local" }

    async fn prefill_chunk(&self, _ctx: &RequestContext, _start_token: usize, _n_tokens: usize) -> Result<()> {
        Ok(())
    }

    fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream {
        self.pick().stream(ctx.prompt.clone(), ctx.opts.clone())
    }
}
