//! Per-request state shared between the scheduler (producer) and the router relay (consumer).

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use llmserve_backend::DecodeOptions;
use llmserve_common::{LimitReason, Result, ServeError};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for RequestId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// Rough cost estimate: a quarter token per char, never below one.
pub fn estimate_tokens(prompt: &str) -> usize {
    (prompt.chars().count() / 4).max(1)
}

/// Score multiplier applied while a tenant is over its submission budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalty {
    pub multiplier: f64,
    /// `None` keeps the penalty until it is cleared.
    pub expires_at: Option<Instant>,
}

impl Penalty {
    pub const NONE: Penalty = Penalty { multiplier: 1.0, expires_at: None };

    pub fn until(multiplier: f64, expires_at: Instant) -> Self {
        Self { multiplier, expires_at: Some(expires_at) }
    }

    pub fn is_active(&self, now: Instant) -> bool {
        self.multiplier > 1.0 && self.expires_at.map_or(true, |t| now < t)
    }
}

impl Default for Penalty {
    fn default() -> Self { Self::NONE }
}

/// How a request's stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Rejected(LimitReason),
    BackendFailed(String),
    /// The reader went away mid-decode.
    Abandoned,
    Shutdown,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed => "completed",
            Outcome::Rejected(_) => "rejected",
            Outcome::BackendFailed(_) => "backend_failed",
            Outcome::Abandoned => "abandoned",
            Outcome::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Delta(String),
    End(Outcome),
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub tenant: String,
    pub prompt: String,
    pub est_tokens: usize,
    pub prefix_hit_prob: f64,
    pub penalty: Penalty,
    pub opts: DecodeOptions,
}

impl SubmitRequest {
    /// Neutral submission: estimated cost, no prefix signal, no penalty.
    pub fn new(tenant: impl Into<String>, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        Self {
            tenant: tenant.into(),
            est_tokens: estimate_tokens(&prompt),
            prompt,
            prefix_hit_prob: 0.0,
            penalty: Penalty::NONE,
            opts: DecodeOptions::default(),
        }
    }
}

pub struct RequestContext {
    pub id: RequestId,
    pub tenant: String,
    pub prompt: String,
    pub est_tokens: usize,
    pub prefix_hit_prob: f64,
    pub created_at: Instant,
    pub penalty: Penalty,
    pub opts: DecodeOptions,
    out: Mutex<Option<mpsc::UnboundedSender<StreamEvent>>>,
    done: AtomicBool,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("est_tokens", &self.est_tokens)
            .field("prefix_hit_prob", &self.prefix_hit_prob)
            .field("penalty", &self.penalty)
            .field("done", &self.is_done())
            .finish()
    }
}

impl RequestContext {
    pub fn new(req: SubmitRequest) -> (Arc<Self>, RequestStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(Self {
            id: RequestId::new(),
            tenant: req.tenant,
            prompt: req.prompt,
            est_tokens: req.est_tokens.max(1),
            prefix_hit_prob: req.prefix_hit_prob.clamp(0.0, 1.0),
            created_at: Instant::now(),
            penalty: req.penalty,
            opts: req.opts,
            out: Mutex::new(Some(tx)),
            done: AtomicBool::new(false),
        });
        let stream = RequestStream { ctx: ctx.clone(), rx, outcome: None };
        (ctx, stream)
    }

    pub fn is_done(&self) -> bool { self.done.load(Ordering::Acquire) }

    /// The [`RequestStream`] was dropped before the request finished.
    pub fn reader_gone(&self) -> bool {
        self.out.lock().as_ref().map_or(false, |tx| tx.is_closed())
    }

    /// False once the reader is gone or the request already finished.
    pub(crate) fn push(&self, delta: String) -> bool {
        match self.out.lock().as_ref() {
            Some(tx) => tx.send(StreamEvent::Delta(delta)).is_ok(),
            None => false,
        }
    }

    /// Sends the terminal event and closes the channel. Only the first call has any effect.
    pub(crate) fn finish(&self, outcome: Outcome) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(tx) = self.out.lock().take() {
            let _ = tx.send(StreamEvent::End(outcome));
        }
        true
    }
}

/// Reader half of a request. Yields text fragments in production order and ends
/// after the last one; the terminal status is available from [`RequestStream::outcome`].
///
/// The terminal event always trails every fragment in the channel, so a finished
/// request never drops a buffered chunk.
#[derive(Debug)]
pub struct RequestStream {
    ctx: Arc<RequestContext>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    outcome: Option<Outcome>,
}

impl RequestStream {
    pub fn id(&self) -> RequestId { self.ctx.id }
    pub fn context(&self) -> &RequestContext { &self.ctx }

    /// `None` until the stream has been read to its end.
    pub fn outcome(&self) -> Option<&Outcome> { self.outcome.as_ref() }

    /// Nothing left to read.
    pub fn is_drained(&self) -> bool { self.rx.is_empty() }

    /// Reads to the end and concatenates the fragments.
    ///
    /// A decode-time rejection becomes [`ServeError::RateLimited`] and a request
    /// cut off by shutdown becomes [`ServeError::SchedulerStopped`]. A backend
    /// failure keeps whatever text arrived before it.
    pub async fn into_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(delta) = self.next().await {
            text.push_str(&delta);
        }
        match self.outcome {
            Some(Outcome::Rejected(reason)) => {
                Err(ServeError::RateLimited { tenant: self.ctx.tenant.clone(), reason })
            }
            Some(Outcome::Shutdown) | None => Err(ServeError::SchedulerStopped),
            _ => Ok(text),
        }
    }
}

impl Stream for RequestStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(StreamEvent::Delta(delta))) => return Poll::Ready(Some(delta)),
                Poll::Ready(Some(StreamEvent::End(outcome))) => this.outcome = Some(outcome),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
