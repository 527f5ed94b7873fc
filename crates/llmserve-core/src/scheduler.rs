//! Fair-share request scheduler.
//!
//! One loop owns two min-heaps (prefill and decode work items) keyed by a
//! fairness score; lower runs first. Prefill is issued in fixed-size chunks so a
//! long prompt never monopolizes the loop, and decodes are dispatched through the
//! rate limiter. Submissions arrive over a channel, so an idle loop sleeps until
//! either new work or the next deferred retry is due.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use llmserve_common::config::{SchedulingConfig, SchedulingPolicies};
use llmserve_common::{Result, ServeError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::callbacks::SchedulerCallbacks;
use crate::metrics::RouterMetrics;
use crate::ratelimit::{AdmissionError, RateLimiter};
use crate::request::{Outcome, RequestContext, RequestId, RequestStream, SubmitRequest};

/// Multiplier for requests whose prompt head is likely cached.
pub const PREFIX_DISCOUNT: f64 = 0.7;
/// Decode work outranks prefill work of equal cost.
pub const DECODE_BIAS: f64 = 0.9;
/// Floor of the aging multiplier.
pub const AGING_FLOOR: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    Prefill,
    Decode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Work {
    Prefill { offset: usize },
    Decode,
}

impl Work {
    fn kind(self) -> WorkKind {
        match self {
            Work::Prefill { .. } => WorkKind::Prefill,
            Work::Decode => WorkKind::Decode,
        }
    }
}

/// Fairness score of a work item; lower is served first.
///
/// Cost is estimated tokens over tenant weight, so short requests from heavy
/// tenants go first. Likely prefix hits, aging and decode work lower the score;
/// an active submission penalty raises it. A non-positive weight counts as 1.
pub fn score(ctx: &RequestContext, kind: WorkKind, weight: f64, policies: &SchedulingPolicies, now: Instant) -> f64 {
    let weight = if weight > 0.0 { weight } else { 1.0 };
    let mut score = ctx.est_tokens as f64 / weight;
    if policies.prefix_awareness && ctx.prefix_hit_prob > 0.5 {
        score *= PREFIX_DISCOUNT;
    }
    if ctx.penalty.is_active(now) {
        score *= ctx.penalty.multiplier;
    }
    if policies.aging_seconds > 0.0 {
        score *= aging_factor(now.saturating_duration_since(ctx.created_at), policies.aging_seconds);
    }
    if kind == WorkKind::Decode {
        score *= DECODE_BIAS;
    }
    score
}

/// Linear from 1.0 at submission down to [`AGING_FLOOR`] after `aging_seconds`.
pub fn aging_factor(waited: Duration, aging_seconds: f64) -> f64 {
    let progress = (waited.as_secs_f64() / aging_seconds).min(1.0);
    (1.0 - progress * (1.0 - AGING_FLOOR)).max(AGING_FLOOR)
}

#[derive(Debug)]
struct ScoredItem {
    score: f64,
    seq: u64,
    req_id: RequestId,
    work: Work,
}

// BinaryHeap is a max-heap: the "greatest" item is the lowest score, earliest arrival.
impl Ord for ScoredItem {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.score.total_cmp(&self.score).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for ScoredItem {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> { Some(self.cmp(other)) }
}

impl PartialEq for ScoredItem {
    fn eq(&self, other: &Self) -> bool { self.cmp(other) == CmpOrdering::Equal }
}

impl Eq for ScoredItem {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Served,
    Deferred,
    Rejected,
}

enum Wake {
    Submitted(Option<Arc<RequestContext>>),
    RetryDue,
    Shutdown,
}

/// Submission side of a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<Arc<RequestContext>>,
    in_flight: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    /// Registers the request and returns its stream. Never blocks.
    pub fn submit(&self, req: SubmitRequest) -> Result<RequestStream> {
        if self.shutdown.is_cancelled() {
            return Err(ServeError::SchedulerStopped);
        }
        let (ctx, stream) = RequestContext::new(req);
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(ctx).is_err() {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(ServeError::SchedulerStopped);
        }
        Ok(stream)
    }

    /// Requests submitted and not yet finished.
    pub fn in_flight(&self) -> usize { self.in_flight.load(Ordering::Acquire) }

    pub fn shutdown(&self) { self.shutdown.cancel() }

    pub fn is_stopped(&self) -> bool { self.shutdown.is_cancelled() || self.tx.is_closed() }
}

pub struct FairShareScheduler {
    config: SchedulingConfig,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn RouterMetrics>,
    rx: mpsc::UnboundedReceiver<Arc<RequestContext>>,
    rx_open: bool,
    shutdown: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    reqs: HashMap<RequestId, Arc<RequestContext>>,
    prefill_q: BinaryHeap<ScoredItem>,
    decode_q: BinaryHeap<ScoredItem>,
    deferred: VecDeque<(Instant, RequestId)>,
    seq: u64,
}

impl FairShareScheduler {
    pub fn new(
        config: &SchedulingConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<dyn RouterMetrics>,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let handle = SchedulerHandle { tx, in_flight: in_flight.clone(), shutdown: shutdown.clone() };
        let scheduler = Self {
            config: config.clone(),
            limiter,
            metrics,
            rx,
            rx_open: true,
            shutdown,
            in_flight,
            reqs: HashMap::new(),
            prefill_q: BinaryHeap::new(),
            decode_q: BinaryHeap::new(),
            deferred: VecDeque::new(),
            seq: 0,
        };
        (scheduler, handle)
    }

    /// Builds the scheduler and spawns its loop on the current runtime.
    pub fn spawn(
        config: &SchedulingConfig,
        limiter: Arc<RateLimiter>,
        metrics: Arc<dyn RouterMetrics>,
        callbacks: Arc<dyn SchedulerCallbacks>,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (scheduler, handle) = Self::new(config, limiter, metrics);
        let task = tokio::spawn(scheduler.run(callbacks));
        (handle, task)
    }

    fn policies(&self) -> &SchedulingPolicies { &self.config.policies }

    /// Runs until shutdown, or until every handle is dropped and no work remains.
    /// Anything still queued at exit is finished with [`Outcome::Shutdown`].
    pub async fn run(mut self, callbacks: Arc<dyn SchedulerCallbacks>) {
        let cb = callbacks.as_ref();
        info!(target: "scheduler", backend = cb.backend(), "scheduler started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            self.drain_submissions();
            self.release_due_retries(Instant::now());
            match self.pop_next() {
                Some(item) => self.execute(item, cb).await,
                None => {
                    if !self.wait_for_work().await {
                        break;
                    }
                }
            }
        }
        self.drain_on_exit(cb.backend());
        info!(target: "scheduler", backend = cb.backend(), "scheduler stopped");
    }

    fn drain_submissions(&mut self) {
        while self.rx_open {
            match self.rx.try_recv() {
                Ok(ctx) => self.admit(ctx),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.rx_open = false,
            }
        }
    }

    /// Returns false when there is nothing left to wait for.
    async fn wait_for_work(&mut self) -> bool {
        let next_retry = self.deferred.front().map(|(at, _)| *at);
        if !self.rx_open && next_retry.is_none() {
            return false;
        }
        let shutdown = self.shutdown.clone();
        let rx_open = self.rx_open;
        let wake = tokio::select! {
            _ = shutdown.cancelled() => Wake::Shutdown,
            sub = self.rx.recv(), if rx_open => Wake::Submitted(sub),
            _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)), if next_retry.is_some() => Wake::RetryDue,
        };
        match wake {
            Wake::Shutdown => false,
            Wake::Submitted(Some(ctx)) => {
                self.admit(ctx);
                true
            }
            Wake::Submitted(None) => {
                self.rx_open = false;
                true
            }
            Wake::RetryDue => true,
        }
    }

    fn admit(&mut self, ctx: Arc<RequestContext>) {
        debug!(target: "scheduler", req = %ctx.id, tenant = %ctx.tenant, est_tokens = ctx.est_tokens, "request admitted");
        self.enqueue(&ctx, Work::Prefill { offset: 0 });
        self.reqs.insert(ctx.id, ctx);
    }

    fn enqueue(&mut self, ctx: &RequestContext, work: Work) {
        let kind = work.kind();
        let weight = self.config.tenant_weight(&ctx.tenant);
        let score = score(ctx, kind, weight, self.policies(), Instant::now());
        self.seq += 1;
        let item = ScoredItem { score, seq: self.seq, req_id: ctx.id, work };
        match kind {
            WorkKind::Prefill => self.prefill_q.push(item),
            WorkKind::Decode => self.decode_q.push(item),
        }
        self.report_depth();
    }

    fn report_depth(&self) {
        self.metrics.queue_depth(self.prefill_q.len(), self.decode_q.len() + self.deferred.len());
    }

    fn release_due_retries(&mut self, now: Instant) {
        while let Some(&(at, id)) = self.deferred.front() {
            if at > now {
                break;
            }
            self.deferred.pop_front();
            if let Some(ctx) = self.reqs.get(&id).cloned() {
                self.enqueue(&ctx, Work::Decode);
            }
        }
    }

    fn defer(&mut self, id: RequestId) {
        let delay = Duration::from_millis(self.policies().retry_delay_ms);
        self.deferred.push_back((Instant::now() + delay, id));
        self.report_depth();
    }

    /// Lowest score across both heaps; ties go to decode.
    fn pop_next(&mut self) -> Option<ScoredItem> {
        let take_decode = match (self.prefill_q.peek(), self.decode_q.peek()) {
            (None, None) => return None,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (Some(p), Some(d)) => d.score <= p.score,
        };
        let item = if take_decode { self.decode_q.pop() } else { self.prefill_q.pop() };
        self.report_depth();
        item
    }

    async fn execute(&mut self, item: ScoredItem, cb: &dyn SchedulerCallbacks) {
        let Some(ctx) = self.reqs.get(&item.req_id).cloned() else { return };
        if ctx.reader_gone() {
            debug!(target: "scheduler", req = %ctx.id, "reader gone before dispatch");
            self.complete(&ctx, Outcome::Abandoned, cb.backend());
            return;
        }
        match item.work {
            Work::Prefill { offset } => self.run_prefill(ctx, offset, cb).await,
            Work::Decode => {
                if self.dispatch_decode(ctx, cb).await != Dispatch::Served {
                    return;
                }
                self.fill_decode_slots(cb).await;
            }
        }
    }

    async fn run_prefill(&mut self, ctx: Arc<RequestContext>, offset: usize, cb: &dyn SchedulerCallbacks) {
        let chunk = self.policies().prefill_chunk_tokens.max(1);
        debug!(target: "scheduler", req = %ctx.id, offset, chunk, "prefill chunk");
        if let Err(err) = cb.prefill_chunk(&ctx, offset, chunk).await {
            warn!(target: "scheduler", req = %ctx.id, error = %err, "prefill chunk failed, continuing to decode");
        }
        let next = offset + chunk;
        if self.policies().chunked_prefill && next < ctx.est_tokens {
            self.enqueue(&ctx, Work::Prefill { offset: next });
        } else {
            self.enqueue(&ctx, Work::Decode);
        }
    }

    /// After a served decode, pull up to `min_decode_slots - 1` more decodes.
    async fn fill_decode_slots(&mut self, cb: &dyn SchedulerCallbacks) {
        let mut extra = self.policies().min_decode_slots.saturating_sub(1);
        while extra > 0 {
            let Some(item) = self.decode_q.pop() else { break };
            self.report_depth();
            extra -= 1;
            let Some(ctx) = self.reqs.get(&item.req_id).cloned() else { continue };
            if ctx.reader_gone() {
                debug!(target: "scheduler", req = %ctx.id, "reader gone before extra decode");
                self.complete(&ctx, Outcome::Abandoned, cb.backend());
                continue;
            }
            if self.dispatch_decode(ctx, cb).await == Dispatch::Deferred {
                break;
            }
        }
    }

    async fn dispatch_decode(&mut self, ctx: Arc<RequestContext>, cb: &dyn SchedulerCallbacks) -> Dispatch {
        match self.limiter.acquire_for_decode(&ctx.tenant, ctx.est_tokens).await {
            Ok(permit) => {
                let outcome = self.stream_decode(&ctx, cb).await;
                drop(permit);
                self.complete(&ctx, outcome, cb.backend());
                Dispatch::Served
            }
            Err(AdmissionError::Retry(reason)) => {
                debug!(target: "scheduler", req = %ctx.id, %reason, "decode deferred");
                self.defer(ctx.id);
                Dispatch::Deferred
            }
            Err(AdmissionError::Rejected(reason)) => {
                info!(target: "scheduler", req = %ctx.id, tenant = %ctx.tenant, %reason, "decode rejected");
                self.complete(&ctx, Outcome::Rejected(reason), cb.backend());
                Dispatch::Rejected
            }
        }
    }

    async fn stream_decode(&self, ctx: &Arc<RequestContext>, cb: &dyn SchedulerCallbacks) -> Outcome {
        let backend = cb.backend();
        let mut stream = cb.decode_stream(ctx);
        let mut first = true;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Outcome::Shutdown,
                next = stream.next() => next,
            };
            let Some(piece) = next else { break };
            match piece {
                Ok(delta) => {
                    if first {
                        first = false;
                        self.metrics.first_chunk(backend, ctx.created_at.elapsed());
                    }
                    self.metrics.chunk_streamed(backend, delta.len());
                    if !ctx.push(delta) {
                        debug!(target: "scheduler", req = %ctx.id, "reader gone mid-decode");
                        return Outcome::Abandoned;
                    }
                }
                Err(err) => {
                    warn!(target: "scheduler", req = %ctx.id, backend, error = %err, "decode stream failed");
                    self.metrics.stream_error(backend, "stream");
                    return Outcome::BackendFailed(err.to_string());
                }
            }
        }
        Outcome::Completed
    }

    fn complete(&mut self, ctx: &RequestContext, outcome: Outcome, backend: &str) {
        let label = outcome.label();
        if ctx.finish(outcome) {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            self.metrics.request_completed(backend, label);
        }
        self.reqs.remove(&ctx.id);
    }

    fn drain_on_exit(&mut self, backend: &str) {
        self.rx.close();
        while let Ok(ctx) = self.rx.try_recv() {
            self.reqs.insert(ctx.id, ctx);
        }
        let pending: Vec<_> = self.reqs.values().cloned().collect();
        if !pending.is_empty() {
            info!(target: "scheduler", pending = pending.len(), "finishing queued requests on shutdown");
        }
        for ctx in pending {
            self.complete(&ctx, Outcome::Shutdown, backend);
        }
        self.prefill_q.clear();
        self.decode_q.clear();
        self.deferred.clear();
        self.report_depth();
    }
}
