use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use llmserve_backend::TextStream;
use llmserve_common::config::{ExhaustionPolicy, RateLimitConfig, SchedulingConfig, TenantShare};
use llmserve_common::{LimitReason, Result, ServeError};
use llmserve_core::metrics::{NoopMetrics, RouterMetrics};
use llmserve_core::scheduler::{aging_factor, score, FairShareScheduler, WorkKind};
use llmserve_core::{Outcome, RateLimiter, RequestContext, RequestStream, SchedulerCallbacks, SubmitRequest};
use tokio::time::Instant;

#[derive(Default)]
struct Recording {
    prefills: Mutex<Vec<(usize, usize, usize)>>,
    decodes: Mutex<Vec<usize>>,
}

#[async_trait]
impl SchedulerCallbacks for Recording {
    fn backend(&self) -> &'static str { "test" }

    async fn prefill_chunk(&self, ctx: &RequestContext, start: usize, n: usize) -> Result<()> {
        self.prefills.lock().unwrap().push((ctx.est_tokens, start, n));
        Ok(())
    }

    fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream {
        self.decodes.lock().unwrap().push(ctx.est_tokens);
        let parts = vec![Ok(format!("tokens={}", ctx.est_tokens)), Ok(" done".to_string())];
        stream::iter(parts).boxed()
    }
}

/// Emits one fragment, then fails.
struct Flaky;

#[async_trait]
impl SchedulerCallbacks for Flaky {
    fn backend(&self) -> &'static str { "flaky" }

    async fn prefill_chunk(&self, _ctx: &RequestContext, _start: usize, _n: usize) -> Result<()> {
        Err(ServeError::Backend("prefill worker down".into()))
    }

    fn decode_stream(&self, _ctx: &Arc<RequestContext>) -> TextStream {
        stream::iter(vec![Ok("partial".to_string()), Err(ServeError::Backend("boom".into()))]).boxed()
    }
}

#[derive(Default)]
struct Counting {
    retried: AtomicUsize,
    rejected: AtomicUsize,
    completed: Mutex<Vec<String>>,
}

impl RouterMetrics for Counting {
    fn rate_limit_retried(&self, _tenant: &str, _reason: &str) { self.retried.fetch_add(1, Ordering::Relaxed); }
    fn rate_limit_rejected(&self, _tenant: &str, _reason: &str) { self.rejected.fetch_add(1, Ordering::Relaxed); }
    fn request_completed(&self, _backend: &str, outcome: &str) { self.completed.lock().unwrap().push(outcome.to_string()); }
}

fn chars(n: usize) -> String { "a".repeat(n) }

async fn drain(mut s: RequestStream) -> (String, Option<Outcome>) {
    let mut text = String::new();
    while let Some(delta) = s.next().await {
        text.push_str(&delta);
    }
    (text, s.outcome().cloned())
}

fn limits(tenant: &str, cfg: RateLimitConfig) -> HashMap<String, RateLimitConfig> {
    HashMap::from([(tenant.to_string(), cfg)])
}

#[tokio::test(start_paused = true)]
async fn shortest_request_decodes_first() {
    let cfg = SchedulingConfig::default();
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    let long = handle.submit(SubmitRequest::new("default", chars(4000))).unwrap();
    let medium = handle.submit(SubmitRequest::new("default", chars(400))).unwrap();
    let short = handle.submit(SubmitRequest::new("default", chars(40))).unwrap();

    let cb = Arc::new(Recording::default());
    let task = tokio::spawn(scheduler.run(cb.clone()));
    let (text, outcome) = drain(long).await;
    assert_eq!(text, "tokens=1000 done");
    assert_eq!(outcome, Some(Outcome::Completed));
    drain(medium).await;
    drain(short).await;

    assert_eq!(*cb.decodes.lock().unwrap(), vec![10, 100, 1000]);
    let long_chunks: Vec<_> = cb.prefills.lock().unwrap().iter().filter(|p| p.0 == 1000).map(|p| (p.1, p.2)).collect();
    assert_eq!(long_chunks, vec![(0, 512), (512, 512)]);
    assert_eq!(handle.in_flight(), 0);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unchunked_prefill_is_one_call() {
    let mut cfg = SchedulingConfig::default();
    cfg.policies.chunked_prefill = false;
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    let s = handle.submit(SubmitRequest::new("default", chars(8000))).unwrap();
    let cb = Arc::new(Recording::default());
    tokio::spawn(scheduler.run(cb.clone()));
    drain(s).await;
    assert_eq!(*cb.prefills.lock().unwrap(), vec![(2000, 0, 512)]);
}

#[tokio::test(start_paused = true)]
async fn heavier_tenant_goes_first_at_equal_cost() {
    let mut cfg = SchedulingConfig::default();
    cfg.fair_share.tenants.insert("gold".into(), TenantShare { weight: 4.0 });
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    let bronze = handle.submit(SubmitRequest::new("bronze", chars(400))).unwrap();
    let gold = handle.submit(SubmitRequest::new("gold", chars(800))).unwrap();
    let gold_id = gold.id();

    let order = Arc::new(Mutex::new(Vec::new()));
    struct Tracking(Arc<Mutex<Vec<String>>>);
    #[async_trait]
    impl SchedulerCallbacks for Tracking {
        fn backend(&self) -> &'static str { "test" }
        async fn prefill_chunk(&self, _ctx: &RequestContext, _s: usize, _n: usize) -> Result<()> { Ok(()) }
        fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream {
            self.0.lock().unwrap().push(ctx.id.to_string());
            stream::iter(vec![Ok("x".to_string())]).boxed()
        }
    }
    tokio::spawn(scheduler.run(Arc::new(Tracking(order.clone()))));
    drain(bronze).await;
    drain(gold).await;
    assert_eq!(order.lock().unwrap()[0], gold_id.to_string());
}

#[tokio::test(start_paused = true)]
async fn deprioritized_decode_is_retried_until_tokens_refill() {
    let cfg = SchedulingConfig {
        rate_limits: limits(
            "t",
            RateLimitConfig { tokens_per_sec: 10.0, burst: 10, on_exhaustion: ExhaustionPolicy::Deprioritize, ..Default::default() },
        ),
        ..Default::default()
    };
    let metrics = Arc::new(Counting::default());
    let limiter = Arc::new(RateLimiter::with_metrics(&cfg.rate_limits, metrics.clone()));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, metrics.clone());
    let first = handle.submit(SubmitRequest::new("t", chars(40))).unwrap();
    let second = handle.submit(SubmitRequest::new("t", chars(40))).unwrap();
    tokio::spawn(scheduler.run(Arc::new(Recording::default())));

    let start = Instant::now();
    assert_eq!(drain(first).await.1, Some(Outcome::Completed));
    assert_eq!(drain(second).await.1, Some(Outcome::Completed));
    assert!(start.elapsed() >= Duration::from_millis(900));
    assert!(metrics.retried.load(Ordering::Relaxed) > 0);
    assert_eq!(metrics.rejected.load(Ordering::Relaxed), 0);
}

#[tokio::test(start_paused = true)]
async fn deprioritized_decode_above_burst_still_completes() {
    let cfg = SchedulingConfig {
        rate_limits: limits(
            "t",
            RateLimitConfig { tokens_per_sec: 10.0, burst: 10, on_exhaustion: ExhaustionPolicy::Deprioritize, ..Default::default() },
        ),
        ..Default::default()
    };
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    let s = handle.submit(SubmitRequest::new("t", chars(400))).unwrap();
    let cb = Arc::new(Recording::default());
    tokio::spawn(scheduler.run(cb.clone()));

    let (text, outcome) = tokio::time::timeout(Duration::from_secs(600), drain(s)).await.expect("decode admitted");
    assert_eq!(text, "tokens=100 done");
    assert_eq!(outcome, Some(Outcome::Completed));
    assert_eq!(*cb.decodes.lock().unwrap(), vec![100]);
}

/// Prefill takes 100ms; decode behaves like [`Recording`].
#[derive(Default)]
struct SlowPrefill(Recording);

#[async_trait]
impl SchedulerCallbacks for SlowPrefill {
    fn backend(&self) -> &'static str { "slow" }

    async fn prefill_chunk(&self, _ctx: &RequestContext, _start: usize, _n: usize) -> Result<()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn decode_stream(&self, ctx: &Arc<RequestContext>) -> TextStream { self.0.decode_stream(ctx) }
}

#[tokio::test(start_paused = true)]
async fn extra_decode_slot_skips_dropped_reader() {
    let cfg = SchedulingConfig::default();
    let metrics = Arc::new(Counting::default());
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, metrics.clone());
    let cb = Arc::new(SlowPrefill::default());
    let long = handle.submit(SubmitRequest::new("default", "b".repeat(400))).unwrap();
    let task = tokio::spawn(scheduler.run(cb.clone()));

    // The long decode is queued while the short prefill runs.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let short = handle.submit(SubmitRequest::new("default", chars(40))).unwrap();
    tokio::time::sleep(Duration::from_millis(140)).await;
    drop(long);

    let (text, outcome) = drain(short).await;
    assert_eq!(text, "tokens=10 done");
    assert_eq!(outcome, Some(Outcome::Completed));
    handle.shutdown();
    task.await.unwrap();

    assert_eq!(*cb.0.decodes.lock().unwrap(), vec![10]);
    let completed = metrics.completed.lock().unwrap();
    assert!(completed.contains(&"abandoned".to_string()), "{completed:?}");
    assert_eq!(handle.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn decode_rejection_ends_stream_without_text() {
    let cfg = SchedulingConfig {
        rate_limits: limits(
            "t",
            RateLimitConfig { tokens_per_sec: 1.0, burst: 5, on_exhaustion: ExhaustionPolicy::Reject, ..Default::default() },
        ),
        ..Default::default()
    };
    let metrics = Arc::new(Counting::default());
    let limiter = Arc::new(RateLimiter::with_metrics(&cfg.rate_limits, metrics.clone()));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, metrics.clone());
    let s = handle.submit(SubmitRequest::new("t", chars(40))).unwrap();
    let cb = Arc::new(Recording::default());
    tokio::spawn(scheduler.run(cb.clone()));

    let (text, outcome) = drain(s).await;
    assert!(text.is_empty());
    assert_eq!(outcome, Some(Outcome::Rejected(LimitReason::Tokens)));
    assert!(cb.decodes.lock().unwrap().is_empty());
    assert_eq!(*metrics.completed.lock().unwrap(), vec!["rejected".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn backend_failure_keeps_partial_text() {
    let cfg = SchedulingConfig::default();
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    let s = handle.submit(SubmitRequest::new("default", "hi there")).unwrap();
    tokio::spawn(scheduler.run(Arc::new(Flaky)));

    let (text, outcome) = drain(s).await;
    assert_eq!(text, "partial");
    assert_eq!(outcome, Some(Outcome::BackendFailed("backend: boom".into())));
}

#[tokio::test(start_paused = true)]
async fn dropped_reader_is_skipped() {
    let cfg = SchedulingConfig::default();
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    drop(handle.submit(SubmitRequest::new("default", chars(100))).unwrap());
    let kept = handle.submit(SubmitRequest::new("default", chars(200))).unwrap();
    let cb = Arc::new(Recording::default());
    tokio::spawn(scheduler.run(cb.clone()));

    drain(kept).await;
    assert_eq!(*cb.decodes.lock().unwrap(), vec![50]);
    assert_eq!(handle.in_flight(), 0);
}

#[tokio::test]
async fn shutdown_finishes_queued_requests() {
    let cfg = SchedulingConfig::default();
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    let s = handle.submit(SubmitRequest::new("default", "never served")).unwrap();
    handle.shutdown();
    scheduler.run(Arc::new(Recording::default())).await;

    assert_eq!(drain(s).await, (String::new(), Some(Outcome::Shutdown)));
    assert!(matches!(handle.submit(SubmitRequest::new("default", "late")), Err(ServeError::SchedulerStopped)));
    assert_eq!(handle.in_flight(), 0);
}

#[tokio::test]
async fn loop_exits_when_handles_are_dropped() {
    let cfg = SchedulingConfig::default();
    let limiter = Arc::new(RateLimiter::new(&cfg.rate_limits));
    let (scheduler, handle) = FairShareScheduler::new(&cfg, limiter, Arc::new(NoopMetrics));
    drop(handle);
    tokio::time::timeout(Duration::from_secs(1), scheduler.run(Arc::new(Recording::default())))
        .await
        .expect("loop should exit");
}

fn ctx_with(prompt_chars: usize, prefix_hit_prob: f64) -> Arc<RequestContext> {
    let mut req = SubmitRequest::new("default", chars(prompt_chars));
    req.prefix_hit_prob = prefix_hit_prob;
    RequestContext::new(req).0
}

#[test]
fn score_scales_with_cost_and_weight() {
    let mut cfg = SchedulingConfig::default();
    cfg.policies.aging_seconds = 0.0;
    let now = Instant::now();
    let small = ctx_with(40, 0.0);
    let big = ctx_with(4000, 0.0);
    let p = &cfg.policies;
    assert_eq!(score(&small, WorkKind::Prefill, 1.0, p, now), 10.0);
    assert_eq!(score(&big, WorkKind::Prefill, 1.0, p, now), 1000.0);
    assert_eq!(score(&big, WorkKind::Prefill, 4.0, p, now), 250.0);
    assert_eq!(score(&big, WorkKind::Prefill, 0.0, p, now), 1000.0, "non-positive weight counts as 1");
    assert!((score(&big, WorkKind::Decode, 1.0, p, now) - 900.0).abs() < 1e-9);
}

#[test]
fn likely_prefix_hits_are_discounted() {
    let mut cfg = SchedulingConfig::default();
    cfg.policies.aging_seconds = 0.0;
    let now = Instant::now();
    let cold = score(&ctx_with(400, 0.5), WorkKind::Prefill, 1.0, &cfg.policies, now);
    let warm = score(&ctx_with(400, 0.7), WorkKind::Prefill, 1.0, &cfg.policies, now);
    assert_eq!(cold, 100.0);
    assert!((warm - 70.0).abs() < 1e-9);

    cfg.policies.prefix_awareness = false;
    assert_eq!(score(&ctx_with(400, 0.9), WorkKind::Prefill, 1.0, &cfg.policies, now), 100.0);
}

#[test]
fn penalty_applies_only_inside_its_window() {
    let mut cfg = SchedulingConfig::default();
    cfg.policies.aging_seconds = 0.0;
    let now = Instant::now();
    let mut req = SubmitRequest::new("default", chars(400));
    req.penalty = llmserve_core::request::Penalty::until(1.25, now + Duration::from_secs(1));
    let (ctx, _stream) = RequestContext::new(req);
    assert!((score(&ctx, WorkKind::Prefill, 1.0, &cfg.policies, now) - 125.0).abs() < 1e-9);
    let later = now + Duration::from_secs(2);
    assert_eq!(score(&ctx, WorkKind::Prefill, 1.0, &cfg.policies, later), 100.0);
}

#[test]
fn aging_is_bounded() {
    assert_eq!(aging_factor(Duration::ZERO, 2.0), 1.0);
    assert!((aging_factor(Duration::from_secs(1), 2.0) - 0.9).abs() < 1e-9);
    assert!((aging_factor(Duration::from_secs(2), 2.0) - 0.8).abs() < 1e-9);
    assert!((aging_factor(Duration::from_secs(60), 2.0) - 0.8).abs() < 1e-9);
}
