//! Prometheus export of router metrics.

use std::time::Duration;

use llmserve_core::RouterMetrics;
use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static ENCODER: Lazy<TextEncoder> = Lazy::new(TextEncoder::new);

const TTFT_BUCKETS: &[f64] = &[
    0.01, 0.02, 0.05, 0.075, 0.1, 0.2, 0.35, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 8.0, 12.0, 20.0, 30.0,
];

/// Router metrics in a private registry, so several routers can live in one process.
pub struct PrometheusMetrics {
    registry: Registry,
    ttft: Histogram,
    ttft_by_backend: HistogramVec,
    q_prefill: IntGauge,
    q_decode: IntGauge,
    rate_limit_rejects: IntCounterVec,
    rate_limit_retries: IntCounterVec,
    requests_accepted: IntCounterVec,
    requests_completed: IntCounterVec,
    stream_events: IntCounterVec,
    stream_bytes: IntCounterVec,
    stream_tokens: IntCounterVec,
    stream_errors: IntCounterVec,
}

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> prometheus::Result<C> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<IntCounterVec> {
    register(registry, IntCounterVec::new(Opts::new(name, help), labels)?)
}

impl PrometheusMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let r = Registry::new();
        Ok(Self {
            ttft: register(&r, Histogram::with_opts(HistogramOpts::new("llmserve_ttft_seconds", "Time to first token"))?)?,
            ttft_by_backend: register(
                &r,
                HistogramVec::new(
                    HistogramOpts::new("llmserve_ttft_seconds_by_backend", "Time to first token by backend")
                        .buckets(TTFT_BUCKETS.to_vec()),
                    &["backend"],
                )?,
            )?,
            q_prefill: register(&r, IntGauge::new("llmserve_q_prefill_depth", "Prefill queue depth")?)?,
            q_decode: register(&r, IntGauge::new("llmserve_q_decode_depth", "Decode queue depth")?)?,
            rate_limit_rejects: counter(
                &r,
                "llmserve_rate_limit_rejects_total",
                "Requests rejected due to rate limits",
                &["tenant", "reason"],
            )?,
            rate_limit_retries: counter(
                &r,
                "llmserve_rate_limit_retries_total",
                "Decode reschedules due to rate limits",
                &["tenant", "reason"],
            )?,
            requests_accepted: counter(
                &r,
                "llmserve_requests_accepted_total",
                "Requests accepted by the router",
                &["backend", "tenant"],
            )?,
            requests_completed: counter(
                &r,
                "llmserve_requests_completed_total",
                "Requests finished, by outcome",
                &["backend", "outcome"],
            )?,
            stream_events: counter(&r, "llmserve_stream_events_total", "Streamed fragments", &["backend"])?,
            stream_bytes: counter(&r, "llmserve_stream_bytes_total", "Bytes streamed to clients", &["backend"])?,
            stream_tokens: counter(
                &r,
                "llmserve_stream_tokens_total",
                "Estimated tokens streamed (bytes / 4)",
                &["backend"],
            )?,
            stream_errors: counter(&r, "llmserve_stream_errors_total", "Streaming errors", &["backend", "reason"])?,
            registry: r,
        })
    }

    pub fn registry(&self) -> &Registry { &self.registry }

    pub fn content_type(&self) -> String { ENCODER.format_type().to_string() }

    /// Text exposition of everything in the registry.
    pub fn encode(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        ENCODER.encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl RouterMetrics for PrometheusMetrics {
    fn request_accepted(&self, backend: &str, tenant: &str) {
        self.requests_accepted.with_label_values(&[backend, tenant]).inc();
    }

    fn rate_limit_rejected(&self, tenant: &str, reason: &str) {
        self.rate_limit_rejects.with_label_values(&[tenant, reason]).inc();
    }

    fn rate_limit_retried(&self, tenant: &str, reason: &str) {
        self.rate_limit_retries.with_label_values(&[tenant, reason]).inc();
    }

    fn queue_depth(&self, prefill: usize, decode: usize) {
        self.q_prefill.set(prefill as i64);
        self.q_decode.set(decode as i64);
    }

    fn first_chunk(&self, backend: &str, ttft: Duration) {
        let secs = ttft.as_secs_f64();
        self.ttft.observe(secs);
        self.ttft_by_backend.with_label_values(&[backend]).observe(secs);
    }

    fn chunk_streamed(&self, backend: &str, bytes: usize) {
        self.stream_events.with_label_values(&[backend]).inc();
        self.stream_bytes.with_label_values(&[backend]).inc_by(bytes as u64);
        self.stream_tokens.with_label_values(&[backend]).inc_by((bytes / 4).max(1) as u64);
    }

    fn stream_error(&self, backend: &str, reason: &str) {
        self.stream_errors.with_label_values(&[backend, reason]).inc();
    }

    fn request_completed(&self, backend: &str, outcome: &str) {
        self.requests_completed.with_label_values(&[backend, outcome]).inc();
    }
}
