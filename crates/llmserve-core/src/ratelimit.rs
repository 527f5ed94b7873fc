//! Two-stage per-tenant admission control.
//!
//! * [`RateLimiter::assess`] runs at submission. It never blocks and never rejects;
//!   under `deprioritize` it hands back a score penalty.
//! * [`RateLimiter::acquire_for_decode`] runs when a decode is dispatched. It gates
//!   on a concurrency semaphore and then on the token bucket, and the tenant's
//!   exhaustion policy decides whether a shortfall waits, retries or rejects.
//!
//! Unknown tenants share the `default` lane.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use llmserve_common::config::{ExhaustionPolicy, RateLimitConfig, DEFAULT_TENANT};
use llmserve_common::LimitReason;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::metrics::{NoopMetrics, RouterMetrics};
use crate::request::Penalty;

/// Upper bound on a `queue`-policy wait for tokens.
pub const MAX_TOKEN_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("rejected: {0}")]
    Rejected(LimitReason),
    #[error("retry: {0}")]
    Retry(LimitReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    /// Lane that was charged; `default` for unknown tenants.
    pub tenant: String,
    pub policy: ExhaustionPolicy,
    pub penalty: Penalty,
    pub tokens_deficit: f64,
}

/// Holds one concurrency slot; dropping it returns the slot.
#[derive(Debug)]
pub struct DecodePermit {
    _slot: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct TokenBucket {
    rate: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: f64, now: Instant) -> Self {
        Self { rate, burst, tokens: burst, last: now }
    }

    fn unlimited(&self) -> bool { self.rate <= 0.0 }

    fn refill(&mut self, now: Instant) {
        if self.unlimited() {
            return;
        }
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        if dt > 0.0 {
            self.tokens = (self.tokens + self.rate * dt).min(self.burst);
            self.last = now;
        }
    }

    fn deficit(&self, cost: f64) -> f64 {
        if self.unlimited() { 0.0 } else { (cost - self.tokens).max(0.0) }
    }
}

struct Lane {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
    slots: Arc<Semaphore>,
}

impl Lane {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        let rate = config.tokens_per_sec.max(0.0);
        let burst = match config.burst {
            0 if rate > 0.0 => rate * 2.0,
            b => b as f64,
        };
        let permits = match config.max_concurrency {
            0 => Semaphore::MAX_PERMITS,
            n => n.min(Semaphore::MAX_PERMITS),
        };
        Self { config, bucket: Mutex::new(TokenBucket::new(rate, burst, now)), slots: Arc::new(Semaphore::new(permits)) }
    }
}

pub struct RateLimiter {
    lanes: HashMap<String, Lane>,
    fallback: Lane,
    metrics: Arc<dyn RouterMetrics>,
}

impl RateLimiter {
    pub fn new(limits: &HashMap<String, RateLimitConfig>) -> Self {
        Self::with_metrics(limits, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(limits: &HashMap<String, RateLimitConfig>, metrics: Arc<dyn RouterMetrics>) -> Self {
        let now = Instant::now();
        let lanes = limits
            .iter()
            .filter(|(tenant, _)| tenant.as_str() != DEFAULT_TENANT)
            .map(|(tenant, cfg)| (tenant.clone(), Lane::new(cfg.clone(), now)))
            .collect();
        let fallback = Lane::new(limits.get(DEFAULT_TENANT).cloned().unwrap_or_default(), now);
        Self { lanes, fallback, metrics }
    }

    fn lane(&self, tenant: &str) -> (&str, &Lane) {
        match self.lanes.get_key_value(tenant) {
            Some((name, lane)) => (name.as_str(), lane),
            None => (DEFAULT_TENANT, &self.fallback),
        }
    }

    pub fn policy(&self, tenant: &str) -> ExhaustionPolicy { self.lane(tenant).1.config.on_exhaustion }

    /// Tokens currently in the tenant's bucket, after a lazy refill.
    pub fn available_tokens(&self, tenant: &str) -> f64 {
        let (_, lane) = self.lane(tenant);
        let mut bucket = lane.bucket.lock();
        bucket.refill(Instant::now());
        bucket.tokens
    }

    pub fn available_slots(&self, tenant: &str) -> usize { self.lane(tenant).1.slots.available_permits() }

    /// Submission-time check. Does not consume tokens.
    pub fn assess(&self, tenant: &str, est_tokens: usize) -> Assessment {
        let (name, lane) = self.lane(tenant);
        let now = Instant::now();
        let deficit = {
            let mut bucket = lane.bucket.lock();
            bucket.refill(now);
            bucket.deficit(est_tokens as f64)
        };
        let cfg = &lane.config;
        let penalty = if cfg.on_exhaustion == ExhaustionPolicy::Deprioritize && deficit > 0.0 {
            Penalty::until(cfg.deprioritize_multiplier, now + Duration::from_millis(cfg.penalty_window_ms))
        } else {
            Penalty::NONE
        };
        Assessment { tenant: name.to_string(), policy: cfg.on_exhaustion, penalty, tokens_deficit: deficit }
    }

    /// Decode-time admission. The returned permit must live until the decode ends.
    ///
    /// Under `deprioritize` a decode larger than the bucket is charged a full
    /// bucket, so it is admitted once the bucket refills.
    pub async fn acquire_for_decode(&self, tenant: &str, cost_tokens: usize) -> Result<DecodePermit, AdmissionError> {
        let (name, lane) = self.lane(tenant);
        let policy = lane.config.on_exhaustion;

        let slot = match policy {
            ExhaustionPolicy::Queue => lane
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| AdmissionError::Rejected(LimitReason::Concurrency))?,
            ExhaustionPolicy::Reject => match lane.slots.clone().try_acquire_owned() {
                Ok(slot) => slot,
                Err(_) => return Err(self.reject(name, LimitReason::Concurrency)),
            },
            ExhaustionPolicy::Deprioritize => match lane.slots.clone().try_acquire_owned() {
                Ok(slot) => slot,
                Err(_) => return Err(self.retry(name, LimitReason::Concurrency)),
            },
        };

        let (deficit, rate) = {
            let mut bucket = lane.bucket.lock();
            bucket.refill(Instant::now());
            // A retried decode can never see more than a full bucket.
            let cost = match policy {
                ExhaustionPolicy::Deprioritize if !bucket.unlimited() => (cost_tokens as f64).min(bucket.burst),
                _ => cost_tokens as f64,
            };
            let deficit = bucket.deficit(cost);
            if deficit == 0.0 && !bucket.unlimited() {
                bucket.tokens -= cost;
            }
            (deficit, bucket.rate)
        };
        if deficit == 0.0 {
            return Ok(DecodePermit { _slot: slot });
        }

        match policy {
            ExhaustionPolicy::Reject => {
                drop(slot);
                Err(self.reject(name, LimitReason::Tokens))
            }
            ExhaustionPolicy::Deprioritize => {
                drop(slot);
                Err(self.retry(name, LimitReason::Tokens))
            }
            ExhaustionPolicy::Queue => {
                // Best effort: one wait for the projected refill, then charge what is there.
                let wait = Duration::from_secs_f64((deficit / rate.max(1e-6)).min(MAX_TOKEN_WAIT.as_secs_f64()));
                tracing::debug!(target: "ratelimit", tenant = name, ?wait, "waiting for tokens");
                tokio::time::sleep(wait).await;
                let mut bucket = lane.bucket.lock();
                bucket.refill(Instant::now());
                bucket.tokens = (bucket.tokens - cost_tokens as f64).max(0.0);
                Ok(DecodePermit { _slot: slot })
            }
        }
    }

    fn reject(&self, tenant: &str, reason: LimitReason) -> AdmissionError {
        tracing::debug!(target: "ratelimit", tenant, %reason, "decode rejected");
        self.metrics.rate_limit_rejected(tenant, reason.as_str());
        AdmissionError::Rejected(reason)
    }

    fn retry(&self, tenant: &str, reason: LimitReason) -> AdmissionError {
        tracing::debug!(target: "ratelimit", tenant, %reason, "decode deferred");
        self.metrics.rate_limit_retried(tenant, reason.as_str());
        AdmissionError::Retry(reason)
    }
}
