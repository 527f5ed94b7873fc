//! Front door for completions: admission, prefix signal, then the scheduler.

use std::sync::Arc;
use std::time::Duration;

use llmserve_backend::DecodeOptions;
use llmserve_common::config::{ExhaustionPolicy, SchedulingConfig, DEFAULT_TENANT};
use llmserve_common::{LimitReason, Result, ServeError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::callbacks::SchedulerCallbacks;
use crate::metrics::RouterMetrics;
use crate::prefix::PrefixHeuristic;
use crate::ratelimit::RateLimiter;
use crate::request::{estimate_tokens, RequestStream, SubmitRequest};
use crate::scheduler::{FairShareScheduler, SchedulerHandle};

/// How long [`Router::stop`] waits for the scheduler loop to exit.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Router {
    scheduler: SchedulerHandle,
    limiter: Arc<RateLimiter>,
    prefix: PrefixHeuristic,
    metrics: Arc<dyn RouterMetrics>,
    backend: &'static str,
    queue_max_len: usize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    /// Spawns the scheduler loop; must be called inside a tokio runtime.
    pub fn start(
        config: &SchedulingConfig,
        callbacks: Arc<dyn SchedulerCallbacks>,
        metrics: Arc<dyn RouterMetrics>,
    ) -> Self {
        let backend = callbacks.backend();
        let limiter = Arc::new(RateLimiter::with_metrics(&config.rate_limits, metrics.clone()));
        let (scheduler, task) = FairShareScheduler::spawn(config, limiter.clone(), metrics.clone(), callbacks);
        info!(
            target: "router",
            backend,
            tenants = config.rate_limits.len(),
            queue_max_len = config.policies.queue_max_len,
            "router started"
        );
        Self {
            scheduler,
            limiter,
            prefix: PrefixHeuristic::new(),
            metrics,
            backend,
            queue_max_len: config.policies.queue_max_len,
            task: Mutex::new(Some(task)),
        }
    }

    /// Admits a prompt and returns its fragment stream.
    ///
    /// Fails with [`ServeError::RateLimited`] only when the tenant's policy is
    /// `reject` and its bucket cannot cover the estimate; other policies are
    /// enforced at decode time and show up in the stream's outcome.
    pub fn submit_and_stream(
        &self,
        prompt: impl Into<String>,
        tenant: Option<&str>,
        opts: DecodeOptions,
    ) -> Result<RequestStream> {
        let prompt = prompt.into();
        let tenant = tenant.filter(|t| !t.is_empty()).unwrap_or(DEFAULT_TENANT);
        if self.queue_max_len > 0 && self.scheduler.in_flight() >= self.queue_max_len {
            warn!(target: "router", tenant, limit = self.queue_max_len, "queue full");
            return Err(ServeError::QueueFull { limit: self.queue_max_len });
        }

        let est_tokens = estimate_tokens(&prompt);
        let prefix_hit_prob = self.prefix.observe(&prompt);
        let assessment = self.limiter.assess(tenant, est_tokens);
        if assessment.policy == ExhaustionPolicy::Reject && assessment.tokens_deficit > 0.0 {
            debug!(target: "router", tenant, deficit = assessment.tokens_deficit, "rejected at submission");
            self.metrics.rate_limit_rejected(&assessment.tenant, "tokens@submit");
            return Err(ServeError::RateLimited { tenant: tenant.to_string(), reason: LimitReason::Tokens });
        }

        let stream = self.scheduler.submit(SubmitRequest {
            tenant: tenant.to_string(),
            prompt,
            est_tokens,
            prefix_hit_prob,
            penalty: assessment.penalty,
            opts,
        })?;
        self.metrics.request_accepted(self.backend, tenant);
        debug!(target: "router", req = %stream.id(), tenant, est_tokens, prefix_hit_prob, "request accepted");
        Ok(stream)
    }

    /// Collects the whole completion; see [`RequestStream::into_text`].
    pub async fn complete(&self, prompt: impl Into<String>, tenant: Option<&str>, opts: DecodeOptions) -> Result<String> {
        self.submit_and_stream(prompt, tenant, opts)?.into_text().await
    }

    /// Signals the loop and waits up to [`STOP_TIMEOUT`] for it to exit.
    pub async fn stop(&self) {
        self.scheduler.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(_) => info!(target: "router", backend = self.backend, "router stopped"),
                Err(_) => warn!(target: "router", backend = self.backend, "scheduler did not stop in time"),
            }
        }
    }

    pub fn backend(&self) -> &'static str { self.backend }
    pub fn limiter(&self) -> &RateLimiter { &self.limiter }
    pub fn prefix(&self) -> &PrefixHeuristic { &self.prefix }
    pub fn in_flight(&self) -> usize { self.scheduler.in_flight() }
    pub fn is_running(&self) -> bool { !self.scheduler.is_stopped() }
}
