//! Routing core: fair-share scheduling, tenant rate limits, prefix signal.

pub mod callbacks;
pub mod metrics;
pub mod prefix;
pub mod ratelimit;
pub mod request;
pub mod router;
pub mod scheduler;

pub use callbacks::{LocalCallbacks, SchedulerCallbacks};
pub use metrics::{NoopMetrics, RouterMetrics};
pub use prefix::PrefixHeuristic;
pub use ratelimit::{AdmissionError, RateLimiter};
pub use request::{Outcome, RequestContext, RequestId, RequestStream, SubmitRequest};
pub use router::Router;
pub use scheduler::{FairShareScheduler, SchedulerHandle};
