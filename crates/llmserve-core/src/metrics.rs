use std::time::Duration;

/// Fire-and-forget observation points. Implementations must not fail or block;
/// every method defaults to a no-op.
pub trait RouterMetrics: Send + Sync {
    fn request_accepted(&self, _backend: &str, _tenant: &str) {}
    fn rate_limit_rejected(&self, _tenant: &str, _reason: &str) {}
    fn rate_limit_retried(&self, _tenant: &str, _reason: &str) {}
    fn queue_depth(&self, _prefill: usize, _decode: usize) {}
    fn first_chunk(&self, _backend: &str, _ttft: Duration) {}
    fn chunk_streamed(&self, _backend: &str, _bytes: usize) {}
    fn stream_error(&self, _backend: &str, _reason: &str) {}
    fn request_completed(&self, _backend: &str, _outcome: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl RouterMetrics for NoopMetrics {}
