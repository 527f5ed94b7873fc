use std::time::Duration;

use llmserve_core::RouterMetrics;
use llmserve_obs::PrometheusMetrics;

#[test]
fn observations_show_up_in_the_exposition() {
    let m = PrometheusMetrics::new().unwrap();
    m.request_accepted("local", "acme");
    m.rate_limit_rejected("acme", "tokens@submit");
    m.queue_depth(3, 1);
    m.first_chunk("local", Duration::from_millis(40));
    m.chunk_streamed("local", 10);
    m.request_completed("local", "completed");

    let text = m.encode().unwrap();
    assert!(text.contains(r#"llmserve_requests_accepted_total{backend="local",tenant="acme"} 1"#), "{text}");
    assert!(text.contains(r#"llmserve_rate_limit_rejects_total{reason="tokens@submit",tenant="acme"} 1"#), "{text}");
    assert!(text.contains("llmserve_q_prefill_depth 3"));
    assert!(text.contains("llmserve_ttft_seconds_count 1"));
    assert!(text.contains(r#"llmserve_stream_bytes_total{backend="local"} 10"#));
    assert!(text.contains(r#"llmserve_stream_tokens_total{backend="local"} 2"#));
    assert!(text.contains(r#"llmserve_requests_completed_total{backend="local",outcome="completed"} 1"#));
}

#[test]
fn registries_are_independent() {
    let a = PrometheusMetrics::new().unwrap();
    let b = PrometheusMetrics::new().unwrap();
    a.stream_error("rpc", "stream");
    assert!(a.encode().unwrap().contains("llmserve_stream_errors_total"));
    assert!(!b.encode().unwrap().contains("llmserve_stream_errors_total{"));
    assert!(a.content_type().starts_with("text/plain"));
}
