use std::time::{Duration, Instant};

#[tokio::main]
async fn main() {
    let n: usize = std::env::var("N").ok().and_then(|v| v.parse().ok()).unwrap_or(16);
    let prompt = std::env::var("PROMPT").unwrap_or_else(|_| "Hello".into());
    let url = std::env::var("URL").unwrap_or_else(|_| "http://127.0.0.1:8000/v1/completions".into());
    let tenants: Vec<String> = std::env::var("TENANTS")
        .unwrap_or_else(|_| "default".into())
        .split(',')
        .map(|t| t.trim().to_string())
        .collect();
    let client = reqwest::Client::new();
    let start = Instant::now();
    let mut tasks = Vec::new();
    for i in 0..n {
        let c = client.clone();
        let p = prompt.clone();
        let u = url.clone();
        let tenant = tenants[i % tenants.len()].clone();
        tasks.push(tokio::spawn(async move {
            let t0 = Instant::now();
            let body = serde_json::json!({"prompt": p});
            let status = c.post(&u).header("x-tenant-id", &tenant).json(&body).send().await.map(|r| r.status().as_u16());
            (tenant, status.unwrap_or(0), t0.elapsed())
        }));
    }
    let mut latencies: Vec<Duration> = Vec::new();
    let mut limited = 0;
    for t in tasks {
        if let Ok((_tenant, status, elapsed)) = t.await {
            match status {
                200 => latencies.push(elapsed),
                429 => limited += 1,
                _ => {}
            }
        }
    }
    latencies.sort();
    let p50 = latencies.get(latencies.len() / 2).copied().unwrap_or_default();
    let p99 = latencies.get(latencies.len() * 99 / 100).copied().unwrap_or_default();
    println!(
        "completed {} requests in {:.2}s: ok={} rate_limited={} p50={:?} p99={:?}",
        n,
        start.elapsed().as_secs_f32(),
        latencies.len(),
        limited,
        p50,
        p99
    );
}
