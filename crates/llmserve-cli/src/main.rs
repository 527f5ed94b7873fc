use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use llmserve_api::worker::{decode_app_from_config, stub_prefill_app};
use llmserve_api::{build_state, routes};
use llmserve_backend::{strategy, DecodeOptions};
use llmserve_common::config::ServeConfig;
use opentelemetry_otlp::WithExportConfig;
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "llmserve", version, about = "LLM inference router")]
struct Cli {
    /// Manifest path; falls back to LLMSERVE_CONFIG, then built-in defaults.
    #[arg(short, long, global = true, env = "LLMSERVE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the router API.
    Up(ListenArgs),
    PrefillWorker(ListenArgs),
    DecodeWorker(ListenArgs),
    /// Validate the manifest and print what would run.
    Check,
    /// One completion through an in-process router.
    Run(RunArgs),
    Version,
}

#[derive(Args, Debug)]
struct ListenArgs {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
    /// Defaults to the role's port from the manifest.
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long)]
    prompt: String,
    #[arg(short = 'n', long, default_value_t = 128)]
    max_tokens: u32,
    #[arg(short, long)]
    tenant: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::Up(args) => up(&cfg, args).await,
        Commands::PrefillWorker(args) => {
            let addr = listen_addr(&args, cfg.deployment.prefill_port)?;
            serve(addr, stub_prefill_app(), "prefill worker").await
        }
        Commands::DecodeWorker(args) => {
            let addr = listen_addr(&args, cfg.deployment.decode_port)?;
            serve(addr, decode_app_from_config(&cfg)?, "decode worker").await
        }
        Commands::Check => check(&cfg),
        Commands::Run(args) => run_local(&cfg, args).await,
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<ServeConfig> {
    let cfg = match path {
        Some(path) => ServeConfig::from_path(path).with_context(|| format!("loading {}", path.display()))?,
        None => ServeConfig::load().context("loading config from environment")?,
    };
    Ok(cfg)
}

fn listen_addr(args: &ListenArgs, default_port: u16) -> anyhow::Result<SocketAddr> {
    let port = args.port.unwrap_or(default_port);
    format!("{}:{port}", args.host).parse().with_context(|| format!("bad listen address {}:{port}", args.host))
}

async fn up(cfg: &ServeConfig, args: ListenArgs) -> anyhow::Result<()> {
    let addr = listen_addr(&args, cfg.deployment.router_port)?;
    let state = build_state(cfg)?;
    let router = state.router().clone();
    let result = serve(addr, routes(state), "router").await;
    router.stop().await;
    result
}

async fn serve(addr: SocketAddr, app: axum::Router, role: &'static str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(role, "listening on http://{addr}");
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(role, "shutdown signal received");
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}

fn check(cfg: &ServeConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    println!("model: {}", cfg.primary_model());
    println!("decode strategy: {:?} (registered: {})", cfg.decode_strategy, strategy::registered().join(", "));
    if cfg.deployment.disaggregated {
        println!("backend: {:?} (prefill={}, decode={})", cfg.disagg.provider, cfg.rpc.prefill_service, cfg.rpc.decode_service);
    } else {
        println!("backend: local x{}", cfg.deployment.replicas_for("decode"));
    }
    let mut tenants: Vec<_> = cfg.scheduling.rate_limits.keys().collect();
    tenants.sort();
    for tenant in tenants {
        let rl = &cfg.scheduling.rate_limits[tenant];
        println!(
            "tenant {tenant}: weight={} tokens_per_sec={} burst={} max_concurrency={} on_exhaustion={:?}",
            cfg.scheduling.tenant_weight(tenant),
            rl.tokens_per_sec,
            rl.burst,
            rl.max_concurrency,
            rl.on_exhaustion
        );
    }
    Ok(())
}

async fn run_local(cfg: &ServeConfig, args: RunArgs) -> anyhow::Result<()> {
    let state = build_state(cfg)?;
    let router = state.router();
    let opts = DecodeOptions { max_tokens: Some(args.max_tokens), ..Default::default() };
    let mut s = router.submit_and_stream(args.prompt, args.tenant.as_deref(), opts)?;
    while let Some(delta) = s.next().await {
        print!("{delta}");
    }
    println!();
    if let Some(outcome) = s.outcome() {
        tracing::debug!(outcome = outcome.label(), "request finished");
    }
    router.stop().await;
    Ok(())
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );

    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic().with_endpoint(endpoint))
            .install_simple()
            .ok();
        if let Some(tracer) = tracer {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .with(OpenTelemetryLayer::new(tracer))
                .init();
            return;
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
