//! Manifest model for the router, its scheduler and the worker roles.

use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;

use crate::{Result, ServeError};

pub const DEFAULT_TENANT: &str = "default";
pub const MANIFEST_KIND: &str = "LLMServe";

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_yaml::Value>,
    pub spec: ServeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    #[serde(default = "defaults::dtype")]
    pub dtype: String,
    #[serde(default)]
    pub max_model_len: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeStrategy {
    #[default]
    Baseline,
    Speculative,
    Lookahead,
    Hybrid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpecDecodeConfig {
    pub enabled: bool,
    pub num_spec_tokens: usize,
    pub draft_model: Option<String>,
    pub fallback: String,
}

impl Default for SpecDecodeConfig {
    fn default() -> Self {
        Self { enabled: false, num_spec_tokens: 8, draft_model: None, fallback: "baseline".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LookaheadConfig {
    pub enabled: bool,
    pub ngram: usize,
    pub max_parallel: usize,
    /// Registry name of the lookahead implementation, `lookahead` when unset.
    pub plugin: Option<String>,
    pub fallback: String,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self { enabled: false, ngram: 4, max_parallel: 8, plugin: None, fallback: "baseline".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub enabled: bool,
    pub min_decode_tokens: usize,
    pub tenants: Vec<String>,
    pub fallback: String,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self { enabled: false, min_decode_tokens: 512, tenants: Vec::new(), fallback: "baseline".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulingPolicies {
    pub chunked_prefill: bool,
    pub prefill_chunk_tokens: usize,
    pub min_decode_slots: usize,
    pub queue_max_len: usize,
    pub prefix_awareness: bool,
    pub aging_seconds: f64,
    pub retry_delay_ms: u64,
}

impl Default for SchedulingPolicies {
    fn default() -> Self {
        Self {
            chunked_prefill: true,
            prefill_chunk_tokens: 512,
            min_decode_slots: 2,
            queue_max_len: 2000,
            prefix_awareness: true,
            aging_seconds: 2.0,
            retry_delay_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Admit, but worsen the scheduler score for a window; retry decode later.
    #[default]
    Deprioritize,
    /// Wait for capacity.
    Queue,
    /// Refuse outright.
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Refill rate; zero disables token accounting for the tenant.
    pub tokens_per_sec: f64,
    /// Bucket capacity; zero means twice the refill rate.
    pub burst: u64,
    /// Concurrent decodes; zero means unbounded.
    pub max_concurrency: usize,
    pub on_exhaustion: ExhaustionPolicy,
    pub deprioritize_multiplier: f64,
    pub penalty_window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_sec: 0.0,
            burst: 0,
            max_concurrency: 0,
            on_exhaustion: ExhaustionPolicy::Deprioritize,
            deprioritize_multiplier: 1.25,
            penalty_window_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantShare {
    #[serde(default = "defaults::weight")]
    pub weight: f64,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct FairShareConfig {
    pub tenants: HashMap<String, TenantShare>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SchedulingConfig {
    pub fair_share: FairShareConfig,
    pub policies: SchedulingPolicies,
    pub rate_limits: HashMap<String, RateLimitConfig>,
}

impl SchedulingConfig {
    pub fn tenant_weight(&self, tenant: &str) -> f64 {
        self.fair_share.tenants.get(tenant).map(|t| t.weight).unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub disaggregated: bool,
    pub replicas: HashMap<String, usize>,
    pub router_port: u16,
    pub prefill_port: u16,
    pub decode_port: u16,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            disaggregated: false,
            replicas: HashMap::from([("router".into(), 1), ("prefill".into(), 1), ("decode".into(), 1)]),
            router_port: 8000,
            prefill_port: 9001,
            decode_port: 9002,
        }
    }
}

impl DeploymentConfig {
    pub fn replicas_for(&self, role: &str) -> usize { self.replicas.get(role).copied().unwrap_or(1).max(1) }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Comma-separated `host:port` list.
    pub prefill_service: String,
    pub decode_service: String,
    pub timeout_s: f64,
    pub round_robin: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            prefill_service: "llmserve-prefill:9001".into(),
            decode_service: "llmserve-decode:9002".into(),
            timeout_s: 30.0,
            round_robin: true,
        }
    }
}

impl RpcConfig {
    pub fn prefill_addresses(&self) -> Vec<String> { split_addresses(&self.prefill_service) }
    pub fn decode_addresses(&self) -> Vec<String> { split_addresses(&self.decode_service) }
}

fn split_addresses(list: &str) -> Vec<String> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisaggProvider {
    /// Our own prefill/decode worker RPC.
    #[default]
    Custom,
    /// An external OpenAI-compatible stack that splits prefill/decode itself.
    #[serde(alias = "vllm")]
    External,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExternalConfig {
    pub proxy_url: Option<String>,
    pub decode_url: Option<String>,
    pub auth_header: Option<String>,
}

impl ExternalConfig {
    /// Proxy wins over a direct decode endpoint.
    pub fn base_url(&self) -> Option<&str> {
        self.proxy_url.as_deref().or(self.decode_url.as_deref()).map(|u| u.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct DisaggConfig {
    pub provider: DisaggProvider,
    #[serde(alias = "vllm")]
    pub external: ExternalConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub models: HashMap<String, ModelConfig>,
    pub decode_strategy: DecodeStrategy,
    pub spec_decode: SpecDecodeConfig,
    pub lookahead: LookaheadConfig,
    pub hybrid: HybridConfig,
    pub scheduling: SchedulingConfig,
    pub deployment: DeploymentConfig,
    pub rpc: RpcConfig,
    pub disagg: DisaggConfig,
}

impl Default for ServeConfig {
    fn default() -> Self {
        let mut cfg = Self {
            models: HashMap::from([(
                "primary".to_string(),
                ModelConfig { id: "stub-model".into(), dtype: defaults::dtype(), max_model_len: None },
            )]),
            decode_strategy: DecodeStrategy::default(),
            spec_decode: SpecDecodeConfig::default(),
            lookahead: LookaheadConfig::default(),
            hybrid: HybridConfig::default(),
            scheduling: SchedulingConfig::default(),
            deployment: DeploymentConfig::default(),
            rpc: RpcConfig::default(),
            disagg: DisaggConfig::default(),
        };
        cfg.ensure_default_tenant();
        cfg
    }
}

impl ServeConfig {
    /// `LLMSERVE_CONFIG` points at a manifest; otherwise defaults plus `LLMSERVE_*` overrides.
    pub fn load() -> Result<Self> {
        if let Ok(path) = env::var("LLMSERVE_CONFIG") {
            return Self::from_path(path);
        }
        let mut cfg = Self::default();
        if let Ok(id) = env::var("LLMSERVE_MODEL") {
            if let Some(m) = cfg.models.get_mut("primary") { m.id = id; }
        }
        if let Some(v) = env::var("LLMSERVE_ROUTER_PORT").ok().and_then(|v| v.parse().ok()) { cfg.deployment.router_port = v; }
        if let Some(v) = env::var("LLMSERVE_DISAGGREGATED").ok().and_then(|v| v.parse().ok()) { cfg.deployment.disaggregated = v; }
        if let Ok(v) = env::var("LLMSERVE_PREFILL_SERVICE") { cfg.rpc.prefill_service = v; }
        if let Ok(v) = env::var("LLMSERVE_DECODE_SERVICE") { cfg.rpc.decode_service = v; }
        if let Ok(v) = env::var("LLMSERVE_EXTERNAL_URL") {
            cfg.disagg.provider = DisaggProvider::External;
            cfg.disagg.external.proxy_url = Some(v);
        }
        if let Some(v) = env::var("LLMSERVE_PREFILL_CHUNK_TOKENS").ok().and_then(|v| v.parse().ok()) {
            cfg.scheduling.policies.prefill_chunk_tokens = v;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServeError::Config(format!("cannot read manifest {}: {e}", path.display())))?;
        Self::from_manifest_str(&text)
    }

    pub fn from_manifest_str(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(text)?;
        if manifest.kind != MANIFEST_KIND {
            return Err(ServeError::Config(format!("unexpected kind={}, expected {MANIFEST_KIND}", manifest.kind)));
        }
        let mut cfg = manifest.spec;
        cfg.ensure_default_tenant();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.models.contains_key("primary") {
            return Err(ServeError::Config("models.primary is required".into()));
        }
        let policies = &self.scheduling.policies;
        if policies.prefill_chunk_tokens == 0 {
            return Err(ServeError::Config("scheduling.policies.prefill_chunk_tokens must be > 0".into()));
        }
        if policies.aging_seconds < 0.0 {
            return Err(ServeError::Config("scheduling.policies.aging_seconds must be >= 0".into()));
        }
        for (tenant, share) in &self.scheduling.fair_share.tenants {
            if share.weight.is_nan() || share.weight <= 0.0 {
                return Err(ServeError::Config(format!("fair_share weight for {tenant} must be > 0")));
            }
        }
        for (tenant, rl) in &self.scheduling.rate_limits {
            if rl.tokens_per_sec < 0.0 {
                return Err(ServeError::Config(format!("rate_limits.{tenant}.tokens_per_sec must be >= 0")));
            }
            if rl.deprioritize_multiplier < 1.0 {
                return Err(ServeError::Config(format!("rate_limits.{tenant}.deprioritize_multiplier must be >= 1")));
            }
        }
        if self.deployment.disaggregated
            && self.disagg.provider == DisaggProvider::External
            && self.disagg.external.base_url().is_none()
        {
            return Err(ServeError::Config("disagg.provider=external requires proxy_url or decode_url".into()));
        }
        if self.spec_decode.enabled && self.decode_strategy == DecodeStrategy::Speculative && self.spec_decode.draft_model.is_none() {
            return Err(ServeError::Config("spec_decode requires draft_model".into()));
        }
        Ok(())
    }

    pub fn primary_model(&self) -> &str {
        self.models.get("primary").map(|m| m.id.as_str()).unwrap_or("unknown")
    }

    fn ensure_default_tenant(&mut self) {
        self.scheduling.rate_limits.entry(DEFAULT_TENANT.to_string()).or_default();
    }
}

mod defaults {
    pub fn dtype() -> String { "bf16".into() }
    pub fn weight() -> f64 { 1.0 }
}
