//! Decode strategies known at build time, looked up by name.

use std::collections::HashMap;
use std::sync::Arc;

use llmserve_common::config::{DecodeStrategy, ServeConfig};
use llmserve_common::{Result, ServeError};
use once_cell::sync::Lazy;

use crate::DecodeEngine;

pub type EngineFactory = fn() -> Arc<dyn DecodeEngine>;

static REGISTRY: Lazy<HashMap<&'static str, EngineFactory>> = Lazy::new(|| {
    #[allow(unused_mut)]
    let mut m: HashMap<&'static str, EngineFactory> = HashMap::new();
    #[cfg(feature = "mock")]
    {
        use crate::mock::StubDecodeEngine;
        m.insert("baseline", || -> Arc<dyn DecodeEngine> { Arc::new(StubDecodeEngine::new()) });
        m.insert("speculative", || -> Arc<dyn DecodeEngine> { Arc::new(StubDecodeEngine::labelled("speculative")) });
    }
    m
});

pub fn registered() -> Vec<&'static str> {
    let mut names: Vec<_> = REGISTRY.keys().copied().collect();
    names.sort_unstable();
    names
}

pub fn lookup(name: &str) -> Result<EngineFactory> {
    REGISTRY.get(name).copied().ok_or_else(|| ServeError::PluginUnavailable(name.to_string()))
}

pub struct ResolvedStrategy {
    pub name: String,
    pub engine: Arc<dyn DecodeEngine>,
    pub fell_back: bool,
}

/// `disable` as a fallback means plain baseline decoding.
pub fn resolve(primary: &str, fallback: &str) -> Result<ResolvedStrategy> {
    match lookup(primary) {
        Ok(factory) => Ok(ResolvedStrategy { name: primary.to_string(), engine: factory(), fell_back: false }),
        Err(err) => {
            let fallback = if fallback == "disable" { "baseline" } else { fallback };
            tracing::warn!(target: "backend", "{err}; falling back to {fallback}");
            let factory = lookup(fallback)?;
            Ok(ResolvedStrategy { name: fallback.to_string(), engine: factory(), fell_back: true })
        }
    }
}

/// Picks the strategy name and its fallback from the manifest.
pub fn resolve_from_config(cfg: &ServeConfig) -> Result<ResolvedStrategy> {
    match cfg.decode_strategy {
        DecodeStrategy::Baseline => resolve("baseline", "baseline"),
        DecodeStrategy::Speculative => resolve("speculative", &cfg.spec_decode.fallback),
        DecodeStrategy::Lookahead => {
            let plugin = cfg.lookahead.plugin.as_deref().unwrap_or("lookahead");
            resolve(plugin, &cfg.lookahead.fallback)
        }
        DecodeStrategy::Hybrid => resolve("hybrid", &cfg.hybrid.fallback),
    }
}
