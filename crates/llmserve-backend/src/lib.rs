//! Execution-engine capabilities the router drives, plus stub engines for dev and tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use llmserve_common::Result;
use serde::{Deserialize, Serialize};

pub mod strategy;

/// Characters per fragment when an engine can only produce whole completions.
pub const STREAM_CHUNK_CHARS: usize = 64;

pub type TextStream = BoxStream<'static, Result<String>>;

/// Per-request sampling knobs. Unset fields fall back to engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecodeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl DecodeOptions {
    pub const DEFAULT_MAX_TOKENS: u32 = 256;
    pub const DEFAULT_TEMPERATURE: f32 = 0.7;
    pub const DEFAULT_TOP_P: f32 = 0.95;

    pub fn max_tokens(&self) -> u32 { self.max_tokens.unwrap_or(Self::DEFAULT_MAX_TOKENS) }
    pub fn temperature(&self) -> f32 { self.temperature.unwrap_or(Self::DEFAULT_TEMPERATURE) }
    pub fn top_p(&self) -> f32 { self.top_p.unwrap_or(Self::DEFAULT_TOP_P) }
    pub fn strategy_hint(&self) -> &str { self.strategy_hint.as_deref().unwrap_or("auto") }
    pub fn workload(&self) -> &str { self.workload.as_deref().unwrap_or("general") }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefillResult {
    pub prompt_tokens: usize,
    /// Reserved for cross-process KV transfer; always `None` today.
    pub kv_handle: Option<String>,
}

#[async_trait]
pub trait DecodeEngine: Send + Sync + 'static {
    async fn generate(&self, prompt: &str, opts: &DecodeOptions) -> Result<String>;

    /// Finite, non-restartable fragment sequence. The default generates the whole
    /// completion and splits it into [`STREAM_CHUNK_CHARS`] pieces.
    fn stream(self: Arc<Self>, prompt: String, opts: DecodeOptions) -> TextStream {
        Box::pin(async_stream::try_stream! {
            let text = self.generate(&prompt, &opts).await?;
            for piece in chunk_text(&text, STREAM_CHUNK_CHARS) {
                yield piece;
            }
        })
    }
}

#[async_trait]
pub trait PrefillEngine: Send + Sync + 'static {
    async fn prefill(&self, prompt: &str) -> Result<PrefillResult>;
}

/// Splits on char boundaries into pieces of at most `size` chars.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

#[cfg(feature = "mock")]
pub mod mock {
    use super::*;

    /// Placeholder decode engine used when no real engine is wired in.
    #[derive(Debug, Clone, Default)]
    pub struct StubDecodeEngine { label: Option<&'static str> }

    impl StubDecodeEngine {
        pub fn new() -> Self { Self { label: None } }
        pub fn labelled(label: &'static str) -> Self { Self { label: Some(label) } }
    }

    #[async_trait]
    impl DecodeEngine for StubDecodeEngine {
        async fn generate(&self, prompt: &str, _opts: &DecodeOptions) -> Result<String> {
            let head: String = prompt.chars().take(64).collect();
            Ok(match self.label {
                Some(label) => format!("(stub:{label}) {head} ..."),
                None => format!("(stub) {head} ..."),
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    pub struct StubPrefillEngine;

    impl StubPrefillEngine { pub fn new() -> Self { Self } }

    #[async_trait]
    impl PrefillEngine for StubPrefillEngine {
        async fn prefill(&self, prompt: &str) -> Result<PrefillResult> {
            Ok(PrefillResult { prompt_tokens: (prompt.chars().count() / 4).max(1), kv_handle: None })
        }
    }
}
