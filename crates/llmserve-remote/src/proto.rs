//! Worker RPC wire types. Unary calls carry one JSON body each way; the decode
//! call answers with newline-delimited [`DecodeChunk`] frames.

use llmserve_backend::DecodeOptions;
use llmserve_core::RequestContext;
use serde::{Deserialize, Serialize};

pub const PREFILL_CHUNK_PATH: &str = "/llmserve.PrefillService/PrefillChunk";
pub const DECODE_STREAM_PATH: &str = "/llmserve.DecodeService/DecodeStream";
pub const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefillChunkRequest {
    pub req_id: String,
    pub prompt: String,
    pub start_token: u64,
    pub n_tokens: u64,
    #[serde(default)]
    pub tenant: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrefillChunkReply {
    pub ok: bool,
    pub prompt_tokens: u64,
    #[serde(default)]
    pub kv_handle: String,
}

/// Zero or empty fields mean "use the worker default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeRequest {
    pub req_id: String,
    pub prompt: String,
    pub tenant: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub strategy_hint: String,
    pub workload: String,
}

impl DecodeRequest {
    pub fn from_context(ctx: &RequestContext) -> Self {
        let opts = &ctx.opts;
        Self {
            req_id: ctx.id.to_string(),
            prompt: ctx.prompt.clone(),
            tenant: ctx.tenant.clone(),
            max_tokens: opts.max_tokens(),
            temperature: opts.temperature(),
            top_p: opts.top_p(),
            strategy_hint: opts.strategy_hint().to_string(),
            workload: opts.workload().to_string(),
        }
    }

    /// Options for the worker's engine.
    pub fn options(&self) -> DecodeOptions {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        DecodeOptions {
            max_tokens: (self.max_tokens > 0).then_some(self.max_tokens),
            temperature: (self.temperature > 0.0).then_some(self.temperature),
            top_p: (self.top_p > 0.0).then_some(self.top_p),
            strategy_hint: non_empty(&self.strategy_hint),
            workload: non_empty(&self.workload),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeChunk {
    pub delta: String,
}
