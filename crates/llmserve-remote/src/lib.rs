//! Out-of-process backends: our own prefill/decode workers, or an external
//! OpenAI-compatible stack that handles the prefill/decode split itself.

pub mod external;
pub mod lines;
pub mod proto;
pub mod rpc;

use llmserve_common::ServeError;

pub use external::{parse_sse_line, ExternalProxyCallbacks, SseLine};
pub use rpc::{RpcCallbacks, RpcClient};

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("no {0} addresses configured")]
    NoAddresses(&'static str),
    #[error("external provider needs proxy_url or decode_url")]
    MissingUrl,
    #[error("{service} returned {status}: {body}")]
    Status { service: &'static str, status: u16, body: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] serde_json::Error),
}

impl From<RemoteError> for ServeError {
    fn from(err: RemoteError) -> Self { ServeError::Backend(err.to_string()) }
}

pub(crate) async fn ensure_success(resp: reqwest::Response, service: &'static str) -> Result<reqwest::Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(RemoteError::Status { service, status: status.as_u16(), body })
}
