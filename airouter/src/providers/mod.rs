pub mod anthropic;
pub mod google;
pub mod openai;
pub mod sanitize;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::headers::lowercase_headers;
use crate::types::{Capability, Vendor};

/// Errors from adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{vendor} returned HTTP {status}: {body}")]
    Http {
        vendor: Vendor,
        status: u16,
        headers: HashMap<String, String>,
        body: String,
    },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Status code if this was an HTTP-level rejection.
    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A lazy sequence of SSE frames, already rewritten to the OpenAI shape.
/// Each item is a complete `data: ...\n\n` frame.
pub type SseStream = BoxStream<'static, Result<String, ProviderError>>;

pub enum ResponseBody {
    Json(Value),
    Stream(SseStream),
}

/// What an adapter hands back to the router on success.
pub struct ProviderResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

/// A vendor adapter: translates the OpenAI-shaped body to the vendor's
/// native schema, performs the call, and translates the result back.
#[async_trait]
pub trait Provider: Send + Sync {
    fn vendor(&self) -> Vendor;

    async fn call(
        &self,
        capability: Capability,
        requested_model: &str,
        vendor_model: &str,
        signal: &CancellationToken,
        body: &Value,
    ) -> Result<ProviderResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Mint an OpenAI-style completion id.
pub(crate) fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

/// Send a request, racing it against the caller's abort signal.
pub(crate) async fn send_with_signal(
    req: reqwest::RequestBuilder,
    signal: &CancellationToken,
) -> Result<reqwest::Response, ProviderError> {
    tokio::select! {
        _ = signal.cancelled() => Err(ProviderError::Cancelled),
        resp = req.send() => resp.map_err(ProviderError::Network),
    }
}

/// Build a structured error from a failed vendor response, with the body
/// sanitized before it can reach a log line.
pub(crate) async fn error_from_response(
    vendor: Vendor,
    resp: reqwest::Response,
) -> ProviderError {
    let status = resp.status().as_u16();
    let headers = lowercase_headers(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    ProviderError::Http {
        vendor,
        status,
        headers,
        body: sanitize::sanitize_api_error(&body),
    }
}

/// Turn an upstream body into a lazy stream of rewritten SSE frames.
///
/// `rewrite` is called with each complete line (chunk boundaries do not
/// matter) and once more with `None` when the upstream is exhausted, so
/// adapters can emit a terminating frame. Firing the abort signal ends the
/// stream.
pub(crate) fn sse_stream<F>(
    resp: reqwest::Response,
    signal: CancellationToken,
    mut rewrite: F,
) -> SseStream
where
    F: FnMut(Option<&str>) -> Vec<String> + Send + 'static,
{
    let s = async_stream::stream! {
        let mut line_buf = String::new();
        let mut byte_stream = resp.bytes_stream();

        loop {
            let next = tokio::select! {
                _ = signal.cancelled() => return,
                chunk = byte_stream.next() => chunk,
            };
            let Some(chunk) = next else { break };
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(ProviderError::Network(e));
                    return;
                }
            };
            line_buf.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                for frame in rewrite(Some(line.trim())) {
                    yield Ok(frame);
                }
            }
        }

        if !line_buf.trim().is_empty() {
            let tail = line_buf.trim().to_string();
            for frame in rewrite(Some(&tail)) {
                yield Ok(frame);
            }
        }
        for frame in rewrite(None) {
            yield Ok(frame);
        }
    };
    Box::pin(s)
}

/// Frame a payload as one SSE event.
pub(crate) fn sse_frame(payload: &str) -> String {
    format!("data: {}\n\n", payload)
}

pub(crate) const SSE_DONE: &str = "data: [DONE]\n\n";
