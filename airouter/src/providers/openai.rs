use reqwest::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    error_from_response, send_with_signal, sse_stream, Provider, ProviderError, ProviderResponse,
    ResponseBody,
};
use crate::headers::lowercase_headers;
use crate::types::{Capability, Vendor};
use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// The inbound wire contract is already OpenAI-shaped, so this adapter is a
/// pass-through: overwrite the model name on the way out, restore the
/// client's name on the way back.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: &str) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn endpoint(&self, capability: Capability) -> String {
        let path = match capability {
            Capability::Chat => "chat/completions",
            Capability::Images => "images/generations",
            Capability::Embeddings => "embeddings",
        };
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    async fn call(
        &self,
        capability: Capability,
        requested_model: &str,
        vendor_model: &str,
        signal: &CancellationToken,
        body: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        let mut out = body.clone();
        out["model"] = Value::String(vendor_model.to_string());

        let is_stream = capability == Capability::Chat
            && body.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let req = self
            .client
            .post(self.endpoint(capability))
            .bearer_auth(&self.api_key)
            .json(&out);

        let resp = send_with_signal(req, signal).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(Vendor::OpenAi, resp).await);
        }

        let status = resp.status().as_u16();
        let headers = lowercase_headers(resp.headers());

        if is_stream {
            // Upstream lines already match the OpenAI SSE shape; relay as-is.
            let stream = sse_stream(resp, signal.clone(), |line| match line {
                Some(l) if l.starts_with("data:") => vec![format!("{}\n\n", l)],
                _ => Vec::new(),
            });
            return Ok(ProviderResponse {
                status,
                headers,
                body: ResponseBody::Stream(stream),
            });
        }

        let mut json: Value = resp.json().await?;
        if capability != Capability::Images {
            json["model"] = Value::String(requested_model.to_string());
        }
        Ok(ProviderResponse {
            status,
            headers,
            body: ResponseBody::Json(json),
        })
    }
}
