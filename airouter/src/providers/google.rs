use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::{
    completion_id, error_from_response, send_with_signal, sse_frame, sse_stream, Provider,
    ProviderError, ProviderResponse, ResponseBody, SSE_DONE,
};
use crate::headers::lowercase_headers;
use crate::types::{stop_sequences, Capability, ChatRequest, Vendor};
use async_trait::async_trait;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Generative AI (Gemini) adapter.
pub struct GoogleProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GoogleProvider {
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
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    candidate_count: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Option<Vec<ResponsePart>>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u64>,
    #[serde(default)]
    candidates_token_count: Option<u64>,
    #[serde(default)]
    total_token_count: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Prediction {
    #[serde(default)]
    bytes_base64_encoded: Option<String>,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        Some("SAFETY") => "content_filter",
        _ => "stop",
    }
}

fn build_request(req: &ChatRequest) -> GenerateContentRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.text()),
            "assistant" => contents.push(Content {
                role: "model".to_string(),
                parts: vec![Part { text: msg.text() }],
            }),
            _ => contents.push(Content {
                role: "user".to_string(),
                parts: vec![Part { text: msg.text() }],
            }),
        }
    }

    let config = GenerationConfig {
        temperature: req.temperature,
        max_output_tokens: req.max_tokens,
        top_p: req.top_p,
        candidate_count: req.n,
        stop_sequences: stop_sequences(&req.stop),
        response_mime_type: req
            .response_format
            .as_ref()
            .filter(|f| f.format_type == "json_object")
            .map(|_| "application/json".to_string()),
    };
    let has_config = config.temperature.is_some()
        || config.max_output_tokens.is_some()
        || config.top_p.is_some()
        || config.candidate_count.is_some()
        || !config.stop_sequences.is_empty()
        || config.response_mime_type.is_some();

    GenerateContentRequest {
        contents,
        system_instruction: if system_parts.is_empty() {
            None
        } else {
            Some(SystemInstruction {
                parts: vec![Part {
                    text: system_parts.join("\n\n"),
                }],
            })
        },
        generation_config: has_config.then_some(config),
    }
}

fn candidate_text(candidate: &Candidate) -> String {
    candidate
        .content
        .as_ref()
        .and_then(|c| c.parts.as_ref())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// Each candidate becomes one choice; usage metadata maps field by field.
fn translate_response(resp: &GenerateContentResponse, requested_model: &str) -> Value {
    let choices: Vec<Value> = resp
        .candidates
        .as_deref()
        .unwrap_or_default()
        .iter()
        .enumerate()
        .map(|(index, candidate)| {
            json!({
                "index": index,
                "message": {"role": "assistant", "content": candidate_text(candidate)},
                "finish_reason": map_finish_reason(candidate.finish_reason.as_deref()),
            })
        })
        .collect();

    let usage = resp.usage_metadata.as_ref();
    json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": requested_model,
        "choices": choices,
        "usage": {
            "prompt_tokens": usage.and_then(|u| u.prompt_token_count).unwrap_or(0),
            "completion_tokens": usage.and_then(|u| u.candidates_token_count).unwrap_or(0),
            "total_tokens": usage.and_then(|u| u.total_token_count).unwrap_or(0),
        }
    })
}

/// One upstream data line yields one OpenAI chunk; end of input yields the
/// terminating marker.
fn rewrite_line(line: Option<&str>, requested_model: &str) -> Vec<String> {
    let Some(line) = line else {
        return vec![SSE_DONE.to_string()];
    };
    let Some(data) = line.strip_prefix("data: ") else {
        return Vec::new();
    };
    let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(data) else {
        return Vec::new();
    };
    let Some(candidate) = parsed.candidates.as_deref().and_then(|c| c.first()) else {
        return Vec::new();
    };

    let finish = candidate
        .finish_reason
        .as_deref()
        .map(|r| map_finish_reason(Some(r)));
    let text = candidate_text(candidate);
    let delta = if text.is_empty() {
        json!({})
    } else {
        json!({"content": text})
    };
    let payload = json!({
        "id": completion_id(),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": requested_model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }]
    });
    vec![sse_frame(&payload.to_string())]
}

// ---------------------------------------------------------------------------
// Provider impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for GoogleProvider {
    fn vendor(&self) -> Vendor {
        Vendor::Google
    }

    async fn call(
        &self,
        capability: Capability,
        requested_model: &str,
        vendor_model: &str,
        signal: &CancellationToken,
        body: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        match capability {
            Capability::Chat => self.chat(requested_model, vendor_model, signal, body).await,
            Capability::Images => self.images(vendor_model, signal, body).await,
            Capability::Embeddings => Err(ProviderError::Other(
                "google cannot serve embeddings requests".to_string(),
            )),
        }
    }
}

impl GoogleProvider {
    async fn chat(
        &self,
        requested_model: &str,
        vendor_model: &str,
        signal: &CancellationToken,
        body: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        let chat: ChatRequest = serde_json::from_value(body.clone())?;
        let is_stream = chat.stream;
        let req_body = build_request(&chat);

        // Streaming and unary generation live on different endpoints.
        let url = if is_stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, vendor_model
            )
        } else {
            format!("{}/models/{}:generateContent", self.base_url, vendor_model)
        };

        let req = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&req_body);

        let resp = send_with_signal(req, signal).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(Vendor::Google, resp).await);
        }

        let status = resp.status().as_u16();
        let headers = lowercase_headers(resp.headers());

        if is_stream {
            let model = requested_model.to_string();
            let stream = sse_stream(resp, signal.clone(), move |line| rewrite_line(line, &model));
            return Ok(ProviderResponse {
                status,
                headers,
                body: ResponseBody::Stream(stream),
            });
        }

        let parsed: GenerateContentResponse = resp.json().await?;
        Ok(ProviderResponse {
            status,
            headers,
            body: ResponseBody::Json(translate_response(&parsed, requested_model)),
        })
    }

    async fn images(
        &self,
        vendor_model: &str,
        signal: &CancellationToken,
        body: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        let prompt = body
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let count = body.get("n").and_then(Value::as_u64).unwrap_or(1);

        let url = format!("{}/models/{}:predict", self.base_url, vendor_model);
        let req = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({
                "instances": [{"prompt": prompt}],
                "parameters": {"sampleCount": count},
            }));

        let resp = send_with_signal(req, signal).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(Vendor::Google, resp).await);
        }

        let status = resp.status().as_u16();
        let headers = lowercase_headers(resp.headers());
        let parsed: PredictResponse = resp.json().await?;

        let data: Vec<Value> = parsed
            .predictions
            .iter()
            .filter_map(|p| p.bytes_base64_encoded.as_deref())
            .map(|b64| json!({"b64_json": b64, "revised_prompt": prompt}))
            .collect();

        Ok(ProviderResponse {
            status,
            headers,
            body: ResponseBody::Json(json!({
                "created": Utc::now().timestamp(),
                "data": data,
            })),
        })
    }
}
