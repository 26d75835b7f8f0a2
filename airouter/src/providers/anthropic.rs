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

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
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
pub(crate) struct MessagesRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct UsageData {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct StreamEventData {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<DeltaData>,
}

#[derive(Deserialize)]
struct DeltaData {
    #[serde(rename = "type", default)]
    delta_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

fn map_stop_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("max_tokens") => "length",
        // end_turn, stop_sequence, and anything unrecognized read as a
        // normal stop to OpenAI-shaped clients.
        _ => "stop",
    }
}

/// Build the Anthropic request body from the OpenAI-shaped intermediate.
/// System messages are pulled out of the list; unsupported sampling fields
/// are dropped on the floor.
pub(crate) fn build_request(req: &ChatRequest, vendor_model: &str, stream: bool) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for msg in &req.messages {
        match msg.role.as_str() {
            "system" => system_parts.push(msg.text()),
            "assistant" => messages.push(AnthropicMessage {
                role: "assistant".to_string(),
                content: msg.text(),
            }),
            // user, function, and tool results all arrive as user turns.
            _ => messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: msg.text(),
            }),
        }
    }

    MessagesRequest {
        model: vendor_model.to_string(),
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        },
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: stop_sequences(&req.stop),
        stream,
    }
}

/// Translate the unary Anthropic response into the OpenAI chat shape.
fn translate_response(resp: &MessagesResponse, requested_model: &str) -> Value {
    let text = resp
        .content
        .first()
        .and_then(|b| b.text.clone())
        .unwrap_or_default();
    let usage = resp.usage.as_ref();
    let input = usage.map(|u| u.input_tokens).unwrap_or(0);
    let output = usage.map(|u| u.output_tokens).unwrap_or(0);

    json!({
        "id": completion_id(),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": requested_model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": map_stop_reason(resp.stop_reason.as_deref()),
        }],
        "usage": {
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output,
        }
    })
}

fn chunk(requested_model: &str, delta: Value, finish_reason: Option<&str>) -> String {
    let payload = json!({
        "id": completion_id(),
        "object": "chat.completion.chunk",
        "created": Utc::now().timestamp(),
        "model": requested_model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }]
    });
    sse_frame(&payload.to_string())
}

/// Rewrite one upstream SSE line into zero or more OpenAI-shaped frames.
/// `done` tracks whether the terminating marker has been emitted, so an
/// upstream that dies without `message_stop` still terminates the client.
fn rewrite_line(line: Option<&str>, requested_model: &str, done: &mut bool) -> Vec<String> {
    let Some(line) = line else {
        if *done {
            return Vec::new();
        }
        *done = true;
        return vec![SSE_DONE.to_string()];
    };
    let Some(data) = line.strip_prefix("data: ") else {
        return Vec::new();
    };
    let Ok(event) = serde_json::from_str::<StreamEventData>(data) else {
        return Vec::new();
    };

    match event.event_type.as_str() {
        "content_block_delta" => {
            let Some(delta) = event.delta else {
                return Vec::new();
            };
            if delta.delta_type.as_deref() != Some("text_delta") {
                return Vec::new();
            }
            match delta.text {
                Some(text) => vec![chunk(requested_model, json!({"content": text}), None)],
                None => Vec::new(),
            }
        }
        "message_delta" => match event.delta.and_then(|d| d.stop_reason) {
            Some(reason) => vec![chunk(
                requested_model,
                json!({}),
                Some(map_stop_reason(Some(&reason))),
            )],
            None => Vec::new(),
        },
        "message_stop" => {
            *done = true;
            vec![SSE_DONE.to_string()]
        }
        // ping, message_start, content_block_start/stop are swallowed.
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Provider impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Provider for AnthropicProvider {
    fn vendor(&self) -> Vendor {
        Vendor::Anthropic
    }

    async fn call(
        &self,
        capability: Capability,
        requested_model: &str,
        vendor_model: &str,
        signal: &CancellationToken,
        body: &Value,
    ) -> Result<ProviderResponse, ProviderError> {
        if capability != Capability::Chat {
            return Err(ProviderError::Other(format!(
                "anthropic cannot serve {} requests",
                capability.as_str()
            )));
        }

        let chat: ChatRequest = serde_json::from_value(body.clone())?;
        let is_stream = chat.stream;
        let req_body = build_request(&chat, vendor_model, is_stream);

        let req = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&req_body);

        let resp = send_with_signal(req, signal).await?;
        if !resp.status().is_success() {
            return Err(error_from_response(Vendor::Anthropic, resp).await);
        }

        let status = resp.status().as_u16();
        let headers = lowercase_headers(resp.headers());

        if is_stream {
            let model = requested_model.to_string();
            let mut done = false;
            let stream = sse_stream(resp, signal.clone(), move |line| {
                rewrite_line(line, &model, &mut done)
            });
            return Ok(ProviderResponse {
                status,
                headers,
                body: ResponseBody::Stream(stream),
            });
        }

        let parsed: MessagesResponse = resp.json().await?;
        Ok(ProviderResponse {
            status,
            headers,
            body: ResponseBody::Json(translate_response(&parsed, requested_model)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chat_request(body: Value) -> ChatRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn system_messages_concatenate_into_the_system_field() {
        let req = chat_request(json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hi"},
                {"role": "system", "content": "Be kind."}
            ]
        }));
        let out = build_request(&req, "claude-opus-4-6", false);
        assert_eq!(out.system.as_deref(), Some("Be brief.\n\nBe kind."));
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.model, "claude-opus-4-6");
    }

    #[test]
    fn max_tokens_defaults_when_absent() {
        let req = chat_request(json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        assert_eq!(build_request(&req, "m", false).max_tokens, DEFAULT_MAX_TOKENS);

        let req = chat_request(json!({
            "model": "gpt-4o",
            "max_tokens": 128,
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        assert_eq!(build_request(&req, "m", false).max_tokens, 128);
    }

    #[test]
    fn stop_becomes_a_list_and_penalties_are_dropped() {
        let req = chat_request(json!({
            "model": "gpt-4o",
            "stop": "END",
            "frequency_penalty": 0.5,
            "presence_penalty": 0.5,
            "logprobs": true,
            "messages": [{"role": "user", "content": "Hi"}]
        }));
        let out = serde_json::to_value(build_request(&req, "m", false)).unwrap();
        assert_eq!(out["stop_sequences"], json!(["END"]));
        assert!(out.get("frequency_penalty").is_none());
        assert!(out.get("presence_penalty").is_none());
        assert!(out.get("logprobs").is_none());
    }

    #[test]
    fn unary_response_takes_first_content_block() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "Hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        }))
        .unwrap();
        let out = translate_response(&resp, "gpt-4o");
        assert_eq!(out["model"], "gpt-4o");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["usage"]["total_tokens"], 15);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("stop_sequence")), "stop");
        assert_eq!(map_stop_reason(Some("weird")), "stop");
        assert_eq!(map_stop_reason(None), "stop");
    }

    #[test]
    fn stream_rewrite_translates_the_event_sequence() {
        let mut done = false;
        let deltas = rewrite_line(
            Some(r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hello"}}"#),
            "gpt-4o",
            &mut done,
        );
        assert_eq!(deltas.len(), 1);
        let body: Value =
            serde_json::from_str(deltas[0].strip_prefix("data: ").unwrap().trim()).unwrap();
        assert_eq!(body["choices"][0]["delta"]["content"], "Hello");
        assert_eq!(body["model"], "gpt-4o");

        let finish = rewrite_line(
            Some(r#"data: {"type":"message_delta","delta":{"stop_reason":"max_tokens"}}"#),
            "gpt-4o",
            &mut done,
        );
        let body: Value =
            serde_json::from_str(finish[0].strip_prefix("data: ").unwrap().trim()).unwrap();
        assert_eq!(body["choices"][0]["finish_reason"], "length");

        let stop = rewrite_line(Some(r#"data: {"type":"message_stop"}"#), "gpt-4o", &mut done);
        assert_eq!(stop, vec![SSE_DONE.to_string()]);
        // Upstream end after message_stop emits nothing further.
        assert!(rewrite_line(None, "gpt-4o", &mut done).is_empty());
    }

    #[test]
    fn stream_rewrite_swallows_other_events() {
        let mut done = false;
        assert!(rewrite_line(Some(r#"data: {"type":"ping"}"#), "m", &mut done).is_empty());
        assert!(rewrite_line(Some("event: content_block_delta"), "m", &mut done).is_empty());
        assert!(rewrite_line(Some(""), "m", &mut done).is_empty());
    }
}
