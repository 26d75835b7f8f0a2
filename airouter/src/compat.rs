//! Anthropic-native wire contract, wrapped around the OpenAI-shaped
//! pipeline: inbound request translation, outbound unary translation, and
//! synthesis of the Anthropic streaming event sequence.

use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::providers::{ProviderError, SseStream};
use futures::StreamExt;

/// Inbound Anthropic messages request.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    /// A plain string or a list of text blocks.
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: Value,
}

/// Flatten a string-or-blocks content value to its concatenated text.
fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

impl AnthropicRequest {
    /// Translate into the internal OpenAI-shaped chat body. `system` becomes
    /// a leading system message; content blocks flatten to text.
    pub fn to_internal(&self) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &self.system {
            let text = flatten_content(system);
            if !text.is_empty() {
                messages.push(json!({"role": "system", "content": text}));
            }
        }
        for msg in &self.messages {
            messages.push(json!({
                "role": msg.role,
                "content": flatten_content(&msg.content),
            }));
        }

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": self.stream,
        });
        if let Some(max_tokens) = self.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = self.top_p {
            body["top_p"] = json!(top_p);
        }
        if !self.stop_sequences.is_empty() {
            body["stop"] = json!(self.stop_sequences);
        }
        body
    }
}

fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "max_tokens",
        Some("content_filter") => "stop_sequence",
        // stop and anything unrecognized read as a clean end of turn.
        _ => "end_turn",
    }
}

fn mint_message_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(24)
        .map(char::from)
        .collect();
    format!("msg_{}", suffix)
}

/// Translate an internal (OpenAI-shaped) unary response into the Anthropic
/// message envelope. The client-supplied model is echoed back.
pub fn internal_to_anthropic(body: &Value, requested_model: &str) -> Value {
    let choice = &body["choices"][0];
    let text = choice["message"]["content"].as_str().unwrap_or_default();
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(mint_message_id);

    json!({
        "id": id,
        "type": "message",
        "role": "assistant",
        "content": [{"type": "text", "text": text}],
        "model": requested_model,
        "stop_reason": map_finish_reason(choice["finish_reason"].as_str()),
        "usage": {
            "input_tokens": body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            "output_tokens": body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        }
    })
}

fn event_frame(event: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Synthesize the Anthropic event sequence from an internal OpenAI-shaped
/// chunk stream: `message_start`, `ping`, one `content_block_start`, the
/// deltas, then `content_block_stop`, `message_delta`, `message_stop`.
pub fn anthropic_event_stream(inner: SseStream, requested_model: String) -> SseStream {
    let s = async_stream::stream! {
        let message_id = mint_message_id();
        yield Ok(event_frame("message_start", &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": requested_model,
                "stop_reason": Value::Null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }
        })));
        yield Ok(event_frame("ping", &json!({"type": "ping"})));

        let mut inner = inner;
        let mut block_open = false;
        let mut stop_reason: Option<String> = None;
        let mut output_tokens: u64 = 0;

        while let Some(frame) = inner.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let Some(payload) = frame.trim().strip_prefix("data: ") else {
                continue;
            };
            if payload == "[DONE]" {
                break;
            }
            let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
                continue;
            };

            let choice = &chunk["choices"][0];
            if let Some(text) = choice["delta"]["content"].as_str() {
                if !text.is_empty() {
                    if !block_open {
                        block_open = true;
                        yield Ok(event_frame("content_block_start", &json!({
                            "type": "content_block_start",
                            "index": 0,
                            "content_block": {"type": "text", "text": ""},
                        })));
                    }
                    yield Ok(event_frame("content_block_delta", &json!({
                        "type": "content_block_delta",
                        "index": 0,
                        "delta": {"type": "text_delta", "text": text},
                    })));
                }
            }
            if let Some(reason) = choice["finish_reason"].as_str() {
                stop_reason = Some(reason.to_string());
            }
            if let Some(tokens) = chunk["usage"]["completion_tokens"].as_u64() {
                output_tokens = tokens;
            }
        }

        if block_open {
            yield Ok(event_frame("content_block_stop", &json!({
                "type": "content_block_stop",
                "index": 0,
            })));
        }
        yield Ok(event_frame("message_delta", &json!({
            "type": "message_delta",
            "delta": {"stop_reason": map_finish_reason(stop_reason.as_deref())},
            "usage": {"output_tokens": output_tokens},
        })));
        yield Ok(event_frame("message_stop", &json!({"type": "message_stop"})));
    };
    Box::pin(s)
}

/// Error body in the Anthropic wire shape.
pub fn anthropic_error(error_type: &str, message: &str) -> Value {
    json!({
        "type": "error",
        "error": {"type": error_type, "message": message},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::anthropic::build_request;
    use crate::types::ChatRequest;
    use futures::stream;

    #[test]
    fn inbound_system_becomes_a_leading_message() {
        let req: AnthropicRequest = serde_json::from_value(json!({
            "model": "claude-opus-4-6",
            "system": "Be brief.",
            "max_tokens": 512,
            "stop_sequences": ["END"],
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "Hel"}, {"type": "text", "text": "lo"}]},
                {"role": "assistant", "content": "Hi there"}
            ]
        }))
        .unwrap();

        let internal = req.to_internal();
        assert_eq!(internal["messages"][0]["role"], "system");
        assert_eq!(internal["messages"][0]["content"], "Be brief.");
        assert_eq!(internal["messages"][1]["content"], "Hello");
        assert_eq!(internal["messages"][2]["role"], "assistant");
        assert_eq!(internal["max_tokens"], 512);
        assert_eq!(internal["stop"], json!(["END"]));
    }

    #[test]
    fn openai_to_anthropic_and_back_preserves_the_core_fields() {
        let original = json!({
            "model": "claude-opus-4-6",
            "messages": [
                {"role": "system", "content": "Be brief."},
                {"role": "user", "content": "Hello"}
            ],
            "temperature": 0.3,
            "top_p": 0.9,
            "max_tokens": 256,
            "stream": true,
            "frequency_penalty": 0.1,
            "presence_penalty": 0.2,
            "logprobs": true
        });
        let chat: ChatRequest = serde_json::from_value(original).unwrap();
        let anthropic_body =
            serde_json::to_value(build_request(&chat, "claude-opus-4-6", chat.stream)).unwrap();

        // The Anthropic body must not carry the dropped sampling fields.
        assert!(anthropic_body.get("frequency_penalty").is_none());
        assert!(anthropic_body.get("presence_penalty").is_none());
        assert!(anthropic_body.get("logprobs").is_none());

        let inbound: AnthropicRequest = serde_json::from_value(anthropic_body).unwrap();
        let round_tripped = inbound.to_internal();

        assert_eq!(round_tripped["model"], "claude-opus-4-6");
        assert_eq!(round_tripped["temperature"], 0.3);
        assert_eq!(round_tripped["top_p"], 0.9);
        assert_eq!(round_tripped["max_tokens"], 256);
        assert_eq!(round_tripped["stream"], true);
        assert_eq!(round_tripped["messages"][0]["role"], "system");
        assert_eq!(round_tripped["messages"][0]["content"], "Be brief.");
        assert_eq!(round_tripped["messages"][1]["content"], "Hello");
        assert!(round_tripped.get("frequency_penalty").is_none());
    }

    #[test]
    fn outbound_unary_echoes_the_requested_model() {
        let internal = json!({
            "id": "chatcmpl-123",
            "choices": [{
                "message": {"role": "assistant", "content": "Hi"},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 34}
        });
        let out = internal_to_anthropic(&internal, "claude-opus-4-6");
        assert_eq!(out["id"], "chatcmpl-123");
        assert_eq!(out["model"], "claude-opus-4-6");
        assert_eq!(out["content"][0]["text"], "Hi");
        assert_eq!(out["stop_reason"], "max_tokens");
        assert_eq!(out["usage"]["input_tokens"], 12);
        assert_eq!(out["usage"]["output_tokens"], 34);
    }

    #[test]
    fn outbound_unary_mints_an_id_when_upstream_has_none() {
        let internal = json!({
            "choices": [{"message": {"content": "Hi"}, "finish_reason": "stop"}]
        });
        let out = internal_to_anthropic(&internal, "claude-opus-4-6");
        let id = out["id"].as_str().unwrap();
        assert!(id.starts_with("msg_"));
        assert_eq!(out["stop_reason"], "end_turn");
    }

    fn chunk_frame(content: Option<&str>, finish: Option<&str>) -> Result<String, ProviderError> {
        let payload = json!({
            "choices": [{
                "index": 0,
                "delta": content.map(|c| json!({"content": c})).unwrap_or(json!({})),
                "finish_reason": finish,
            }]
        });
        Ok(format!("data: {}\n\n", payload))
    }

    #[tokio::test]
    async fn stream_synthesis_emits_the_anthropic_event_order() {
        let inner: SseStream = Box::pin(stream::iter(vec![
            chunk_frame(Some("Hello"), None),
            chunk_frame(Some(" World"), None),
            chunk_frame(None, Some("stop")),
            Ok("data: [DONE]\n\n".to_string()),
        ]));

        let frames: Vec<String> = anthropic_event_stream(inner, "claude-opus-4-6".to_string())
            .map(|f| f.unwrap())
            .collect()
            .await;

        let events: Vec<&str> = frames
            .iter()
            .map(|f| {
                f.lines()
                    .next()
                    .and_then(|l| l.strip_prefix("event: "))
                    .unwrap()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                "message_start",
                "ping",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // The deltas carry the text in order.
        assert!(frames[3].contains("Hello"));
        assert!(frames[4].contains(" World"));
        // The closing message_delta maps the finish reason.
        assert!(frames[6].contains("end_turn"));
    }

    #[tokio::test]
    async fn stream_synthesis_without_content_skips_the_block_events() {
        let inner: SseStream = Box::pin(stream::iter(vec![
            chunk_frame(None, Some("length")),
            Ok("data: [DONE]\n\n".to_string()),
        ]));
        let frames: Vec<String> = anthropic_event_stream(inner, "m".to_string())
            .map(|f| f.unwrap())
            .collect()
            .await;
        let joined = frames.join("");
        assert!(!joined.contains("content_block_start"));
        assert!(joined.contains("max_tokens"));
        assert!(joined.contains("message_stop"));
    }
}
