use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Vendor identifiers
// ---------------------------------------------------------------------------

/// An upstream vendor the router can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAi,
    Anthropic,
    Google,
}

impl Vendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Google => "google",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Vendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Vendor::OpenAi),
            "anthropic" => Ok(Vendor::Anthropic),
            "google" => Ok(Vendor::Google),
            other => Err(format!("unknown vendor: {}", other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Capabilities and tiers
// ---------------------------------------------------------------------------

/// What kind of work a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Chat,
    Images,
    Embeddings,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Chat => "chat",
            Capability::Images => "images",
            Capability::Embeddings => "embeddings",
        }
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Capability::Chat),
            "images" => Ok(Capability::Images),
            "embeddings" => Ok(Capability::Embeddings),
            other => Err(format!("unknown capability: {}", other)),
        }
    }
}

/// Quality class grouping equivalent models across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Premium,
    Standard,
    Economy,
    Images,
    Embeddings,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Premium => "premium",
            Tier::Standard => "standard",
            Tier::Economy => "economy",
            Tier::Images => "images",
            Tier::Embeddings => "embeddings",
        }
    }
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

/// One candidate in a fallback chain: a vendor and its model name for the
/// requested equivalence class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainEntry {
    pub vendor: Vendor,
    pub model: String,
}

// ---------------------------------------------------------------------------
// Normalized chat request (the OpenAI-shaped intermediate)
// ---------------------------------------------------------------------------

/// Typed view of the OpenAI chat-completions request body. Adapters that
/// translate to another vendor schema parse the opaque body into this form;
/// the OpenAI adapter never needs it and passes bytes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    /// A single string or a list of strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<serde_json::Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// A plain string or a list of `{type, text | image_url}` parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub format_type: String,
}

impl ChatMessage {
    /// Flatten string-or-parts content to its concatenated text.
    pub fn text(&self) -> String {
        match &self.content {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }
}

/// Normalize the OpenAI `stop` field (string or list) to a list of strings.
pub fn stop_sequences(stop: &Option<serde_json::Value>) -> Vec<String> {
    match stop {
        Some(serde_json::Value::String(s)) => vec![s.clone()],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vendor_round_trips_through_str() {
        for v in [Vendor::OpenAi, Vendor::Anthropic, Vendor::Google] {
            assert_eq!(v.as_str().parse::<Vendor>().unwrap(), v);
        }
        assert!("azure".parse::<Vendor>().is_err());
    }

    #[test]
    fn message_text_flattens_parts() {
        let msg: ChatMessage = serde_json::from_value(json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "image_url", "image_url": {"url": "https://x/y.png"}},
                {"type": "text", "text": " World"}
            ]
        }))
        .unwrap();
        assert_eq!(msg.text(), "Hello World");
    }

    #[test]
    fn stop_accepts_string_or_list() {
        assert_eq!(stop_sequences(&Some(json!("END"))), vec!["END"]);
        assert_eq!(stop_sequences(&Some(json!(["a", "b"]))), vec!["a", "b"]);
        assert!(stop_sequences(&None).is_empty());
    }
}
