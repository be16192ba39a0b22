//! Upstream LLM providers.
//!
//! Exactly two wire shapes are supported, OpenAI-style and Anthropic-style.
//! Each is a [`ProviderAdapter`] in a static table keyed by [`Provider`]; the
//! proxy looks the adapter up once per request and never branches on the
//! provider itself.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::messages::{ContentPart, MessageContent, PayloadMessage, Role};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Openai,
    Anthropic,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::Openai => "https://api.openai.com/v1",
            Provider::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::Openai => "gpt-4o-mini",
            Provider::Anthropic => "claude-3-5-sonnet-20240620",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provider::Openai => write!(f, "openai"),
            Provider::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(Provider::Openai),
            "anthropic" => Ok(Provider::Anthropic),
            other => Err(format!("unknown provider '{}'", other)),
        }
    }
}

/// Bring-your-own provider settings. Also used for the resolved settings the
/// proxy calls upstream with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    pub provider: Provider,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model_id: String,
}

impl LlmConfig {
    /// Only a config carrying an api key counts as a usable credential.
    pub fn is_active(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    fn base(&self) -> &str {
        let base = if self.base_url.trim().is_empty() {
            self.provider.default_base_url()
        } else {
            self.base_url.trim()
        };
        base.trim_end_matches('/')
    }
}

/// A fully described upstream call, built without touching the network.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl UpstreamRequest {
    /// Turn the description into a reqwest builder on `client`.
    pub fn into_builder(self, client: &reqwest::Client) -> reqwest::RequestBuilder {
        let mut builder = client.request(self.method, &self.url);
        for (name, value) in self.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = self.body {
            builder = builder.json(&body);
        }
        builder
    }
}

/// Request builder and response extractor for one provider wire shape.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Describe a chat completion call.
    fn chat_request(&self, cfg: &LlmConfig, messages: &[PayloadMessage], stream: bool) -> UpstreamRequest;

    /// Text carried by one upstream SSE `data:` payload, if any.
    fn extract_stream_delta(&self, payload: &str) -> Option<String>;

    /// Text of a non-streaming completion body.
    fn extract_completion(&self, body: &Value) -> Option<String>;

    /// Describe a model listing call; `None` means the provider has no
    /// listing endpoint and [`ProviderAdapter::static_models`] applies.
    fn models_request(&self, cfg: &LlmConfig) -> Option<UpstreamRequest>;

    fn static_models(&self) -> &'static [&'static str] {
        &[]
    }
}

// -- OpenAI SSE types -------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct OpenAIDelta {
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub delta: OpenAIDelta,
    #[allow(dead_code)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChunk {
    pub choices: Vec<OpenAIChoice>,
}

// -- Anthropic SSE types ----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AnthropicContentDelta {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AnthropicStreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub delta: Option<AnthropicContentDelta>,
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> Provider {
        Provider::Openai
    }

    fn chat_request(&self, cfg: &LlmConfig, messages: &[PayloadMessage], stream: bool) -> UpstreamRequest {
        let base = cfg.base();
        let url = if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        };
        UpstreamRequest {
            method: reqwest::Method::POST,
            url,
            headers: vec![("Authorization", format!("Bearer {}", cfg.api_key))],
            body: Some(json!({
                "model": model_or_default(cfg),
                "messages": messages,
                "stream": stream,
            })),
        }
    }

    fn extract_stream_delta(&self, payload: &str) -> Option<String> {
        let chunk: OpenAIChunk = serde_json::from_str(payload).ok()?;
        chunk.choices.into_iter().next()?.delta.content.filter(|c| !c.is_empty())
    }

    fn extract_completion(&self, body: &Value) -> Option<String> {
        body.pointer("/choices/0/message/content")?.as_str().map(str::to_string)
    }

    fn models_request(&self, cfg: &LlmConfig) -> Option<UpstreamRequest> {
        let base = cfg.base().trim_end_matches("/chat/completions").trim_end_matches('/');
        Some(UpstreamRequest {
            method: reqwest::Method::GET,
            url: format!("{}/models", base),
            headers: vec![("Authorization", format!("Bearer {}", cfg.api_key))],
            body: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const ANTHROPIC_MODELS: &[&str] = &[
    "claude-3-opus-20240229",
    "claude-3-sonnet-20240229",
    "claude-3-haiku-20240307",
    "claude-3-5-sonnet-20240620",
];

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    /// Split system prompts out and convert content parts to Anthropic blocks.
    pub fn convert_messages(messages: &[PayloadMessage]) -> (Option<String>, Vec<Value>) {
        let mut system = Vec::new();
        let mut converted = Vec::new();
        for m in messages {
            if m.role == Role::System {
                system.push(m.content.as_text());
                continue;
            }
            let content = match &m.content {
                MessageContent::Text(t) => Value::String(t.clone()),
                MessageContent::Parts(parts) => Value::Array(parts.iter().map(anthropic_block).collect()),
            };
            converted.push(json!({ "role": m.role, "content": content }));
        }
        let system = if system.is_empty() { None } else { Some(system.join("\n\n")) };
        (system, converted)
    }
}

fn anthropic_block(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({ "type": "text", "text": text }),
        ContentPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
            Some((media_type, data)) => json!({
                "type": "image",
                "source": { "type": "base64", "media_type": media_type, "data": data },
            }),
            None => json!({
                "type": "image",
                "source": { "type": "url", "url": image_url.url },
            }),
        },
    }
}

/// Split `data:image/png;base64,AAAA` into (`image/png`, `AAAA`).
pub fn parse_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type, data))
}

impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    fn chat_request(&self, cfg: &LlmConfig, messages: &[PayloadMessage], stream: bool) -> UpstreamRequest {
        let (system, converted) = Self::convert_messages(messages);
        let mut body = json!({
            "model": model_or_default(cfg),
            "messages": converted,
            "max_tokens": 4096,
            "stream": stream,
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        UpstreamRequest {
            method: reqwest::Method::POST,
            url: format!("{}/messages", cfg.base()),
            headers: vec![
                ("x-api-key", cfg.api_key.clone()),
                ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ],
            body: Some(body),
        }
    }

    fn extract_stream_delta(&self, payload: &str) -> Option<String> {
        let event: AnthropicStreamEvent = serde_json::from_str(payload).ok()?;
        if event.event_type != "content_block_delta" {
            return None;
        }
        event.delta?.text.filter(|t| !t.is_empty())
    }

    fn extract_completion(&self, body: &Value) -> Option<String> {
        let blocks = body.get("content")?.as_array()?;
        Some(
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(""),
        )
    }

    fn models_request(&self, _cfg: &LlmConfig) -> Option<UpstreamRequest> {
        None
    }

    fn static_models(&self) -> &'static [&'static str] {
        ANTHROPIC_MODELS
    }
}

fn model_or_default(cfg: &LlmConfig) -> &str {
    if cfg.model_id.trim().is_empty() {
        cfg.provider.default_model()
    } else {
        cfg.model_id.trim()
    }
}

// ---------------------------------------------------------------------------
// Adapter table
// ---------------------------------------------------------------------------

static OPENAI: OpenAiAdapter = OpenAiAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;

static ADAPTERS: &[(Provider, &(dyn ProviderAdapter))] = &[
    (Provider::Openai, &OPENAI),
    (Provider::Anthropic, &ANTHROPIC),
];

/// Adapter registered for `provider`.
pub fn adapter_for(provider: Provider) -> &'static dyn ProviderAdapter {
    ADAPTERS
        .iter()
        .find(|(p, _)| *p == provider)
        .map(|(_, adapter)| *adapter)
        .unwrap_or(&OPENAI)
}
