//! HTTP client for the `/api` surface.
//!
//! Every call goes through the [`CredentialGate`]: the pre-flight quota
//! check happens before a socket is opened, credential headers are attached
//! from the gate, and the consume decision is taken from the server's
//! `X-Quota-Exempt` header once a 2xx response arrived.

use serde::{Deserialize, Serialize};

use crate::error::{NexusError, Result};
use crate::messages::{PayloadMessage, Role};
use crate::page::{ParseUrlRequest, ParseUrlResponse, ParsedPage};
use crate::providers::LlmConfig;
use crate::quota::{CredentialGate, QUOTA_EXEMPT_HEADER};
use crate::request::{build_request_body, ModelsRequest};
use crate::sse::consume_stream;
use crate::state::ClientState;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8787/api";

#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelList {
    pub data: Vec<ModelEntry>,
}

pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
}

impl ChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    async fn post<T: Serialize>(&self, gate: &CredentialGate, name: &str, body: &T) -> Result<reqwest::Response> {
        let mut request = self.http.post(self.endpoint(name)).json(body);
        for (header, value) in gate.request_headers() {
            request = request.header(header, value);
        }
        let response = request.send().await?;
        check_status(response).await
    }

    /// Stream a chat completion. `on_chunk` sees every fragment with the
    /// content so far; `on_complete` sees the final content once.
    pub async fn stream_chat<F, G>(
        &self,
        gate: &mut CredentialGate,
        messages: Vec<PayloadMessage>,
        on_chunk: F,
        on_complete: G,
    ) -> Result<String>
    where
        F: FnMut(&str, &str),
        G: FnOnce(&str),
    {
        gate.ensure_quota_available()?;
        let body = build_request_body(messages, true, gate.credentials());
        let response = self.post(gate, "chat", &body).await?;

        gate.consume_from_header(exempt_header(&response).as_deref());

        if response.content_length() == Some(0) {
            return Err(NexusError::StreamUnavailable);
        }

        let content = consume_stream(response.bytes_stream(), on_chunk).await?;
        on_complete(&content);
        Ok(content)
    }

    /// Non-streaming chat completion.
    pub async fn chat(&self, gate: &mut CredentialGate, messages: Vec<PayloadMessage>) -> Result<String> {
        gate.ensure_quota_available()?;
        let body = build_request_body(messages, false, gate.credentials());
        let response = self.post(gate, "chat", &body).await?;

        gate.consume_from_header(exempt_header(&response).as_deref());

        let body: CompletionBody = response.json().await?;
        Ok(body.content.or(body.message).unwrap_or_default())
    }

    /// Model ids offered by the provider the server would route to.
    /// `override_config` takes precedence over the stored LLM config.
    pub async fn list_models(&self, gate: &CredentialGate, override_config: Option<&LlmConfig>) -> Result<Vec<String>> {
        let body = ModelsRequest {
            llm_config: override_config.or_else(|| gate.credentials().llm_config()).cloned(),
        };
        let response = self.post(gate, "models", &body).await?;
        let value: serde_json::Value = response.json().await?;
        Ok(serde_json::from_value::<ModelList>(value)
            .map(|list| list.data.into_iter().map(|m| m.id).collect())
            .unwrap_or_default())
    }

    /// Fetch and extract a web page through the server. Does not count
    /// against the daily quota.
    pub async fn parse_url(&self, gate: &CredentialGate, url: &str) -> Result<ParsedPage> {
        let mut request = self.http.post(self.endpoint("parse-url")).json(&ParseUrlRequest { url: url.to_string() });
        for (header, value) in gate.request_headers() {
            request = request.header(header, value);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(NexusError::AuthRejected(error_text(&text)));
        }

        let parsed: Option<ParseUrlResponse> = serde_json::from_str(&text).ok();
        match parsed {
            Some(ParseUrlResponse { success: true, data: Some(page), .. }) if status.is_success() => Ok(page),
            other => {
                let body = other
                    .and_then(|r| r.error)
                    .unwrap_or_else(|| "failed to parse URL".to_string());
                tracing::warn!(status = status.as_u16(), error = %body, "parse-url rejected");
                Err(NexusError::RequestFailed { status: status.as_u16(), body })
            }
        }
    }
}

fn exempt_header(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(QUOTA_EXEMPT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Map non-2xx responses to the error taxonomy, keeping the body text.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::warn!(status = status.as_u16(), body = %body, "chat request rejected");
    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(NexusError::AuthRejected(error_text(&body)));
    }
    Err(NexusError::RequestFailed { status: status.as_u16(), body })
}

/// `{"error": "..."}` bodies collapse to their message.
fn error_text(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// One chat turn against a project's history.
pub struct ChatSession<'a> {
    client: &'a ChatClient,
    system_prompt: Option<String>,
}

impl<'a> ChatSession<'a> {
    pub fn new(client: &'a ChatClient) -> Self {
        Self { client, system_prompt: None }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Append `prompt` to `project_id`'s history and stream the assistant
    /// reply into a new message. On failure the partial reply is removed.
    pub async fn send<F>(&self, state: &mut ClientState, project_id: &str, prompt: &str, mut on_chunk: F) -> Result<String>
    where
        F: FnMut(&str, &str),
    {
        state.gate.ensure_quota_available()?;

        state.chat.switch_project(project_id);
        state.chat.add_message(Role::User, prompt);

        let mut payload = Vec::new();
        if let Some(system) = &self.system_prompt {
            payload.push(PayloadMessage::new(Role::System, system.as_str()));
        }
        payload.extend(state.chat.payload());

        let assistant_id = state.chat.add_message(Role::Assistant, "");
        let ClientState { gate, chat } = state;

        let result = self
            .client
            .stream_chat(
                gate,
                payload,
                |fragment, total| {
                    chat.append_to_message(&assistant_id, fragment);
                    on_chunk(fragment, total);
                },
                |content| tracing::debug!(chars = content.len(), project = project_id, "assistant reply complete"),
            )
            .await;

        if let Err(e) = &result {
            tracing::warn!(error = %e, project = project_id, "chat turn failed");
            chat.remove_message(&assistant_id);
        }
        result
    }

    /// Non-streaming variant of [`Self::send`]; the assistant message is
    /// only recorded once the whole reply arrived.
    pub async fn complete(&self, state: &mut ClientState, project_id: &str, prompt: &str) -> Result<String> {
        state.gate.ensure_quota_available()?;

        state.chat.switch_project(project_id);
        state.chat.add_message(Role::User, prompt);

        let mut payload = Vec::new();
        if let Some(system) = &self.system_prompt {
            payload.push(PayloadMessage::new(Role::System, system.as_str()));
        }
        payload.extend(state.chat.payload());

        let content = self.client.chat(&mut state.gate, payload).await?;
        state.chat.add_message(Role::Assistant, content.as_str());
        Ok(content)
    }
}
