//! Body of a `/api/chat` request.

use serde::{Deserialize, Serialize};

use crate::messages::PayloadMessage;
use crate::providers::LlmConfig;
use crate::quota::Credentials;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<PayloadMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
}

/// Body of a `/api/models` request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_config: Option<LlmConfig>,
}

/// Assemble a chat request. The caller's own LLM config is attached only
/// when no access password is active, so the server routes to that provider
/// instead of its default.
pub fn build_request_body(messages: Vec<PayloadMessage>, stream: bool, credentials: &Credentials) -> ChatRequest {
    let llm_config = if credentials.has_access_password() {
        None
    } else {
        credentials.llm_config().cloned()
    };
    ChatRequest { messages, stream, llm_config }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Role;
    use crate::providers::Provider;

    fn byok() -> LlmConfig {
        LlmConfig {
            provider: Provider::Anthropic,
            base_url: String::new(),
            api_key: "sk-ant".into(),
            model_id: String::new(),
        }
    }

    #[test]
    fn test_body_without_credentials_has_no_llm_config() {
        let body = build_request_body(vec![PayloadMessage::new(Role::User, "hi")], true, &Credentials::default());
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], true);
        assert!(json.get("llmConfig").is_none());
        assert_eq!(json["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_body_attaches_llm_config() {
        let mut creds = Credentials::default();
        creds.set_llm_config(byok());
        let body = build_request_body(vec![], false, &creds);
        assert_eq!(body.llm_config, Some(byok()));
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["llmConfig"]["provider"], "anthropic");
        assert_eq!(json["llmConfig"]["apiKey"], "sk-ant");
    }

    #[test]
    fn test_password_suppresses_llm_config() {
        let mut creds = Credentials::default();
        creds.set_llm_config(byok());
        creds.set_access_password("pw");
        let body = build_request_body(vec![], true, &creds);
        assert!(body.llm_config.is_none());
    }

    #[test]
    fn test_chat_request_parses_minimal_body() {
        let req: ChatRequest = serde_json::from_str(r#"{"messages":[]}"#).unwrap();
        assert!(!req.stream);
        assert!(req.llm_config.is_none());
    }
}
