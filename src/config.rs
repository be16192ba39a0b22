//! Server and client configuration.
//!
//! Server settings resolve as built-in defaults, then an optional TOML file,
//! then environment variables. Command-line flags are applied last by the
//! binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::client::DEFAULT_SERVER_URL;
use crate::error::{NexusError, Result};
use crate::providers::{LlmConfig, Provider};
use crate::quota::DEFAULT_DAILY_LIMIT;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_STATE_PATH: &str = "./draw-nexus-state.json";

/// Proxy settings: the default upstream plus the shared access password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub provider: Provider,
    pub base_url: String,
    pub api_key: String,
    pub model_id: String,
    pub access_password: Option<String>,
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            provider: Provider::Openai,
            base_url: Provider::Openai.default_base_url().to_string(),
            api_key: String::new(),
            model_id: Provider::Openai.default_model().to_string(),
            access_password: None,
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    /// Defaults, overlaid with `path` (if given) and then the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| NexusError::Config(e.to_string()))
    }

    /// Overlay variables read through `lookup`. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AI_PROVIDER") {
            self.provider = v.parse().map_err(NexusError::Config)?;
        }
        if let Some(v) = get("AI_BASE_URL") {
            self.base_url = v;
        }
        if let Some(v) = get("AI_API_KEY") {
            self.api_key = v;
        }
        if let Some(v) = get("AI_MODEL_ID") {
            self.model_id = v;
        }
        if let Some(v) = get("ACCESS_PASSWORD") {
            self.access_password = Some(v);
        }
        if let Some(v) = get("BIND") {
            self.bind = v;
        }
        if let Some(v) = get("PORT") {
            self.port = v
                .trim()
                .parse()
                .map_err(|_| NexusError::Config(format!("invalid PORT '{}'", v)))?;
        }
        Ok(())
    }

    /// The configured password, if non-empty.
    pub fn access_password(&self) -> Option<&str> {
        self.access_password.as_deref().filter(|p| !p.is_empty())
    }

    /// The server's own upstream settings.
    pub fn default_llm(&self) -> LlmConfig {
        LlmConfig {
            provider: self.provider,
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model_id: self.model_id.clone(),
        }
    }

    /// Settings to call upstream with. A caller-supplied config wins when it
    /// carries an api key; its empty fields fall back to the server default
    /// for the caller's provider.
    pub fn effective(&self, custom: Option<&LlmConfig>) -> LlmConfig {
        match custom.filter(|c| c.is_active()) {
            Some(c) => {
                let same_provider = c.provider == self.provider;
                let pick = |mine: &str, server: &str, fallback: &str| {
                    if !mine.trim().is_empty() {
                        mine.trim().to_string()
                    } else if same_provider {
                        server.to_string()
                    } else {
                        fallback.to_string()
                    }
                };
                LlmConfig {
                    provider: c.provider,
                    base_url: pick(&c.base_url, &self.base_url, c.provider.default_base_url()),
                    api_key: c.api_key.trim().to_string(),
                    model_id: pick(&c.model_id, &self.model_id, c.provider.default_model()),
                }
            }
            None => self.default_llm(),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Where the CLI client talks to and keeps its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub server_url: String,
    pub state_path: PathBuf,
    pub daily_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            daily_limit: DEFAULT_DAILY_LIMIT,
        }
    }
}

impl ClientConfig {
    /// WebSocket URL of the relay for `project_id`, which is sent as one
    /// percent-encoded path segment.
    pub fn collab_url(&self, project_id: &str) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/collab/{}", ws, urlencoding::encode(project_id))
    }
}
