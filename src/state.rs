//! Client state container.
//!
//! Chat history, quota counter and credentials live in one value that is
//! loaded at session start, passed by `&mut` to whatever needs it and saved
//! at explicit checkpoints (after a chat turn, after a credential change).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::messages::ChatHistory;
use crate::quota::CredentialGate;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(default)]
    pub gate: CredentialGate,
    #[serde(default)]
    pub chat: ChatHistory,
}

impl ClientState {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            gate: CredentialGate::new(daily_limit),
            chat: ChatHistory::new(),
        }
    }

    /// Restore from `path`. A missing file yields fresh state with
    /// `daily_limit`; an existing one keeps its own counter, rolled over to
    /// today.
    pub fn load(path: &Path, daily_limit: u32) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no saved client state, starting fresh");
            return Ok(Self::new(daily_limit));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut state: ClientState = serde_json::from_str(&raw)?;
        state.gate.quota_mut().set_daily_limit(daily_limit);
        state.gate.refresh();
        Ok(state)
    }

    /// Write to `path` through a temporary file so a crash never leaves a
    /// half-written state behind.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
