//! Chat message types and the per-project chat history.
//!
//! ## Design
//! - `ChatHistory` owns every project's messages: project id → ordered `Vec<ChatMessage>`
//! - One project is "current"; its messages are mirrored into a working buffer
//! - Every mutation of the buffer is written back to that project's history entry
//! - Switching projects replaces the buffer and never touches the previous project

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// Reference to an image attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multi-part message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body: plain text or an ordered list of text / image parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Concatenated text of the message, ignoring images.
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Append streamed text. A multi-part body gets the text added to its
    /// last text part, or a new text part when it ends with an image.
    pub fn push_str(&mut self, fragment: &str) {
        match self {
            MessageContent::Text(t) => t.push_str(fragment),
            MessageContent::Parts(parts) => match parts.last_mut() {
                Some(ContentPart::Text { text }) => text.push_str(fragment),
                _ => parts.push(ContentPart::Text { text: fragment.to_string() }),
            },
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

/// A message as it appears on the wire to `/api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl PayloadMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self { role, content: content.into() }
    }
}

/// A message in the local chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> PayloadMessage {
        PayloadMessage { role: self.role, content: self.content.clone() }
    }
}

/// Chat history for all projects plus the working buffer of the current one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    current_project: Option<String>,
    messages: Vec<ChatMessage>,
    history: HashMap<String, Vec<ChatMessage>>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_project(&self) -> Option<&str> {
        self.current_project.as_deref()
    }

    /// Messages of the current project, in chronological order.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Stored messages of any project.
    pub fn history_for(&self, project_id: &str) -> &[ChatMessage] {
        self.history.get(project_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Make `project_id` current, loading its messages into the buffer.
    /// No-op when it already is current.
    pub fn switch_project(&mut self, project_id: &str) {
        if self.current_project.as_deref() == Some(project_id) {
            return;
        }
        self.messages = self.history.get(project_id).cloned().unwrap_or_default();
        self.current_project = Some(project_id.to_string());
    }

    /// Append a message to the current project and return its id.
    pub fn add_message(&mut self, role: Role, content: impl Into<MessageContent>) -> String {
        let msg = ChatMessage::new(role, content);
        let id = msg.id.clone();
        self.messages.push(msg);
        self.sync();
        id
    }

    /// Replace a message's content. Returns false when the id is unknown.
    pub fn update_message(&mut self, id: &str, content: impl Into<MessageContent>) -> bool {
        let Some(msg) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        msg.content = content.into();
        self.sync();
        true
    }

    /// Append a streamed fragment to a message's content.
    pub fn append_to_message(&mut self, id: &str, fragment: &str) -> bool {
        let Some(msg) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        msg.content.push_str(fragment);
        self.sync();
        true
    }

    pub fn remove_message(&mut self, id: &str) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| m.id != id);
        let removed = self.messages.len() != before;
        if removed {
            self.sync();
        }
        removed
    }

    pub fn clear_messages(&mut self) {
        self.messages.clear();
        self.sync();
    }

    /// Wire form of the current project's messages.
    pub fn payload(&self) -> Vec<PayloadMessage> {
        self.messages.iter().map(ChatMessage::to_payload).collect()
    }

    fn sync(&mut self) {
        if let Some(project) = &self.current_project {
            self.history.insert(project.clone(), self.messages.clone());
        }
    }
}
