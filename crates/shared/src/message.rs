//! Conversation data model: messages and the keys transcripts are stored under.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::agent_api::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One turn in a conversation.
///
/// While `is_streaming` is set the content only ever grows; it is frozen once
/// the generation completes, fails or is aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, rename = "isStreaming")]
    pub is_streaming: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            is_streaming: false,
        }
    }

    /// An empty assistant message that tokens will be appended to.
    pub fn streaming_assistant() -> Self {
        Self {
            is_streaming: true,
            ..Self::new(Role::Assistant, "")
        }
    }

    pub fn append(&mut self, token: &str) {
        debug_assert!(self.is_streaming, "append on a frozen message");
        self.content.push_str(token);
    }

    pub fn freeze(&mut self) {
        self.is_streaming = false;
    }

    pub fn to_chat(&self) -> ChatMessage {
        ChatMessage::new(self.role, self.content.clone())
    }
}

/// Logical identity of a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    /// A document, keyed by its path
    File(PathBuf),
    /// A folder, keyed by its name
    Folder(String),
    /// The whole note library
    Root,
}

pub const FOLDER_KEY_PREFIX: &str = "__folder__/";
pub const ROOT_KEY: &str = "__root__";

impl ConversationKey {
    pub fn file(path: impl AsRef<Path>) -> Self {
        ConversationKey::File(path.as_ref().to_path_buf())
    }

    pub fn folder(name: impl Into<String>) -> Self {
        ConversationKey::Folder(name.into())
    }

    /// The opaque string the transcript store is keyed by.
    pub fn storage_key(&self) -> String {
        match self {
            ConversationKey::File(path) => path.to_string_lossy().to_string(),
            ConversationKey::Folder(name) => format!("{}{}", FOLDER_KEY_PREFIX, name),
            ConversationKey::Root => ROOT_KEY.to_string(),
        }
    }

    pub fn is_markdown(&self) -> bool {
        match self {
            ConversationKey::File(path) => path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_keys() {
        assert_eq!(ConversationKey::Root.storage_key(), "__root__");
        assert_eq!(
            ConversationKey::folder("Journal").storage_key(),
            "__folder__/Journal"
        );
        assert_eq!(ConversationKey::file("/notes/a.md").storage_key(), "/notes/a.md");
        assert_eq!(
            ConversationKey::file("/notes/a.md").to_string(),
            ConversationKey::file("/notes/a.md").storage_key()
        );
    }

    #[test]
    fn test_markdown_detection() {
        assert!(ConversationKey::file("/notes/Plan.MD").is_markdown());
        assert!(!ConversationKey::file("/notes/plan.txt").is_markdown());
        assert!(!ConversationKey::folder("plan.md").is_markdown());
    }

    #[test]
    fn test_message_serializes_streaming_flag() {
        let mut msg = Message::streaming_assistant();
        msg.append("hi");
        msg.freeze();
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["isStreaming"], false);
        assert_eq!(json["content"], "hi");
    }
}
