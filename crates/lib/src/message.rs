//! Conversation messages and the append/patch-only message log.
//!
//! The log is the single source of truth a presentation layer renders. Entries are
//! appended or have their open entry patched; order is insertion order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique message identifier (opaque string).
pub type MessageId = String;

/// Opaque key-value payload carried from the stream source.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

/// One entry in the message log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub content: String,
    /// Side-channel commentary; set at most once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    /// True while this entry is the target of fragment merges.
    #[serde(default)]
    pub open: bool,
}

impl Message {
    /// A closed user entry with a fresh id.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            id: new_message_id(),
            sender: Sender::User,
            content: content.into(),
            thinking: None,
            metadata: None,
            created_at: Utc::now(),
            open: false,
        }
    }

    /// A closed bot entry with a fresh id (used for locally generated replies such as send errors).
    pub fn bot(content: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            ..Self::user(content)
        }
    }
}

pub fn new_message_id() -> MessageId {
    uuid::Uuid::new_v4().to_string()
}

/// A change to the log. Patches replace the entry's content in place; they are not deltas.
#[derive(Debug, Clone, PartialEq)]
pub enum LogMutation {
    Append(Message),
    Patch {
        id: MessageId,
        content: String,
    },
    /// Attach thinking and/or metadata to an open entry. Fields already set are left alone.
    Annotate {
        id: MessageId,
        thinking: Option<String>,
        metadata: Option<Metadata>,
    },
    Close {
        id: MessageId,
    },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogError {
    #[error("duplicate message id: {0}")]
    DuplicateId(MessageId),
    #[error("unknown message id: {0}")]
    UnknownId(MessageId),
    #[error("message {0} is not open for accumulation")]
    NotOpen(MessageId),
    #[error("cannot open {0}: another bot entry is still open")]
    AlreadyOpen(MessageId),
}

/// Ordered message log. Only [`LogMutation`]s change it.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: Vec<Message>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.entries.iter().find(|m| m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.last()
    }

    /// The bot entry currently open for accumulation, if any.
    pub fn open_entry(&self) -> Option<&Message> {
        self.entries.iter().rev().find(|m| m.open)
    }

    /// Apply one mutation, enforcing the log invariants.
    pub fn apply(&mut self, mutation: &LogMutation) -> Result<(), LogError> {
        match mutation {
            LogMutation::Append(message) => {
                if self.get(&message.id).is_some() {
                    return Err(LogError::DuplicateId(message.id.clone()));
                }
                if message.open {
                    if let Some(open) = self.open_entry() {
                        return Err(LogError::AlreadyOpen(open.id.clone()));
                    }
                }
                let mut message = message.clone();
                if message.sender == Sender::User {
                    message.open = false;
                }
                self.entries.push(message);
            }
            LogMutation::Patch { id, content } => {
                let entry = self.open_mut(id)?;
                entry.content.clone_from(content);
            }
            LogMutation::Annotate {
                id,
                thinking,
                metadata,
            } => {
                let entry = self.open_mut(id)?;
                if entry.thinking.is_none() {
                    entry.thinking.clone_from(thinking);
                }
                if entry.metadata.is_none() {
                    entry.metadata.clone_from(metadata);
                }
            }
            LogMutation::Close { id } => {
                let entry = self
                    .entries
                    .iter_mut()
                    .find(|m| &m.id == id)
                    .ok_or_else(|| LogError::UnknownId(id.clone()))?;
                entry.open = false;
            }
        }
        Ok(())
    }

    fn open_mut(&mut self, id: &str) -> Result<&mut Message, LogError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| LogError::UnknownId(id.to_string()))?;
        if !entry.open {
            return Err(LogError::NotOpen(id.to_string()));
        }
        Ok(entry)
    }
}
