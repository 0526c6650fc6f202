//! Merge successive bot fragments of one reply into a single growing log entry.

use crate::fragment::{Fragment, FragmentKind};
use crate::message::{new_message_id, LogMutation, Message, MessageId, Metadata, Sender};

/// Explicit accumulation state: the open entry and its running content.
#[derive(Debug, Default)]
pub struct Accumulator {
    open_entry: Option<MessageId>,
    buffer: String,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_entry(&self) -> Option<&str> {
        self.open_entry.as_deref()
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Fold one fragment into the state and return the log mutations it causes.
    pub fn apply(&mut self, fragment: Fragment) -> Vec<LogMutation> {
        match fragment.kind {
            FragmentKind::Content => self.merge(fragment).into_iter().collect(),
            FragmentKind::Terminal => {
                let mut out: Vec<LogMutation> = self.merge(fragment).into_iter().collect();
                out.extend(self.close());
                out
            }
            FragmentKind::Thinking => self.annotate(fragment).into_iter().collect(),
            FragmentKind::Unknown => {
                log::debug!(
                    "ignoring fragment of type {:?}",
                    fragment.source_kind.as_deref().unwrap_or("")
                );
                Vec::new()
            }
        }
    }

    /// Close the open entry, if any. Used for explicit terminals and as the implicit
    /// terminal on stream end, stream error, or a new turn.
    pub fn close(&mut self) -> Option<LogMutation> {
        self.buffer.clear();
        self.open_entry.take().map(|id| LogMutation::Close { id })
    }

    fn merge(&mut self, fragment: Fragment) -> Option<LogMutation> {
        match &self.open_entry {
            Some(id) => {
                if fragment.text.is_empty() {
                    return None;
                }
                self.buffer.push_str(&fragment.text);
                Some(LogMutation::Patch {
                    id: id.clone(),
                    content: self.buffer.clone(),
                })
            }
            None => {
                if fragment.text.is_empty() {
                    return None;
                }
                let id = new_message_id();
                self.buffer = fragment.text.clone();
                self.open_entry = Some(id.clone());
                let thinking = fragment.metadata.as_ref().and_then(metadata_thinking);
                Some(LogMutation::Append(Message {
                    id,
                    sender: Sender::Bot,
                    content: fragment.text,
                    thinking,
                    metadata: fragment.metadata,
                    created_at: chrono::Utc::now(),
                    open: true,
                }))
            }
        }
    }

    fn annotate(&mut self, fragment: Fragment) -> Option<LogMutation> {
        let Some(id) = &self.open_entry else {
            log::debug!("dropping thinking fragment with no open reply");
            return None;
        };
        let thinking = Some(fragment.text).filter(|t| !t.trim().is_empty());
        if thinking.is_none() && fragment.metadata.is_none() {
            return None;
        }
        Some(LogMutation::Annotate {
            id: id.clone(),
            thinking,
            metadata: fragment.metadata,
        })
    }
}

/// Pretty-printed metadata used as the entry's thinking text when the first fragment carries any.
fn metadata_thinking(metadata: &Metadata) -> Option<String> {
    if metadata.is_empty() {
        return None;
    }
    serde_json::to_string_pretty(metadata).ok()
}
