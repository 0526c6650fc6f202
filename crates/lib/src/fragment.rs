//! Decode one event-stream payload into a typed [`Fragment`].
//!
//! Wire payload: `{ "source", "models_usage", "metadata", "content", "type" }`.
//! Malformed payloads become a [`ParseError`]; the stream itself is unaffected.

use crate::config::StreamConfig;
use crate::message::Metadata;
use serde::Deserialize;

pub const DEFAULT_THINKING_TYPE: &str = "thinking_step";
pub const DEFAULT_TERMINAL_TYPE: &str = "ModelResponse";

/// Raw agent output as sent on the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentMessageOutput {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub models_usage: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub typ: Option<String>,
}

/// Classification of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    /// Reply text to merge into the open entry.
    Content,
    /// Intermediate step; not part of the reply text.
    Thinking,
    /// Last fragment of a reply; its text is merged, then the entry closes.
    Terminal,
    /// Recognized shape but a type the client was told to ignore.
    Unknown,
}

/// One decoded fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub kind: FragmentKind,
    /// The wire `type` tag, when present.
    pub source_kind: Option<String>,
    pub source: Option<String>,
    pub text: String,
    pub metadata: Option<Metadata>,
}

impl Fragment {
    pub fn content(text: impl Into<String>) -> Self {
        Self::with_kind(FragmentKind::Content, text)
    }

    pub fn thinking(text: impl Into<String>) -> Self {
        Self::with_kind(FragmentKind::Thinking, text)
    }

    pub fn terminal(text: impl Into<String>) -> Self {
        Self::with_kind(FragmentKind::Terminal, text)
    }

    fn with_kind(kind: FragmentKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            source_kind: None,
            source: None,
            text: text.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// True for kinds whose text belongs in the reply body.
    pub fn carries_content(&self) -> bool {
        matches!(self.kind, FragmentKind::Content | FragmentKind::Terminal)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unparseable stream payload: {cause}")]
pub struct ParseError {
    pub cause: String,
    pub raw: String,
}

/// Payload decoder with configurable `type` classification.
#[derive(Debug, Clone)]
pub struct FragmentParser {
    thinking_types: Vec<String>,
    terminal_types: Vec<String>,
    ignored_types: Vec<String>,
}

impl Default for FragmentParser {
    fn default() -> Self {
        Self {
            thinking_types: vec![DEFAULT_THINKING_TYPE.to_string()],
            terminal_types: vec![DEFAULT_TERMINAL_TYPE.to_string()],
            ignored_types: Vec::new(),
        }
    }
}

impl FragmentParser {
    pub fn from_config(stream: &StreamConfig) -> Self {
        Self {
            thinking_types: stream.thinking_types.clone(),
            terminal_types: stream.terminal_types.clone(),
            ignored_types: stream.ignored_types.clone(),
        }
    }

    pub fn parse(&self, raw: &str) -> Result<Fragment, ParseError> {
        let output: AgentMessageOutput =
            serde_json::from_str(raw).map_err(|e| ParseError {
                cause: e.to_string(),
                raw: raw.to_string(),
            })?;
        let kind = self.classify(output.typ.as_deref());
        Ok(Fragment {
            kind,
            source_kind: output.typ,
            source: output.source,
            text: output.content,
            metadata: output.metadata,
        })
    }

    fn classify(&self, typ: Option<&str>) -> FragmentKind {
        let Some(typ) = typ else {
            return FragmentKind::Content;
        };
        let matches = |list: &[String]| list.iter().any(|t| t == typ);
        if matches(&self.thinking_types) {
            FragmentKind::Thinking
        } else if matches(&self.terminal_types) {
            FragmentKind::Terminal
        } else if matches(&self.ignored_types) {
            FragmentKind::Unknown
        } else {
            FragmentKind::Content
        }
    }
}
