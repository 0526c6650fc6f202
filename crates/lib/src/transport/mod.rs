//! Request channel and event stream to the remote agent.
//!
//! [`Transport`] is the seam between the session controller and the network:
//! [`HttpTransport`] talks to a real server, tests plug in an in-memory double.

mod http;
mod sse;

pub use http::HttpTransport;
pub use sse::SseDecoder;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Body of the outbound request for one user turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub source: String,
    pub user_id: String,
    pub session_id: String,
}

impl OutboundMessage {
    pub fn text(
        content: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            typ: "TextMessage".to_string(),
            source: "user".to_string(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// Failure of the outbound request for one turn.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("{0}")]
    Network(String),
    #[error("{detail}")]
    ServerRejected { status: u16, detail: String },
}

/// Connection-level failure of the event stream.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("event stream request failed: {0}")]
    Request(String),
    #[error("event stream rejected: {status} {body}")]
    Status { status: u16, body: String },
    #[error("event stream closed by server")]
    Closed,
}

/// Raw event payloads in delivery order. An `Err` item ends the stream.
pub type PayloadStream = BoxStream<'static, Result<String, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Submit one user message. Resolves once the server accepts it; the reply arrives on the stream.
    async fn post_message(&self, message: &OutboundMessage) -> Result<(), SendError>;

    /// Open the long-lived event stream for `(user_id, session_id)`. Resolves once the
    /// server has acknowledged the subscription.
    async fn open_stream(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<PayloadStream, TransportError>;
}
