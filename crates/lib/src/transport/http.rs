//! HTTP transport: JSON POST for messages, Server-Sent Events for replies.

use super::{OutboundMessage, PayloadStream, SendError, SseDecoder, Transport, TransportError};
use crate::config::{self, Config};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::Url;
use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;

const SEND_FAILED_FALLBACK: &str = "Failed to send message.";

/// Client for the agent server's chat API.
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    message_path: String,
    events_path: String,
    request_timeout: Duration,
    client: reqwest::Client,
}

/// Error body returned by the server on a rejected message.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    detail: Option<serde_json::Value>,
}

impl HttpTransport {
    /// Default endpoint paths on the given server.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_base_url(&Config::default(), base_url)
    }

    /// Build from config; the base URL honors KIJANG_SERVER_URL.
    pub fn from_config(config: &Config) -> Self {
        Self::with_base_url(config, config::resolve_server_url(config))
    }

    /// Endpoint paths and timeout from config, server given explicitly.
    pub fn with_base_url(config: &Config, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            message_path: config.server.message_path.clone(),
            events_path: config.server.events_path.clone(),
            request_timeout: Duration::from_secs(config.server.request_timeout_secs),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn message_url(&self) -> String {
        format!("{}{}", self.base_url, self.message_path)
    }

    /// `{base}{events_path}/{user_id}/{session_id}` with both ids percent-encoded as path segments.
    fn events_url(&self, user_id: &str, session_id: &str) -> Result<Url, TransportError> {
        let mut url = Url::parse(&format!("{}{}", self.base_url, self.events_path))
            .map_err(|e| TransportError::Request(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| TransportError::Request("base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(user_id)
            .push(session_id);
        Ok(url)
    }
}

/// Human-readable reason for a rejected message: `detail` from the body, else the status reason.
fn rejection_detail(status: reqwest::StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.detail)
        .and_then(|d| match d {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });
    detail
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| SEND_FAILED_FALLBACK.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_message(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let url = self.message_url();
        let res = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(message)
            .send()
            .await
            .map_err(|e| SendError::Network(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SendError::ServerRejected {
                status: status.as_u16(),
                detail: rejection_detail(status, &body),
            });
        }
        log::debug!("message accepted by {}", url);
        Ok(())
    }

    async fn open_stream(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<PayloadStream, TransportError> {
        let url = self.events_url(user_id, session_id)?;
        log::info!("opening event stream {}", url);
        let res = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let state = DecodeState {
            bytes: res
                .bytes_stream()
                .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
                .boxed(),
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            body_ended: false,
            done: false,
        };
        Ok(futures_util::stream::unfold(state, next_payload).boxed())
    }
}

struct DecodeState {
    bytes: BoxStream<'static, Result<Vec<u8>, String>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    body_ended: bool,
    done: bool,
}

/// Pull bytes until at least one payload is decoded. End of body yields a final
/// `Closed` error, since the stream is expected to stay open for the session.
async fn next_payload(
    mut state: DecodeState,
) -> Option<(Result<String, TransportError>, DecodeState)> {
    loop {
        if let Some(payload) = state.ready.pop_front() {
            return Some((Ok(payload), state));
        }
        if state.done {
            return None;
        }
        if state.body_ended {
            state.done = true;
            return Some((Err(TransportError::Closed), state));
        }
        match state.bytes.next().await {
            Some(Ok(chunk)) => state.ready.extend(state.decoder.feed(&chunk)),
            Some(Err(e)) => {
                state.done = true;
                return Some((Err(TransportError::Request(e)), state));
            }
            None => {
                state.body_ended = true;
                state.ready.extend(state.decoder.finish());
            }
        }
    }
}
