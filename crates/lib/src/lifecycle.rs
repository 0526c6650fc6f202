//! Session lifecycle: identity plus the one event-stream connection it owns.
//!
//! The connection is read by a background task that forwards events over a channel.
//! Each connection has its own channel, so events from a released connection are
//! never observed. Dropping the connection aborts the reader.

use crate::session::Identity;
use crate::transport::{Transport, TransportError};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Listening,
    Errored,
}

/// What the reader task observed on the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The server acknowledged the subscription.
    Opened,
    /// One raw event payload.
    Payload(String),
    /// The connection failed or was closed by the server. Always the last event.
    Failed(TransportError),
}

struct Connection {
    events: mpsc::Receiver<StreamEvent>,
    reader: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Owns identity and the event-stream connection; tracks the connection state machine.
pub struct LifecycleManager {
    identity: Option<Identity>,
    state: ConnectionState,
    connection: Option<Connection>,
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self {
            identity: None,
            state: ConnectionState::Unconnected,
            connection: None,
        }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Adopt `identity` and start connecting. Any previous connection is released first.
    /// Must be called inside a tokio runtime.
    pub fn connect<T: Transport>(&mut self, transport: Arc<T>, identity: Identity) {
        self.release();
        log::info!(
            "connecting event stream for user {} session {}",
            identity.user_id,
            identity.session_id
        );
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let reader = tokio::spawn(read_stream(transport, identity.clone(), tx));
        self.identity = Some(identity);
        self.connection = Some(Connection { events: rx, reader });
        self.state = ConnectionState::Connecting;
    }

    /// Wait for the next stream event and apply its state transition.
    /// Returns `None` when there is no connection or the reader has finished.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        let event = self.connection.as_mut()?.events.recv().await?;
        self.observe(&event);
        Some(event)
    }

    /// Take an event the reader has already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        let event = self.connection.as_mut()?.events.try_recv().ok()?;
        self.observe(&event);
        Some(event)
    }

    fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Opened | StreamEvent::Payload(_) => {
                self.state = ConnectionState::Listening;
            }
            StreamEvent::Failed(e) => {
                log::warn!("event stream failed: {}", e);
                self.state = ConnectionState::Errored;
            }
        }
    }

    /// Release the connection and forget the identity. Returns the identity that was held.
    pub fn release(&mut self) -> Option<Identity> {
        if self.connection.take().is_some() {
            log::debug!("event stream connection released");
        }
        self.state = ConnectionState::Unconnected;
        self.identity.take()
    }
}

async fn read_stream<T: Transport>(
    transport: Arc<T>,
    identity: Identity,
    tx: mpsc::Sender<StreamEvent>,
) {
    let mut stream = match transport
        .open_stream(&identity.user_id, &identity.session_id)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            let _ = tx.send(StreamEvent::Failed(e)).await;
            return;
        }
    };
    if tx.send(StreamEvent::Opened).await.is_err() {
        return;
    }
    while let Some(item) = stream.next().await {
        let (event, last) = match item {
            Ok(payload) => (StreamEvent::Payload(payload), false),
            Err(e) => (StreamEvent::Failed(e), true),
        };
        if tx.send(event).await.is_err() {
            log::debug!("event receiver dropped, stopping stream reader");
            return;
        }
        if last {
            return;
        }
    }
    let _ = tx.send(StreamEvent::Failed(TransportError::Closed)).await;
}
