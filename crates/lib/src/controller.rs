//! Session controller: the public face of a streaming chat session.
//!
//! One controller owns the message log, the accumulator and the event-stream
//! connection. It is driven from a single task: user actions call its methods and
//! stream events are handled one at a time, by [`SessionController::process_next_event`]
//! or inside [`SessionController::send_message`] while its request is in flight, so log
//! and status mutations never interleave.

use crate::accumulator::Accumulator;
use crate::fragment::FragmentParser;
use crate::lifecycle::{ConnectionState, LifecycleManager, StreamEvent};
use crate::message::{LogMutation, Message, MessageLog, Sender};
use crate::session::{Identity, SessionId, UserId};
use crate::transport::{OutboundMessage, SendError, Transport, TransportError};
use std::sync::Arc;

/// Turn status exposed to observers; exactly one value at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Connecting,
    Idle,
    AwaitingReply,
    Streaming,
    Errored,
}

/// Why a send was skipped without touching the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyText,
    #[error("no user identity established")]
    NoIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Skipped(ValidationError),
}

/// What observers are told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Log(LogMutation),
    Status(Status),
    /// A stream-level failure; the session is degraded, not ended.
    StreamError(TransportError),
    /// A payload could not be decoded and was dropped.
    FragmentDropped { cause: String },
}

pub type Listener = Box<dyn FnMut(&Notification) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct SessionController<T: Transport> {
    transport: Arc<T>,
    parser: FragmentParser,
    lifecycle: LifecycleManager,
    accumulator: Accumulator,
    log: MessageLog,
    status: Status,
    /// Set by `stop_streaming`: later fragments are merged but do not raise `Streaming`.
    display_stopped: bool,
    /// Reply content for the latest turn has arrived on the stream.
    reply_started: bool,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl<T: Transport> SessionController<T> {
    pub fn new(transport: T, parser: FragmentParser) -> Self {
        Self::with_shared_transport(Arc::new(transport), parser)
    }

    pub fn with_shared_transport(transport: Arc<T>, parser: FragmentParser) -> Self {
        Self {
            transport,
            parser,
            lifecycle: LifecycleManager::new(),
            accumulator: Accumulator::new(),
            log: MessageLog::new(),
            status: Status::Idle,
            display_stopped: false,
            reply_started: false,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn user_id(&self) -> Option<&UserId> {
        self.lifecycle.identity().map(|i| &i.user_id)
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.lifecycle.identity().map(|i| &i.session_id)
    }

    /// True while a reply is expected but nothing of it has been shown yet.
    pub fn show_typing_indicator(&self) -> bool {
        matches!(self.status, Status::AwaitingReply | Status::Streaming)
            && self.log.last().map(|m| m.sender) == Some(Sender::User)
    }

    /// Thinking text recorded on the most recent bot reply.
    pub fn latest_thinking(&self) -> Option<&str> {
        self.log
            .messages()
            .iter()
            .rev()
            .find(|m| m.sender == Sender::Bot)
            .and_then(|m| m.thinking.as_deref())
    }

    /// True while the session has no messages and no reply is pending.
    pub fn show_starter_prompts(&self) -> bool {
        self.log.is_empty() && !matches!(self.status, Status::AwaitingReply | Status::Streaming)
    }

    /// Assign the user and open a fresh session. A blank user is a no-op; the same user
    /// again is a no-op; a different user tears the current session down first.
    pub fn initialize(&mut self, user: impl Into<UserId>) {
        let user = user.into();
        if user.trim().is_empty() {
            log::debug!("initialize without a user; staying unconnected");
            return;
        }
        if self.user_id() == Some(&user) {
            return;
        }
        if self.lifecycle.identity().is_some() {
            self.teardown();
        }
        if let Some(identity) = Identity::new(user) {
            self.connect(identity);
        }
    }

    /// Same user, new session id, new connection. No-op without an identity.
    pub fn reset(&mut self) {
        let Some(identity) = self.lifecycle.identity().map(Identity::renewed) else {
            return;
        };
        self.close_open_entry();
        self.display_stopped = false;
        self.connect(identity);
    }

    /// Release the connection and forget the identity. The log is kept; an unfinished
    /// reply is closed as it stands.
    pub fn teardown(&mut self) {
        self.close_open_entry();
        self.lifecycle.release();
        self.display_stopped = false;
        self.reply_started = false;
        self.set_status(Status::Idle);
    }

    /// Append the user's message and submit it. The user entry is in the log before the
    /// request is dispatched. Stream events keep being handled while the request is in
    /// flight, so a reply may already be streaming by the time this returns.
    ///
    /// A request failure only ends the turn if none of its reply has arrived yet.
    pub async fn send_message(&mut self, text: &str) -> Result<SendOutcome, SendError> {
        if text.trim().is_empty() {
            return Ok(SendOutcome::Skipped(ValidationError::EmptyText));
        }
        let Some(identity) = self.lifecycle.identity().cloned() else {
            return Ok(SendOutcome::Skipped(ValidationError::NoIdentity));
        };

        self.close_open_entry();
        self.display_stopped = false;
        self.reply_started = false;
        self.commit(LogMutation::Append(Message::user(text)));
        if self.lifecycle.state() == ConnectionState::Errored {
            log::warn!("event stream is down; no reply will be shown until the session is reset");
        } else {
            self.set_status(Status::AwaitingReply);
        }

        let transport = Arc::clone(&self.transport);
        let request = OutboundMessage::text(text, identity.user_id, identity.session_id);
        let post = async move { transport.post_message(&request).await };
        tokio::pin!(post);
        let result = loop {
            tokio::select! {
                biased;
                Some(event) = self.lifecycle.recv() => self.handle_stream_event(event),
                result = &mut post => break result,
            }
        };

        if result.is_err() && !self.reply_started {
            self.drain_queued_events().await;
        }
        match result {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) if self.reply_started => {
                log::warn!("message request failed after its reply began: {}", e);
                Ok(SendOutcome::Sent)
            }
            Err(e) => {
                log::warn!("sending message failed: {}", e);
                self.commit(LogMutation::Append(Message::bot(format!("Error: {}", e))));
                let settled = self.settled_status();
                self.set_status(settled);
                Err(e)
            }
        }
    }

    /// Stop showing the reply as in progress. The connection stays open and fragments
    /// that still arrive are merged into the log.
    pub fn stop_streaming(&mut self) {
        self.display_stopped = true;
        if matches!(self.status, Status::AwaitingReply | Status::Streaming) {
            self.set_status(Status::Idle);
        }
    }

    /// Register a listener for every log mutation and status transition.
    pub fn subscribe(
        &mut self,
        listener: impl FnMut(&Notification) + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    /// Wait for the next event on the stream and handle it. Returns false when there is
    /// no connection or the stream has ended, i.e. nothing more will arrive until
    /// `initialize` or `reset`.
    pub async fn process_next_event(&mut self) -> bool {
        match self.lifecycle.recv().await {
            Some(event) => {
                self.handle_stream_event(event);
                true
            }
            None => false,
        }
    }

    /// Let the reader forward what it has already received, then handle all of it.
    async fn drain_queued_events(&mut self) {
        tokio::task::yield_now().await;
        while let Some(event) = self.lifecycle.try_recv() {
            self.handle_stream_event(event);
        }
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Opened => {
                log::info!("event stream open");
                if self.status == Status::Connecting {
                    self.set_status(Status::Idle);
                }
            }
            StreamEvent::Payload(raw) => self.handle_payload(&raw),
            StreamEvent::Failed(e) => {
                self.close_open_entry();
                self.display_stopped = false;
                self.set_status(Status::Errored);
                self.notify(&Notification::StreamError(e));
            }
        }
    }

    fn handle_payload(&mut self, raw: &str) {
        let fragment = match self.parser.parse(raw) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping stream payload: {} (raw: {})", e.cause, e.raw);
                self.notify(&Notification::FragmentDropped { cause: e.cause });
                return;
            }
        };
        let carries_content = fragment.carries_content();
        let mutations = self.accumulator.apply(fragment);
        let closed = mutations
            .iter()
            .any(|m| matches!(m, LogMutation::Close { .. }));
        let opened_or_grew = carries_content
            && mutations
                .iter()
                .any(|m| matches!(m, LogMutation::Append(_) | LogMutation::Patch { .. }));
        for m in mutations {
            self.commit(m);
        }
        if opened_or_grew {
            self.reply_started = true;
        }
        if closed {
            self.display_stopped = false;
            if matches!(self.status, Status::AwaitingReply | Status::Streaming) {
                self.set_status(Status::Idle);
            }
        } else if opened_or_grew && !self.display_stopped {
            self.set_status(Status::Streaming);
        }
    }

    fn connect(&mut self, identity: Identity) {
        self.lifecycle.connect(Arc::clone(&self.transport), identity);
        self.set_status(Status::Connecting);
    }

    /// Implicit terminal: close the open bot entry, keeping whatever it holds.
    fn close_open_entry(&mut self) {
        if let Some(m) = self.accumulator.close() {
            self.commit(m);
        }
    }

    /// Status once nothing is pending, given the connection state.
    fn settled_status(&self) -> Status {
        match self.lifecycle.state() {
            ConnectionState::Errored => Status::Errored,
            ConnectionState::Connecting => Status::Connecting,
            ConnectionState::Listening | ConnectionState::Unconnected => Status::Idle,
        }
    }

    fn commit(&mut self, mutation: LogMutation) {
        if let Err(e) = self.log.apply(&mutation) {
            log::warn!("discarding log mutation: {}", e);
            return;
        }
        self.notify(&Notification::Log(mutation));
    }

    fn set_status(&mut self, status: Status) {
        if self.status == status {
            return;
        }
        log::debug!("status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.notify(&Notification::Status(status));
    }

    fn notify(&mut self, notification: &Notification) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(notification);
        }
    }
}
