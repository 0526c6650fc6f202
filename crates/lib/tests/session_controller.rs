//! Session controller behaviour against an in-memory transport: the test plays the
//! server by pushing payloads onto the event stream and scripting message replies.

use async_trait::async_trait;
use futures_util::StreamExt;
use kijang::controller::{Notification, SendOutcome, SessionController, Status, ValidationError};
use kijang::fragment::FragmentParser;
use kijang::lifecycle::ConnectionState;
use kijang::message::{LogMutation, Sender};
use kijang::transport::{OutboundMessage, PayloadStream, SendError, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

type StreamTx = mpsc::UnboundedSender<Result<String, TransportError>>;
type StreamRx = mpsc::UnboundedReceiver<Result<String, TransportError>>;

#[derive(Default)]
struct ScriptedTransport {
    streams: Mutex<VecDeque<StreamRx>>,
    opened: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<OutboundMessage>>,
    reject_with: Mutex<Option<SendError>>,
    during_post: Mutex<Option<(StreamTx, Vec<Result<String, TransportError>>)>>,
    post_delay: Mutex<Option<Duration>>,
}

impl ScriptedTransport {
    /// Queue the stream the next `open_stream` call will get; the returned sender feeds it.
    fn next_stream(&self) -> StreamTx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    fn reject_next(&self, err: SendError) {
        *self.reject_with.lock().unwrap() = Some(err);
    }

    /// Deliver `payloads` on `tx` while the next message request is in flight.
    fn stream_during_post(&self, tx: &StreamTx, payloads: Vec<Result<String, TransportError>>) {
        *self.during_post.lock().unwrap() = Some((tx.clone(), payloads));
    }

    fn delay_post(&self, delay: Duration) {
        *self.post_delay.lock().unwrap() = Some(delay);
    }

    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post_message(&self, message: &OutboundMessage) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(message.clone());
        let during = self.during_post.lock().unwrap().take();
        if let Some((tx, payloads)) = during {
            for p in payloads {
                tx.send(p).unwrap();
            }
        }
        let delay = self.post_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.reject_with.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn open_stream(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> Result<PayloadStream, TransportError> {
        self.opened
            .lock()
            .unwrap()
            .push((user_id.to_string(), session_id.to_string()));
        let rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TransportError::Request("no stream scripted".into()))?;
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

struct Harness {
    transport: Arc<ScriptedTransport>,
    controller: SessionController<ScriptedTransport>,
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl Harness {
    fn new() -> Self {
        let transport = Arc::new(ScriptedTransport::default());
        let mut controller =
            SessionController::with_shared_transport(transport.clone(), FragmentParser::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        controller.subscribe(move |n| sink.lock().unwrap().push(n.clone()));
        Self {
            transport,
            controller,
            seen,
        }
    }

    /// Initialize as `user` and process the stream-open acknowledgement.
    async fn connected(user: &str) -> (Self, StreamTx) {
        let mut h = Self::new();
        let tx = h.transport.next_stream();
        h.controller.initialize(user);
        assert_eq!(h.controller.status(), Status::Connecting);
        h.pump().await;
        assert_eq!(h.controller.connection_state(), ConnectionState::Listening);
        assert_eq!(h.controller.status(), Status::Idle);
        (h, tx)
    }

    async fn pump(&mut self) {
        let alive = tokio::time::timeout(
            Duration::from_secs(5),
            self.controller.process_next_event(),
        )
        .await
        .expect("stream event within 5s");
        assert!(alive, "expected a stream event");
    }

    async fn pump_n(&mut self, n: usize) {
        for _ in 0..n {
            self.pump().await;
        }
    }

    fn clear_seen(&self) {
        self.seen.lock().unwrap().clear();
    }

    fn seen(&self) -> Vec<Notification> {
        self.seen.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<Status> {
        self.seen()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Status(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn open_count(&self) -> usize {
        self.controller.messages().iter().filter(|m| m.open).count()
    }
}

fn content(text: &str) -> Result<String, TransportError> {
    Ok(serde_json::json!({ "content": text }).to_string())
}

fn terminal(text: &str) -> Result<String, TransportError> {
    Ok(serde_json::json!({
        "source": "assistant",
        "models_usage": null,
        "metadata": {},
        "content": text,
        "type": "ModelResponse"
    })
    .to_string())
}

#[tokio::test]
async fn send_appends_user_entry_and_awaits_reply() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;

    let outcome = h.controller.send_message("hi").await.unwrap();

    assert_eq!(outcome, SendOutcome::Sent);
    let log = h.controller.messages();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].sender, Sender::User);
    assert_eq!(log[0].content, "hi");
    assert_eq!(h.controller.status(), Status::AwaitingReply);
    assert!(h.controller.show_typing_indicator());

    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content, "hi");
    assert_eq!(sent[0].typ, "TextMessage");
    assert_eq!(sent[0].source, "user");
    assert_eq!(sent[0].user_id, "a@x.com");
    assert_eq!(Some(&sent[0].session_id), h.controller.session_id());
}

#[tokio::test]
async fn fragments_assemble_into_one_reply() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();

    tx.send(content("Hel")).unwrap();
    tx.send(content("lo")).unwrap();
    tx.send(terminal("")).unwrap();
    h.pump().await;
    assert_eq!(h.controller.status(), Status::Streaming);
    assert_eq!(h.open_count(), 1);
    h.pump_n(2).await;

    let log = h.controller.messages();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].sender, Sender::Bot);
    assert_eq!(log[1].content, "Hello");
    assert!(!log[1].open);
    assert_eq!(h.controller.status(), Status::Idle);
    assert_eq!(h.open_count(), 0);
}

#[tokio::test]
async fn stream_error_keeps_partial_reply() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();

    tx.send(content("Par")).unwrap();
    tx.send(Err(TransportError::Request("connection reset".into())))
        .unwrap();
    h.pump_n(2).await;

    let bot = &h.controller.messages()[1];
    assert_eq!(bot.content, "Par");
    assert!(!bot.open);
    assert_eq!(h.controller.status(), Status::Errored);
    assert_eq!(h.controller.connection_state(), ConnectionState::Errored);
    assert!(h
        .seen()
        .iter()
        .any(|n| matches!(n, Notification::StreamError(TransportError::Request(_)))));
    assert_eq!(h.controller.messages().len(), 2, "error is not written to the log");
    assert!(!h.controller.process_next_event().await);
}

#[tokio::test]
async fn rejected_send_appends_error_reply() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;
    h.transport.reject_next(SendError::ServerRejected {
        status: 500,
        detail: "boom".into(),
    });

    let err = h.controller.send_message("hi").await.unwrap_err();

    assert!(matches!(err, SendError::ServerRejected { status: 500, .. }));
    let log = h.controller.messages();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].sender, Sender::User);
    assert_eq!(log[1].sender, Sender::Bot);
    assert!(log[1].content.contains("boom"));
    assert!(!log[1].open);
    assert_ne!(h.controller.status(), Status::AwaitingReply);
    assert_eq!(h.controller.status(), Status::Idle);
}

#[tokio::test]
async fn send_after_stream_failure_stays_errored() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    drop(tx);
    h.pump().await;
    assert_eq!(h.controller.status(), Status::Errored);

    let outcome = h.controller.send_message("still there?").await.unwrap();

    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(h.controller.messages().len(), 1);
    assert_eq!(h.controller.status(), Status::Errored);
    assert!(!h.controller.show_typing_indicator());
    assert!(!h.controller.process_next_event().await);
}

#[tokio::test]
async fn failed_send_after_stream_failure_stays_errored() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    drop(tx);
    h.pump().await;
    h.transport
        .reject_next(SendError::Network("connection refused".into()));

    assert!(h.controller.send_message("hi").await.is_err());
    assert_eq!(h.controller.messages()[1].content, "Error: connection refused");
    assert_eq!(h.controller.status(), Status::Errored);
}

#[tokio::test]
async fn reply_streams_while_request_is_in_flight() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.transport.stream_during_post(
        &tx,
        vec![content("Hel"), content("lo"), terminal("")],
    );
    h.transport.delay_post(Duration::from_millis(200));

    let outcome = h.controller.send_message("hi").await.unwrap();

    assert_eq!(outcome, SendOutcome::Sent);
    let log = h.controller.messages();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].content, "Hello");
    assert!(!log[1].open);
    assert_eq!(h.controller.status(), Status::Idle);
    assert!(h.statuses().contains(&Status::Streaming));
}

#[tokio::test]
async fn request_failure_after_reply_began_keeps_the_reply() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.transport
        .stream_during_post(&tx, vec![content("Hel"), content("lo")]);
    h.transport
        .reject_next(SendError::Network("timed out".into()));

    let outcome = h.controller.send_message("hi").await.unwrap();

    assert_eq!(outcome, SendOutcome::Sent);
    let log: Vec<_> = h
        .controller
        .messages()
        .iter()
        .map(|m| (m.sender, m.content.clone()))
        .collect();
    assert_eq!(
        log,
        vec![
            (Sender::User, "hi".to_string()),
            (Sender::Bot, "Hello".to_string())
        ]
    );
    assert_eq!(h.controller.status(), Status::Streaming);

    tx.send(terminal("")).unwrap();
    h.pump().await;
    assert_eq!(h.controller.status(), Status::Idle);
}

#[tokio::test]
async fn network_failure_appends_error_reply() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;
    h.transport
        .reject_next(SendError::Network("connection refused".into()));

    assert!(h.controller.send_message("hi").await.is_err());
    assert_eq!(
        h.controller.messages()[1].content,
        "Error: connection refused"
    );
}

#[tokio::test]
async fn blank_sends_change_nothing() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;
    h.clear_seen();

    for text in ["", "   ", "\n\t"] {
        assert_eq!(
            h.controller.send_message(text).await.unwrap(),
            SendOutcome::Skipped(ValidationError::EmptyText)
        );
    }

    assert!(h.controller.messages().is_empty());
    assert!(h.seen().is_empty());
    assert_eq!(h.controller.status(), Status::Idle);
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn send_without_identity_is_skipped() {
    let mut h = Harness::new();
    assert_eq!(
        h.controller.send_message("hello").await.unwrap(),
        SendOutcome::Skipped(ValidationError::NoIdentity)
    );
    assert!(h.controller.messages().is_empty());
    assert!(h.seen().is_empty());
}

#[tokio::test]
async fn each_send_adds_one_user_entry_in_order() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;
    let texts = ["one", "two", "three"];
    for t in texts {
        h.controller.send_message(t).await.unwrap();
    }
    let users: Vec<_> = h
        .controller
        .messages()
        .iter()
        .filter(|m| m.sender == Sender::User)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(users, texts);
}

#[tokio::test]
async fn user_entry_precedes_its_reply() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("question").await.unwrap();
    tx.send(terminal("answer")).unwrap();
    h.pump().await;

    let senders: Vec<_> = h.controller.messages().iter().map(|m| m.sender).collect();
    assert_eq!(senders, vec![Sender::User, Sender::Bot]);
    let appended_user_first = h.seen().iter().find_map(|n| match n {
        Notification::Log(LogMutation::Append(m)) => Some(m.sender),
        _ => None,
    });
    assert_eq!(appended_user_first, Some(Sender::User));
}

#[tokio::test]
async fn stop_streaming_hides_progress_but_keeps_merging() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();
    tx.send(content("Hel")).unwrap();
    h.pump().await;
    assert_eq!(h.controller.status(), Status::Streaming);

    h.controller.stop_streaming();
    assert_eq!(h.controller.status(), Status::Idle);
    assert!(!h.controller.show_typing_indicator());

    tx.send(content("lo")).unwrap();
    h.pump().await;
    assert_eq!(h.controller.status(), Status::Idle);
    assert_eq!(h.controller.messages()[1].content, "Hello");
    assert_eq!(h.controller.connection_state(), ConnectionState::Listening);

    tx.send(terminal("")).unwrap();
    h.pump().await;
    assert_eq!(h.open_count(), 0);
    assert_eq!(h.controller.status(), Status::Idle);
}

#[tokio::test]
async fn stop_before_first_fragment_suppresses_streaming_status() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();
    h.controller.stop_streaming();
    h.clear_seen();

    tx.send(content("late")).unwrap();
    h.pump().await;

    assert!(!h.statuses().contains(&Status::Streaming));
    assert_eq!(h.controller.messages()[1].content, "late");
}

#[tokio::test]
async fn malformed_payload_is_dropped_and_stream_continues() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();

    tx.send(content("A")).unwrap();
    tx.send(Ok("{not json".into())).unwrap();
    tx.send(Ok(r#"{"type":"TextMessage"}"#.into())).unwrap();
    tx.send(content("B")).unwrap();
    h.pump_n(4).await;

    assert_eq!(h.controller.messages().len(), 2);
    assert_eq!(h.controller.messages()[1].content, "AB");
    assert_eq!(h.controller.status(), Status::Streaming);
    let dropped = h
        .seen()
        .iter()
        .filter(|n| matches!(n, Notification::FragmentDropped { .. }))
        .count();
    assert_eq!(dropped, 2);
}

#[tokio::test]
async fn thinking_steps_are_not_reply_text() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();

    tx.send(Ok(r#"{"content":"early plan","type":"thinking_step"}"#.into()))
        .unwrap();
    tx.send(content("Answer")).unwrap();
    tx.send(Ok(r#"{"content":"checking sources","type":"thinking_step"}"#.into()))
        .unwrap();
    h.pump_n(3).await;

    let bot = &h.controller.messages()[1];
    assert_eq!(bot.content, "Answer");
    assert_eq!(bot.thinking.as_deref(), Some("checking sources"));
    assert_eq!(h.controller.latest_thinking(), Some("checking sources"));

    h.controller.send_message("and then?").await.unwrap();
    assert_eq!(h.controller.latest_thinking(), Some("checking sources"));
    tx.send(content("Plain reply")).unwrap();
    h.pump().await;
    assert_eq!(h.controller.latest_thinking(), None);
}

#[tokio::test]
async fn server_closing_stream_is_an_implicit_terminal() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();
    tx.send(content("partial")).unwrap();
    drop(tx);
    h.pump_n(2).await;

    assert_eq!(h.open_count(), 0);
    assert_eq!(h.controller.messages()[1].content, "partial");
    assert_eq!(h.controller.status(), Status::Errored);
    assert!(h
        .seen()
        .contains(&Notification::StreamError(TransportError::Closed)));
}

#[tokio::test]
async fn new_turn_closes_unfinished_reply() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("first").await.unwrap();
    tx.send(content("never finished")).unwrap();
    h.pump().await;
    assert_eq!(h.open_count(), 1);

    h.controller.send_message("second").await.unwrap();
    assert_eq!(h.open_count(), 0);

    tx.send(content("fresh")).unwrap();
    h.pump().await;
    let log = h.controller.messages();
    assert_eq!(log.len(), 4);
    assert_eq!(log[1].content, "never finished");
    assert_eq!(log[3].content, "fresh");
    assert_eq!(h.open_count(), 1);
}

#[tokio::test]
async fn teardown_releases_session_but_keeps_log() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("hi").await.unwrap();
    tx.send(content("Par")).unwrap();
    h.pump().await;

    h.controller.teardown();

    let log = h.controller.messages();
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].content, "Par");
    assert!(!log[1].open);
    assert!(h.controller.user_id().is_none());
    assert!(h.controller.session_id().is_none());
    assert_eq!(h.controller.status(), Status::Idle);
    assert_eq!(
        h.controller.connection_state(),
        ConnectionState::Unconnected
    );
    assert!(!h.controller.process_next_event().await);
    assert_eq!(
        h.controller.send_message("anyone?").await.unwrap(),
        SendOutcome::Skipped(ValidationError::NoIdentity)
    );
}

#[tokio::test]
async fn switching_user_keeps_earlier_messages() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;
    h.controller.send_message("from a").await.unwrap();

    let _next = h.transport.next_stream();
    h.controller.initialize("b@x.com");
    h.pump().await;
    h.controller.send_message("from b").await.unwrap();

    let contents: Vec<_> = h
        .controller
        .messages()
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(contents, vec!["from a", "from b"]);
    assert_eq!(h.transport.sent()[1].user_id, "b@x.com");
}

#[tokio::test]
async fn initialize_rules() {
    let mut h = Harness::new();
    h.controller.initialize("  ");
    assert!(h.controller.user_id().is_none());
    assert_eq!(
        h.controller.connection_state(),
        ConnectionState::Unconnected
    );

    let _first = h.transport.next_stream();
    h.controller.initialize("a@x.com");
    let session = h.controller.session_id().cloned().unwrap();

    h.controller.initialize("a@x.com");
    assert_eq!(h.controller.session_id(), Some(&session));

    let _second = h.transport.next_stream();
    h.controller.initialize("b@x.com");
    assert_eq!(h.controller.user_id().map(String::as_str), Some("b@x.com"));
    assert_ne!(h.controller.session_id(), Some(&session));
    assert_eq!(h.controller.status(), Status::Connecting);
}

#[tokio::test]
async fn reset_reconnects_with_new_session() {
    let (mut h, tx) = Harness::connected("a@x.com").await;
    drop(tx);
    h.pump().await;
    assert_eq!(h.controller.status(), Status::Errored);
    let old_session = h.controller.session_id().cloned().unwrap();

    let _tx = h.transport.next_stream();
    h.controller.reset();
    assert_eq!(h.controller.status(), Status::Connecting);
    h.pump().await;

    assert_eq!(h.controller.status(), Status::Idle);
    assert_eq!(h.controller.user_id().map(String::as_str), Some("a@x.com"));
    assert_ne!(h.controller.session_id(), Some(&old_session));
    let opened = h.transport.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[1].1, *h.controller.session_id().unwrap());
}

#[tokio::test]
async fn unsubscribed_listener_is_not_called() {
    let (mut h, _tx) = Harness::connected("a@x.com").await;
    let count = Arc::new(Mutex::new(0usize));
    let c = count.clone();
    let id = h.controller.subscribe(move |_| *c.lock().unwrap() += 1);

    h.controller.send_message("one").await.unwrap();
    let after_first = *count.lock().unwrap();
    assert!(after_first >= 2, "append and status change are both reported");

    assert!(h.controller.unsubscribe(id));
    assert!(!h.controller.unsubscribe(id));
    h.controller.send_message("two").await.unwrap();
    assert_eq!(*count.lock().unwrap(), after_first);
}
