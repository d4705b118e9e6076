#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Quizcast integration tests.
//!
//! Provides an in-process [`MockServer`] that answers the realtime wire
//! protocol over loopback channels, a scripted [`MockBackend`] and a
//! [`RecordingSink`] for game events.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use quizcast_client::backend::TallyQuestion;
use quizcast_client::protocol::{ClientFrame, PresenceAction, PresenceMember, ServerFrame};
use quizcast_client::{
    Connector, ErrorCode, EventSink, HostEvent, NextQuestion, Question, QuizBackend,
    QuizEndResult, QuizcastError, SessionStart, TallyEntry, TallyResult, Transport,
};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds, panicking after two seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut`, panicking if it takes longer than two seconds.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("future timed out")
}

// ── Loopback transport ──────────────────────────────────────────────

struct LoopbackTransport {
    to_server: mpsc::UnboundedSender<String>,
    from_server: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), QuizcastError> {
        self.to_server
            .send(message)
            .map_err(|_| QuizcastError::TransportClosed)
    }

    async fn recv(&mut self) -> Option<Result<String, QuizcastError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), QuizcastError> {
        Ok(())
    }
}

// ── MockServer ──────────────────────────────────────────────────────

struct Link {
    to_client: mpsc::UnboundedSender<String>,
    kill: oneshot::Sender<()>,
}

#[derive(Default)]
struct ServerState {
    frames: StdMutex<Vec<ClientFrame>>,
    links: StdMutex<Vec<Link>>,
    rejected_tokens: StdMutex<HashSet<String>>,
    members: StdMutex<HashMap<String, Vec<PresenceMember>>>,
    ack_delay: StdMutex<Option<Duration>>,
    withhold_acks: AtomicBool,
    refuse_connects: AtomicBool,
    connects: AtomicUsize,
}

fn encode(frame: &ServerFrame) -> String {
    serde_json::to_string(frame).expect("encode server frame")
}

/// An in-process realtime service.
///
/// Answers `Authenticate` with `Connected` (or a `TOKEN_INVALID` error for
/// rejected tokens), `Attach` with `Attached` plus a presence sync, publishes
/// with `Ack`, presence frames with presence events, and `Ping` with `Pong`.
/// Every client frame is recorded.
#[derive(Clone, Default)]
pub struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            state: Arc::clone(&self.state),
        }
    }

    pub fn reject_token(&self, token: &str) {
        self.state
            .rejected_tokens
            .lock()
            .unwrap()
            .insert(token.to_owned());
    }

    /// Make the connector itself fail, as if the host were unreachable.
    pub fn refuse_connects(&self, refuse: bool) {
        self.state.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        *self.state.ack_delay.lock().unwrap() = delay;
    }

    pub fn withhold_acks(&self, withhold: bool) {
        self.state.withhold_acks.store(withhold, Ordering::SeqCst);
    }

    /// Number of successful transport connects.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<ClientFrame> {
        self.state.frames.lock().unwrap().clone()
    }

    pub fn attach_count(&self, channel: &str) -> usize {
        self.frames()
            .iter()
            .filter(|f| matches!(f, ClientFrame::Attach { channel: c } if c == channel))
            .count()
    }

    pub fn detach_count(&self, channel: &str) -> usize {
        self.frames()
            .iter()
            .filter(|f| matches!(f, ClientFrame::Detach { channel: c } if c == channel))
            .count()
    }

    /// `(name, data)` of every publish on `channel`, in arrival order.
    pub fn published(&self, channel: &str) -> Vec<(String, serde_json::Value)> {
        self.frames()
            .into_iter()
            .filter_map(|f| match f {
                ClientFrame::Publish {
                    channel: c,
                    name,
                    data,
                    ..
                } if c == channel => Some((name, data)),
                _ => None,
            })
            .collect()
    }

    /// Push a message to every live connection, attached or not.
    pub fn deliver(&self, channel: &str, name: Option<&str>, data: serde_json::Value) {
        self.broadcast(&ServerFrame::Message {
            channel: channel.to_owned(),
            name: name.map(str::to_owned),
            data,
            timestamp: Some(1_700_000_000_000),
        });
    }

    /// Push a presence change to every live connection.
    pub fn presence(&self, channel: &str, action: PresenceAction, client_id: &str) {
        self.broadcast(&ServerFrame::Presence {
            channel: channel.to_owned(),
            action,
            client_id: client_id.to_owned(),
            data: None,
            timestamp: None,
        });
    }

    pub fn send_raw(&self, frame: &ServerFrame) {
        self.broadcast(frame);
    }

    /// Drop every live connection from the service side.
    pub fn sever(&self) {
        for link in self.state.links.lock().unwrap().drain(..) {
            let _ = link.kill.send(());
        }
    }

    fn broadcast(&self, frame: &ServerFrame) {
        let text = encode(frame);
        for link in self.state.links.lock().unwrap().iter() {
            let _ = link.to_client.send(text.clone());
        }
    }
}

/// Connector handing out loopback transports served by a [`MockServer`].
pub struct MockConnector {
    state: Arc<ServerState>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _token: &str) -> Result<Box<dyn Transport>, QuizcastError> {
        if self.state.refuse_connects.load(Ordering::SeqCst) {
            return Err(QuizcastError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel();
        self.state.links.lock().unwrap().push(Link {
            to_client: to_client.clone(),
            kill,
        });
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(serve(
            Arc::clone(&self.state),
            from_client,
            to_client,
            kill_rx,
        ));
        Ok(Box::new(LoopbackTransport {
            to_server,
            from_server,
        }))
    }
}

async fn serve(
    state: Arc<ServerState>,
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
    mut kill: oneshot::Receiver<()>,
) {
    let mut client_id = String::new();
    loop {
        let text = tokio::select! {
            _ = &mut kill => break,
            text = from_client.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        let frame: ClientFrame = serde_json::from_str(&text).expect("client frame");
        state.frames.lock().unwrap().push(frame.clone());

        let reply = |frame: ServerFrame| {
            let _ = to_client.send(encode(&frame));
        };
        match frame {
            ClientFrame::Authenticate {
                token,
                client_id: id,
                ..
            } => {
                if state.rejected_tokens.lock().unwrap().contains(&token) {
                    reply(ServerFrame::Error {
                        message: "token rejected".into(),
                        error_code: Some(ErrorCode::TokenInvalid),
                        channel: None,
                    });
                } else {
                    client_id = id;
                    reply(ServerFrame::Connected {
                        connection_id: uuid::Uuid::new_v4().to_string(),
                    });
                }
            }
            ClientFrame::Attach { channel } => {
                let members = state
                    .members
                    .lock()
                    .unwrap()
                    .get(&channel)
                    .cloned()
                    .unwrap_or_default();
                reply(ServerFrame::Attached {
                    channel: channel.clone(),
                });
                reply(ServerFrame::PresenceSync { channel, members });
            }
            ClientFrame::Detach { channel } => reply(ServerFrame::Detached {
                channel,
                reason: None,
            }),
            ClientFrame::Publish { msg_serial, .. } => {
                if state.withhold_acks.load(Ordering::SeqCst) {
                    continue;
                }
                let ack = encode(&ServerFrame::Ack { msg_serial });
                let delay = *state.ack_delay.lock().unwrap();
                match delay {
                    Some(delay) => {
                        let tx = to_client.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(ack);
                        });
                    }
                    None => {
                        let _ = to_client.send(ack);
                    }
                }
            }
            ClientFrame::PresenceEnter { channel, data } => {
                let member = PresenceMember {
                    client_id: client_id.clone(),
                    data: data.clone(),
                };
                {
                    let mut members = state.members.lock().unwrap();
                    let set = members.entry(channel.clone()).or_default();
                    set.retain(|m| m.client_id != client_id);
                    set.push(member);
                }
                reply(ServerFrame::Presence {
                    channel,
                    action: PresenceAction::Enter,
                    client_id: client_id.clone(),
                    data,
                    timestamp: None,
                });
            }
            ClientFrame::PresenceLeave { channel } => {
                if let Some(set) = state.members.lock().unwrap().get_mut(&channel) {
                    set.retain(|m| m.client_id != client_id);
                }
                reply(ServerFrame::Presence {
                    channel,
                    action: PresenceAction::Leave,
                    client_id: client_id.clone(),
                    data: None,
                    timestamp: None,
                });
            }
            ClientFrame::Ping => reply(ServerFrame::Pong),
        }
    }
}

// ── MockBackend ─────────────────────────────────────────────────────

/// Scripted quiz backend recording every call as `"<action>:<key>"`.
#[derive(Default)]
pub struct MockBackend {
    calls: StdMutex<Vec<String>>,
    next_question: AtomicI64,
    pub fail_start_time: AtomicBool,
    pub fail_tally: AtomicBool,
    pub fail_end_quiz: AtomicBool,
    pub omit_token: AtomicBool,
    advance_delay: StdMutex<Option<Duration>>,
    start_time_delay: StdMutex<Option<Duration>>,
    elapse_delay: StdMutex<Option<Duration>>,
    tally_delay: StdMutex<Option<Duration>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_advance_delay(&self, delay: Duration) {
        *self.advance_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_start_time_delay(&self, delay: Duration) {
        *self.start_time_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_elapse_delay(&self, delay: Duration) {
        *self.elapse_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_tally_delay(&self, delay: Duration) {
        *self.tally_delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose action equals `action`.
    pub fn count(&self, action: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.split(':').next() == Some(action))
            .count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    async fn pause(delay: &StdMutex<Option<Duration>>) {
        let delay = *delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

pub fn tally_for(question_id: i64) -> TallyResult {
    TallyResult {
        question: TallyQuestion {
            question_id: Some(question_id),
            correct_option: Some("b".into()),
        },
        results: vec![
            TallyEntry {
                user_id: 1,
                user_name: Some("Ada".into()),
                answered_in: Some(2.5),
                is_correct: true,
                is_winner: true,
                answer: Some("B".into()),
                ..TallyEntry::default()
            },
            TallyEntry {
                user_id: 2,
                user_name: Some("Bo".into()),
                answered_in: Some(1.0),
                is_correct: false,
                answer: Some("C".into()),
                ..TallyEntry::default()
            },
        ],
    }
}

#[async_trait]
impl QuizBackend for MockBackend {
    async fn start_session(&self, session_id: &str) -> quizcast_client::Result<SessionStart> {
        self.record(format!("start_session:{session_id}"));
        Ok(SessionStart {
            session_id: Some(session_id.to_owned()),
            token: (!self.omit_token.load(Ordering::SeqCst)).then(|| "host-token".to_owned()),
        })
    }

    async fn start_quiz(&self, session_id: &str) -> quizcast_client::Result<()> {
        self.record(format!("start_quiz:{session_id}"));
        Ok(())
    }

    async fn advance_question(&self, session_id: &str) -> quizcast_client::Result<NextQuestion> {
        self.record(format!("advance:{session_id}"));
        Self::pause(&self.advance_delay).await;
        let index = self.next_question.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(NextQuestion {
            question: Question {
                question_id: 100 + index,
                question: format!("Question {index}?"),
                option_a: "A".into(),
                option_b: "B".into(),
                option_c: "C".into(),
                option_d: "D".into(),
                correct_option: Some("B".into()),
                category: None,
            },
            question_index: u32::try_from(index).unwrap(),
        })
    }

    async fn start_question_time(&self, question_id: i64) -> quizcast_client::Result<()> {
        self.record(format!("start_time:{question_id}"));
        Self::pause(&self.start_time_delay).await;
        if self.fail_start_time.load(Ordering::SeqCst) {
            return Err(QuizcastError::Backend {
                status: Some(500),
                message: "start time failed".into(),
            });
        }
        Ok(())
    }

    async fn elapse_question_time(&self, question_id: i64) -> quizcast_client::Result<()> {
        self.record(format!("elapse:{question_id}"));
        Self::pause(&self.elapse_delay).await;
        Ok(())
    }

    async fn question_tally(&self, question_id: i64) -> quizcast_client::Result<TallyResult> {
        self.record(format!("tally:{question_id}"));
        Self::pause(&self.tally_delay).await;
        if self.fail_tally.load(Ordering::SeqCst) {
            return Err(QuizcastError::backend("tally unavailable"));
        }
        Ok(tally_for(question_id))
    }

    async fn end_quiz(&self, session_id: &str) -> quizcast_client::Result<Vec<QuizEndResult>> {
        self.record(format!("end_quiz:{session_id}"));
        if self.fail_end_quiz.load(Ordering::SeqCst) {
            return Err(QuizcastError::backend("end quiz failed"));
        }
        Ok(vec![QuizEndResult::default()])
    }
}

// ── RecordingSink ───────────────────────────────────────────────────

/// Records published host events in completion order, after an optional
/// random delay per publish.
#[derive(Default)]
pub struct RecordingSink {
    events: StdMutex<Vec<(String, HostEvent)>>,
    max_latency_ms: u64,
    fixed_latency: Option<Duration>,
    pub fail: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(max_latency_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            max_latency_ms,
            ..Self::default()
        })
    }

    /// Every publish takes exactly `delay`.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            fixed_latency: Some(delay),
            ..Self::default()
        })
    }

    pub fn events(&self) -> Vec<(String, HostEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(|(_, e)| e.name()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish_event(&self, topic: &str, event: &HostEvent) -> quizcast_client::Result<()> {
        if self.max_latency_ms > 0 {
            let delay = rand::rng().random_range(0..=self.max_latency_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(delay) = self.fixed_latency {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(QuizcastError::NotConnected);
        }
        self.events
            .lock()
            .unwrap()
            .push((topic.to_owned(), event.clone()));
        Ok(())
    }
}
