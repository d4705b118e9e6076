//! Connection to the realtime service.
//!
//! [`Connection`] owns at most one live transport at a time. Each
//! [`connect`](Connection::connect) tears down the previous transport (and its
//! channel handles) before dialing a new one, then spawns a background
//! transport loop that multiplexes outgoing commands, a shutdown signal and
//! incoming frames with `tokio::select!`.
//!
//! Inbound traffic and state changes are forwarded as [`ConnectionEvent`]s on
//! the bounded channel returned from [`Connection::new`]. The current
//! [`ConnectionState`] is also observable through a `watch` channel.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::{QuizcastError, Result};
use crate::protocol::{ClientFrame, PresenceAction, PresenceMember, ServerFrame};
use crate::realtime::RealtimeConfig;
use crate::transport::{Connector, Transport};

// ── States ──────────────────────────────────────────────────────────

/// Lifecycle state of the realtime connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// The service refused the credentials; only an explicit reconnect retries.
    Failed,
}

/// Attachment state of one channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Attaching,
    Attached,
    Detached,
}

/// Cached per-topic channel handle.
#[derive(Debug)]
pub struct ChannelHandle {
    topic: String,
    state: Mutex<ChannelState>,
}

impl ChannelHandle {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_owned(),
            state: Mutex::new(ChannelState::Initialized),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }
}

// ── Events ──────────────────────────────────────────────────────────

/// Everything the transport loop reports to the layer above.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        state: ConnectionState,
        reason: Option<String>,
    },
    Message {
        topic: String,
        name: Option<String>,
        data: serde_json::Value,
        timestamp: Option<i64>,
    },
    Presence {
        topic: String,
        action: PresenceAction,
        member: PresenceMember,
        timestamp: Option<i64>,
    },
    PresenceSync {
        topic: String,
        members: Vec<PresenceMember>,
    },
}

// ── Shared state ────────────────────────────────────────────────────

/// Commands from the handle to the transport loop.
enum Command {
    Frame(ClientFrame),
    Publish {
        channel: String,
        name: String,
        data: serde_json::Value,
        ack: oneshot::Sender<Result<()>>,
    },
}

struct Shared {
    state_tx: watch::Sender<ConnectionState>,
    /// Bumped on every connect/disconnect; loops from older generations may
    /// not change the state.
    generation: AtomicU64,
    channels: Mutex<HashMap<String, Arc<ChannelHandle>>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Apply `state` if `generation` is still current. Returns whether the
    /// state actually changed.
    fn transition(&self, generation: u64, state: ConnectionState) -> bool {
        let changed = self.state_tx.send_if_modified(|current| {
            if self.generation.load(Ordering::Acquire) != generation || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed && matches!(state, ConnectionState::Disconnected | ConnectionState::Failed) {
            self.release_channels();
        }
        changed
    }

    fn release_channels(&self) {
        let mut channels = lock(&self.channels);
        for handle in channels.values() {
            handle.set_state(ChannelState::Detached);
        }
        channels.clear();
    }

    fn channel(&self, topic: &str) -> Option<Arc<ChannelHandle>> {
        lock(&self.channels).get(topic).cloned()
    }
}

struct Session {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: tokio::task::JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Connection handle ───────────────────────────────────────────────

/// The single realtime connection of the process.
pub struct Connection {
    connector: Arc<dyn Connector>,
    client_id: String,
    sdk_version: Option<String>,
    shutdown_timeout: Duration,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    session: Mutex<Option<Session>>,
    /// Serializes connect/disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Connection {
    /// Create a disconnected connection and the receiver for its events.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn new(
        connector: Arc<dyn Connector>,
        config: &RealtimeConfig,
    ) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let connection = Self {
            connector,
            client_id: config.client_id.clone(),
            sdk_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            shutdown_timeout: config.shutdown_timeout,
            shared: Arc::new(Shared {
                state_tx,
                generation: AtomicU64::new(0),
                channels: Mutex::new(HashMap::new()),
            }),
            event_tx,
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        };
        (connection, event_rx)
    }

    /// Open a new connection with `token`, replacing any existing one.
    ///
    /// Returns once the transport is open and the `Authenticate` frame is
    /// queued; the state becomes [`Connected`](ConnectionState::Connected)
    /// when the service accepts the token. Use
    /// [`wait_for_state`](Self::wait_for_state) to await that.
    ///
    /// # Errors
    ///
    /// - [`QuizcastError::Auth`] if `token` is empty. The current connection
    ///   is left untouched.
    /// - Any error from the [`Connector`]; the state becomes `Failed`.
    pub async fn connect(&self, token: &str) -> Result<()> {
        if token.trim().is_empty() {
            return Err(QuizcastError::Auth("realtime token is empty".into()));
        }

        let _guard = self.lifecycle.lock().await;
        let generation = self.teardown().await;

        self.set_state(generation, ConnectionState::Connecting, None)
            .await;

        let transport = match self.connector.connect(token).await {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, "realtime connect failed");
                self.set_state(generation, ConnectionState::Failed, Some(e.to_string()))
                    .await;
                return Err(e);
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // The loop picks this up as the very first outgoing frame.
        let _ = cmd_tx.send(Command::Frame(ClientFrame::Authenticate {
            token: token.to_owned(),
            client_id: self.client_id.clone(),
            sdk_version: self.sdk_version.clone(),
        }));

        let task = tokio::spawn(transport_loop(
            transport,
            cmd_rx,
            self.event_tx.clone(),
            Arc::clone(&self.shared),
            generation,
            shutdown_rx,
        ));

        *lock(&self.session) = Some(Session {
            cmd_tx,
            task,
            shutdown_tx: Some(shutdown_tx),
        });
        Ok(())
    }

    /// Close the connection and release every channel handle.
    ///
    /// Idempotent: calling it while already disconnected does nothing.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// Stop the current transport loop (if any) and move to `Disconnected`.
    /// Returns the new generation.
    async fn teardown(&self) -> u64 {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let session = lock(&self.session).take();
        if let Some(mut session) = session {
            debug!("closing realtime transport");
            if let Some(tx) = session.shutdown_tx.take() {
                let _ = tx.send(());
            }
            match tokio::time::timeout(self.shutdown_timeout, &mut session.task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("transport loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("transport loop did not exit within timeout; aborting task");
                    session.task.abort();
                    if let Err(join_err) = session.task.await {
                        debug!("transport loop aborted: {join_err}");
                    }
                }
            }
        }

        self.shared.release_channels();
        self.set_state(generation, ConnectionState::Disconnected, None)
            .await;
        generation
    }

    async fn set_state(&self, generation: u64, state: ConnectionState, reason: Option<String>) {
        if self.shared.transition(generation, state) {
            info!(?state, "realtime connection state changed");
            emit(&self.event_tx, ConnectionEvent::StateChanged { state, reason }).await;
        }
    }

    // ── State accessors ─────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Identity used for presence on this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Wait until the connection reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::Timeout`] if `target` is not reached in time.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> Result<()> {
        let mut rx = self.state_receiver();
        let result = match tokio::time::timeout(timeout, rx.wait_for(|state| *state == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(QuizcastError::NotConnected),
            Err(_) => Err(QuizcastError::Timeout),
        };
        result
    }

    // ── Channels ────────────────────────────────────────────────────

    /// Return the cached handle for `topic`, creating it on first use.
    pub fn get_or_create_channel(&self, topic: &str) -> Arc<ChannelHandle> {
        let mut channels = lock(&self.shared.channels);
        Arc::clone(
            channels
                .entry(topic.to_owned())
                .or_insert_with(|| Arc::new(ChannelHandle::new(topic))),
        )
    }

    /// Topics that currently have a cached channel handle.
    pub fn channel_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.shared.channels).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Attach `topic` so the service starts delivering its messages.
    ///
    /// Attaching an already attaching/attached channel sends nothing.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::NotConnected`] unless the connection is
    /// `Connected`.
    pub fn attach(&self, topic: &str) -> Result<Arc<ChannelHandle>> {
        if !self.is_connected() {
            return Err(QuizcastError::NotConnected);
        }
        let handle = self.get_or_create_channel(topic);
        if matches!(
            handle.state(),
            ChannelState::Attaching | ChannelState::Attached
        ) {
            return Ok(handle);
        }
        self.send_command(Command::Frame(ClientFrame::Attach {
            channel: topic.to_owned(),
        }))?;
        handle.set_state(ChannelState::Attaching);
        debug!(topic = %topic, "attaching channel");
        Ok(handle)
    }

    /// Detach `topic` and discard its handle.
    ///
    /// While disconnected there is no wire subscription to release, so only
    /// the handle is dropped.
    pub fn detach(&self, topic: &str) {
        let removed = lock(&self.shared.channels).remove(topic);
        if let Some(handle) = removed {
            handle.set_state(ChannelState::Detached);
        }
        if self.is_connected() {
            let _ = self.send_command(Command::Frame(ClientFrame::Detach {
                channel: topic.to_owned(),
            }));
            debug!(topic = %topic, "detaching channel");
        }
    }

    // ── Publish ─────────────────────────────────────────────────────

    /// Publish `data` on `topic` under the event `name`, resolving when the
    /// service acknowledges it.
    ///
    /// This does not time out by itself; wrap it in
    /// [`with_timeout`](crate::timer::with_timeout) when the network may stall.
    ///
    /// # Errors
    ///
    /// - [`QuizcastError::InvalidTopic`] for an empty topic.
    /// - [`QuizcastError::NotConnected`] when not connected, or when the
    ///   connection drops before the acknowledgement arrives.
    /// - [`QuizcastError::Channel`] when the service rejects the message.
    pub async fn publish(&self, topic: &str, name: &str, data: serde_json::Value) -> Result<()> {
        if topic.is_empty() {
            return Err(QuizcastError::InvalidTopic(topic.to_owned()));
        }
        if !self.is_connected() {
            return Err(QuizcastError::NotConnected);
        }
        let _ = self.get_or_create_channel(topic);

        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(Command::Publish {
            channel: topic.to_owned(),
            name: name.to_owned(),
            data,
            ack: ack_tx,
        })?;
        ack_rx.await.map_err(|_| QuizcastError::NotConnected)?
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Enter the presence set of an attached channel.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::NotReady`] while connecting or before `topic` is
    /// attached, [`QuizcastError::NotConnected`] otherwise.
    pub fn enter_presence(&self, topic: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.ensure_presence_ready(topic)?;
        self.send_command(Command::Frame(ClientFrame::PresenceEnter {
            channel: topic.to_owned(),
            data,
        }))
    }

    /// Leave the presence set of an attached channel.
    ///
    /// # Errors
    ///
    /// Same as [`enter_presence`](Self::enter_presence).
    pub fn leave_presence(&self, topic: &str) -> Result<()> {
        self.ensure_presence_ready(topic)?;
        self.send_command(Command::Frame(ClientFrame::PresenceLeave {
            channel: topic.to_owned(),
        }))
    }

    fn ensure_presence_ready(&self, topic: &str) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Connecting => return Err(QuizcastError::NotReady(topic.to_owned())),
            ConnectionState::Disconnected | ConnectionState::Failed => {
                return Err(QuizcastError::NotConnected)
            }
        }
        match self.shared.channel(topic) {
            Some(handle) if handle.state() == ChannelState::Attached => Ok(()),
            _ => Err(QuizcastError::NotReady(topic.to_owned())),
        }
    }

    /// Send a heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::NotConnected`] when not connected.
    pub fn ping(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(QuizcastError::NotConnected);
        }
        self.send_command(Command::Frame(ClientFrame::Ping))
    }

    fn send_command(&self, cmd: Command) -> Result<()> {
        let session = lock(&self.session);
        let session = session.as_ref().ok_or(QuizcastError::NotConnected)?;
        session
            .cmd_tx
            .send(cmd)
            .map_err(|_| QuizcastError::NotConnected)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .field("channels", &self.channel_topics())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // No executor context to run a graceful close here.
        if let Some(session) = lock(&self.session).take() {
            session.task.abort();
        }
    }
}

// ── Transport loop ──────────────────────────────────────────────────

/// Background loop for one transport.
///
/// Exits when:
/// - the shutdown signal fires or the command channel closes
/// - the transport returns `None` or an error
/// - the service sends `Disconnected` or an authentication error
///
/// Outstanding publishes are dropped on exit, which fails their futures
/// with [`QuizcastError::NotConnected`].
async fn transport_loop(
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    shared: Arc<Shared>,
    generation: u64,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!(generation, "transport loop started");

    let mut pending: HashMap<u64, oneshot::Sender<Result<()>>> = HashMap::new();
    let mut next_serial: u64 = 0;

    let exit: Option<(ConnectionState, Option<String>)> = loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("command channel closed, shutting down transport loop");
                    let _ = transport.close().await;
                    break None;
                };
                let frame = match cmd {
                    Command::Frame(frame) => frame,
                    Command::Publish { channel, name, data, ack } => {
                        next_serial += 1;
                        pending.insert(next_serial, ack);
                        ClientFrame::Publish { channel, msg_serial: next_serial, name, data }
                    }
                };
                match serde_json::to_string(&frame) {
                    Ok(json) => {
                        if let Err(e) = transport.send(json).await {
                            error!("transport send error: {e}");
                            break Some((
                                ConnectionState::Disconnected,
                                Some(format!("transport send error: {e}")),
                            ));
                        }
                    }
                    Err(e) => {
                        error!("failed to serialize ClientFrame: {e}");
                        if let ClientFrame::Publish { msg_serial, .. } = frame {
                            if let Some(ack) = pending.remove(&msg_serial) {
                                let _ = ack.send(Err(QuizcastError::Serialization(e)));
                            }
                        }
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                let _ = transport.close().await;
                break None;
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            if let ControlFlow::Break(exit) =
                                handle_server_frame(frame, &shared, generation, &event_tx, &mut pending).await
                            {
                                let _ = transport.close().await;
                                break Some(exit);
                            }
                        }
                        Err(e) => {
                            warn!("failed to deserialize server frame: {e}; raw: {text}");
                        }
                    },
                    Some(Err(e)) => {
                        error!("transport receive error: {e}");
                        break Some((
                            ConnectionState::Disconnected,
                            Some(format!("transport receive error: {e}")),
                        ));
                    }
                    None => {
                        debug!("transport closed by service");
                        break Some((ConnectionState::Disconnected, None));
                    }
                }
            }
        }
    };

    drop(pending);
    if let Some((state, reason)) = exit {
        if shared.transition(generation, state) {
            info!(?state, reason = ?reason, "realtime connection state changed");
            emit(&event_tx, ConnectionEvent::StateChanged { state, reason }).await;
        }
    }
    debug!(generation, "transport loop exited");
}

async fn handle_server_frame(
    frame: ServerFrame,
    shared: &Shared,
    generation: u64,
    event_tx: &mpsc::Sender<ConnectionEvent>,
    pending: &mut HashMap<u64, oneshot::Sender<Result<()>>>,
) -> ControlFlow<(ConnectionState, Option<String>)> {
    match frame {
        ServerFrame::Connected { connection_id } => {
            if shared.transition(generation, ConnectionState::Connected) {
                info!(connection_id = %connection_id, "realtime connection established");
                emit(
                    event_tx,
                    ConnectionEvent::StateChanged {
                        state: ConnectionState::Connected,
                        reason: None,
                    },
                )
                .await;
            }
        }
        ServerFrame::Attached { channel } => {
            if let Some(handle) = shared.channel(&channel) {
                handle.set_state(ChannelState::Attached);
            }
            debug!(topic = %channel, "channel attached");
        }
        ServerFrame::Detached { channel, reason } => {
            if let Some(handle) = shared.channel(&channel) {
                handle.set_state(ChannelState::Detached);
            }
            debug!(topic = %channel, reason = ?reason, "channel detached");
        }
        ServerFrame::Message {
            channel,
            name,
            data,
            timestamp,
        } => {
            emit(
                event_tx,
                ConnectionEvent::Message {
                    topic: channel,
                    name,
                    data,
                    timestamp,
                },
            )
            .await;
        }
        ServerFrame::Presence {
            channel,
            action,
            client_id,
            data,
            timestamp,
        } => {
            emit(
                event_tx,
                ConnectionEvent::Presence {
                    topic: channel,
                    action,
                    member: PresenceMember { client_id, data },
                    timestamp,
                },
            )
            .await;
        }
        ServerFrame::PresenceSync { channel, members } => {
            emit(
                event_tx,
                ConnectionEvent::PresenceSync {
                    topic: channel,
                    members,
                },
            )
            .await;
        }
        ServerFrame::Ack { msg_serial } => {
            if let Some(ack) = pending.remove(&msg_serial) {
                let _ = ack.send(Ok(()));
            }
        }
        ServerFrame::Nack {
            msg_serial,
            message,
            error_code,
        } => {
            warn!(msg_serial, message = %message, "publish rejected");
            if let Some(ack) = pending.remove(&msg_serial) {
                let _ = ack.send(Err(QuizcastError::Channel {
                    message,
                    error_code,
                }));
            }
        }
        ServerFrame::Pong => debug!("pong"),
        ServerFrame::Error {
            message,
            error_code,
            channel,
        } => {
            if error_code.is_some_and(|code| code.is_auth_failure()) {
                error!(message = %message, ?error_code, "realtime authentication failed");
                return ControlFlow::Break((ConnectionState::Failed, Some(message)));
            }
            match channel {
                Some(topic) => {
                    warn!(topic = %topic, message = %message, ?error_code, "channel error");
                    if let Some(handle) = shared.channel(&topic) {
                        handle.set_state(ChannelState::Detached);
                    }
                }
                None => warn!(message = %message, ?error_code, "realtime service error"),
            }
        }
        ServerFrame::Disconnected { reason } => {
            info!(reason = ?reason, "service closed the connection");
            return ControlFlow::Break((ConnectionState::Disconnected, reason));
        }
    }
    ControlFlow::Continue(())
}

/// Deliver an event, waiting for capacity so that ordering is preserved.
async fn emit(event_tx: &mpsc::Sender<ConnectionEvent>, event: ConnectionEvent) {
    if event_tx.send(event).await.is_err() {
        debug!("event channel closed, receiver dropped");
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Transport backed by channels so tests can play the service.
    struct ChannelTransport {
        to_service: mpsc::UnboundedSender<String>,
        from_service: mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn send(&mut self, message: String) -> Result<()> {
            self.to_service
                .send(message)
                .map_err(|_| QuizcastError::TransportClosed)
        }

        async fn recv(&mut self) -> Option<Result<String>> {
            self.from_service.recv().await.map(Ok)
        }

        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Hands out one scripted transport per connect.
    struct ScriptedConnector {
        ends: StdMutex<Vec<ChannelTransport>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _token: &str) -> Result<Box<dyn Transport>> {
            match self.ends.lock().unwrap().pop() {
                Some(t) => Ok(Box::new(t)),
                None => Err(QuizcastError::Io(std::io::Error::other("no transport"))),
            }
        }
    }

    struct ServiceEnd {
        from_client: mpsc::UnboundedReceiver<String>,
        to_client: mpsc::UnboundedSender<String>,
    }

    impl ServiceEnd {
        async fn next_frame(&mut self) -> ClientFrame {
            let text = self.from_client.recv().await.unwrap();
            serde_json::from_str(&text).unwrap()
        }

        fn send(&self, frame: ServerFrame) {
            self.to_client
                .send(serde_json::to_string(&frame).unwrap())
                .unwrap();
        }
    }

    fn pair() -> (ChannelTransport, ServiceEnd) {
        let (to_service, from_client) = mpsc::unbounded_channel();
        let (to_client, from_service) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                to_service,
                from_service,
            },
            ServiceEnd {
                from_client,
                to_client,
            },
        )
    }

    fn connection(
        transports: Vec<ChannelTransport>,
    ) -> (Connection, mpsc::Receiver<ConnectionEvent>) {
        let connector = ScriptedConnector {
            ends: StdMutex::new(transports),
        };
        Connection::new(
            Arc::new(connector),
            &RealtimeConfig::new().with_client_id("host-1"),
        )
    }

    async fn connect_and_accept(conn: &Connection, service: &mut ServiceEnd) {
        conn.connect("tok").await.unwrap();
        assert!(matches!(
            service.next_frame().await,
            ClientFrame::Authenticate { .. }
        ));
        service.send(ServerFrame::Connected {
            connection_id: "c1".into(),
        });
        conn.wait_for_state(ConnectionState::Connected, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_token_fails_fast_without_state_change() {
        let (conn, _events) = connection(vec![]);
        let err = conn.connect("  ").await.unwrap_err();
        assert!(matches!(err, QuizcastError::Auth(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn authenticate_is_first_frame_and_carries_client_id() {
        let (transport, mut service) = pair();
        let (conn, _events) = connection(vec![transport]);
        conn.connect("tok").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        match service.next_frame().await {
            ClientFrame::Authenticate {
                token, client_id, ..
            } => {
                assert_eq!(token, "tok");
                assert_eq!(client_id, "host-1");
            }
            other => panic!("unexpected first frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connector_failure_sets_failed() {
        let (conn, _events) = connection(vec![]);
        assert!(conn.connect("tok").await.is_err());
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn auth_error_frame_sets_failed() {
        let (transport, mut service) = pair();
        let (conn, _events) = connection(vec![transport]);
        conn.connect("bad").await.unwrap();
        let _ = service.next_frame().await;
        service.send(ServerFrame::Error {
            message: "expired".into(),
            error_code: Some(crate::ErrorCode::TokenExpired),
            channel: None,
        });
        conn.wait_for_state(ConnectionState::Failed, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn publish_resolves_on_ack_and_fails_on_nack() {
        let (transport, mut service) = pair();
        let (conn, _events) = connection(vec![transport]);
        connect_and_accept(&conn, &mut service).await;

        let conn = Arc::new(conn);
        let publisher = Arc::clone(&conn);
        let first = tokio::spawn(async move {
            publisher
                .publish("t", "quest", serde_json::json!({"n": 1}))
                .await
        });
        let ClientFrame::Publish { msg_serial, .. } = service.next_frame().await else {
            panic!("expected publish");
        };
        service.send(ServerFrame::Ack { msg_serial });
        first.await.unwrap().unwrap();

        let publisher = Arc::clone(&conn);
        let second =
            tokio::spawn(async move { publisher.publish("t", "quest", serde_json::json!(2)).await });
        let ClientFrame::Publish { msg_serial, .. } = service.next_frame().await else {
            panic!("expected publish");
        };
        service.send(ServerFrame::Nack {
            msg_serial,
            message: "too big".into(),
            error_code: Some(crate::ErrorCode::MessageTooLarge),
        });
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, QuizcastError::Channel { .. }));
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_not_connected() {
        let (conn, _events) = connection(vec![]);
        let err = conn
            .publish("t", "message", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, QuizcastError::NotConnected));
    }

    #[tokio::test]
    async fn pending_publish_fails_when_transport_drops() {
        let (transport, mut service) = pair();
        let (conn, _events) = connection(vec![transport]);
        connect_and_accept(&conn, &mut service).await;

        let conn = Arc::new(conn);
        let publisher = Arc::clone(&conn);
        let pending =
            tokio::spawn(async move { publisher.publish("t", "x", serde_json::json!(1)).await });
        let _ = service.next_frame().await;
        drop(service);

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, QuizcastError::NotConnected));
        conn.wait_for_state(ConnectionState::Disconnected, Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn attach_is_sent_once_per_channel() {
        let (transport, mut service) = pair();
        let (conn, _events) = connection(vec![transport]);
        connect_and_accept(&conn, &mut service).await;

        let first = conn.attach("t").unwrap();
        let second = conn.attach("t").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(
            service.next_frame().await,
            ClientFrame::Attach { .. }
        ));
        conn.ping().unwrap();
        assert!(matches!(service.next_frame().await, ClientFrame::Ping));
    }

    #[tokio::test]
    async fn presence_requires_attached_channel() {
        let (transport, mut service) = pair();
        let (conn, _events) = connection(vec![transport]);

        assert!(matches!(
            conn.enter_presence("t", None),
            Err(QuizcastError::NotConnected)
        ));

        connect_and_accept(&conn, &mut service).await;
        assert!(matches!(
            conn.enter_presence("t", None),
            Err(QuizcastError::NotReady(_))
        ));

        conn.attach("t").unwrap();
        let _ = service.next_frame().await;
        service.send(ServerFrame::Attached {
            channel: "t".into(),
        });
        tokio::time::timeout(Duration::from_secs(1), async {
            while conn.get_or_create_channel("t").state() != ChannelState::Attached {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        conn.enter_presence("t", Some(serde_json::json!({"role": "host"})))
            .unwrap();
        assert!(matches!(
            service.next_frame().await,
            ClientFrame::PresenceEnter { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent_and_clears_channels() {
        let (transport, mut service) = pair();
        let (conn, mut events) = connection(vec![transport]);
        connect_and_accept(&conn, &mut service).await;
        conn.attach("a").unwrap();
        assert_eq!(conn.channel_topics(), vec!["a".to_string()]);

        conn.disconnect().await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.channel_topics().is_empty());

        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ConnectionEvent::StateChanged { state, .. } = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn reconnect_replaces_previous_transport() {
        let (second, mut second_service) = pair();
        let (first, mut first_service) = pair();
        // Popped from the back.
        let (conn, _events) = connection(vec![second, first]);
        connect_and_accept(&conn, &mut first_service).await;

        conn.connect("tok-2").await.unwrap();
        // The old loop is gone, so its service end sees the channel close.
        assert!(first_service.from_client.recv().await.is_none());
        match second_service.next_frame().await {
            ClientFrame::Authenticate { token, .. } => assert_eq!(token, "tok-2"),
            other => panic!("unexpected frame: {other:?}"),
        }
        // A late frame from the stale service must not affect state.
        let _ = first_service.to_client.send(
            serde_json::to_string(&ServerFrame::Connected {
                connection_id: "stale".into(),
            })
            .unwrap(),
        );
        tokio::task::yield_now().await;
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn inbound_messages_are_forwarded_in_order() {
        let (transport, mut service) = pair();
        let (conn, mut events) = connection(vec![transport]);
        connect_and_accept(&conn, &mut service).await;

        for n in 0..3 {
            service.send(ServerFrame::Message {
                channel: "t".into(),
                name: Some("message".into()),
                data: serde_json::json!(n),
                timestamp: None,
            });
        }
        let mut seen = Vec::new();
        while seen.len() < 3 {
            if let Some(ConnectionEvent::Message { data, .. }) = events.recv().await {
                seen.push(data);
            }
        }
        assert_eq!(seen, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }
}
