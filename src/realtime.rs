//! Topic registry and message dispatcher.
//!
//! [`Realtime`] multiplexes any number of logical listeners onto one channel
//! attachment per topic. A topic is attached when its first listener arrives
//! and detached when its last listener leaves; listener registrations survive
//! disconnects and are re-attached automatically once the connection is back.
//!
//! Every inbound message becomes one [`InboundMessage`] that is handed, in
//! order, to the topic's listeners and then to the global listeners.
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn example() -> quizcast_client::Result<()> {
//! use std::time::Duration;
//! use quizcast_client::{Realtime, RealtimeConfig, WebSocketConnector};
//!
//! let realtime = Realtime::new(
//!     WebSocketConnector::new("wss://realtime.example.com/ws"),
//!     RealtimeConfig::new(),
//! );
//! realtime.connect("token").await?;
//! realtime.wait_until_connected(Duration::from_secs(10)).await?;
//!
//! let id = realtime.subscribe_to_topic("publish/comment/42", |msg| {
//!     println!("{:?}: {}", msg.event, msg.payload);
//! })?;
//! realtime.unsubscribe_from_topic("publish/comment/42", id);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::connection::{Connection, ConnectionEvent, ConnectionState};
use crate::error::{QuizcastError, Result};
use crate::events::{EventSink, HostEvent};
use crate::message::{
    now_millis, InboundMessage, ListenerId, MessageCallback, RawMessage, DEFAULT_EVENT_NAME,
};
use crate::presence::{PresenceCallback, PresenceEvent, PresenceTracker};
use crate::protocol::PresenceMember;
use crate::timer::with_timeout;
use crate::transport::Connector;

/// Default topic for [`Realtime::send_message`] without an explicit topic.
pub const DEFAULT_TOPIC: &str = "test/topic/local";

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

// ── Configuration ───────────────────────────────────────────────────

/// Configuration for a [`Realtime`] client.
///
/// # Example
///
/// ```
/// use quizcast_client::RealtimeConfig;
/// use std::time::Duration;
///
/// let config = RealtimeConfig::new()
///     .with_client_id("host-7")
///     .with_configured_topics(["publish/comment/7"])
///     .with_publish_timeout(Duration::from_secs(3));
/// assert_eq!(config.client_id, "host-7");
/// assert_eq!(config.default_topic, "test/topic/local");
/// ```
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Identity used for presence. Defaults to a random UUID.
    pub client_id: String,
    /// Topics attached for global listeners.
    pub configured_topics: Vec<String>,
    /// Topic used by [`Realtime::send_message`] when none is given.
    pub default_topic: String,
    /// Upper bound on one publish round-trip. Defaults to **5 seconds**.
    pub publish_timeout: Duration,
    /// Capacity of the bounded connection event channel.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// Time the transport loop gets to close gracefully before it is aborted.
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl RealtimeConfig {
    pub fn new() -> Self {
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            configured_topics: Vec::new(),
            default_topic: DEFAULT_TOPIC.to_string(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Defaults overlaid with `QUIZCAST_TOPICS` (comma-separated) and
    /// `QUIZCAST_CLIENT_ID`.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Ok(topics) = std::env::var("QUIZCAST_TOPICS") {
            config.configured_topics = parse_topic_list(&topics);
        }
        if let Ok(client_id) = std::env::var("QUIZCAST_CLIENT_ID") {
            if !client_id.trim().is_empty() {
                config.client_id = client_id.trim().to_string();
            }
        }
        config
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_configured_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configured_topics = topics
            .into_iter()
            .map(Into::into)
            .filter(|t: &String| !t.is_empty())
            .collect();
        self
    }

    #[must_use]
    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = topic.into();
        self
    }

    #[must_use]
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_topic_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Registry ────────────────────────────────────────────────────────

type TopicFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct TopicEntry {
    listeners: Vec<(ListenerId, MessageCallback)>,
    presence_listeners: Vec<(ListenerId, PresenceCallback)>,
    /// Held open for global listeners.
    pinned: bool,
    /// An attach was issued on the current connection.
    wired: bool,
}

impl TopicEntry {
    fn is_unused(&self) -> bool {
        self.listeners.is_empty() && self.presence_listeners.is_empty() && !self.pinned
    }
}

struct GlobalListener {
    id: ListenerId,
    filter: Option<TopicFilter>,
    callback: MessageCallback,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, TopicEntry>,
    globals: Vec<GlobalListener>,
    next_id: u64,
}

impl Registry {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

struct Inner {
    connection: Connection,
    registry: Mutex<Registry>,
    presence: PresenceTracker,
    config: RealtimeConfig,
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `topic` if it is not attached on the current connection yet.
    fn wire(&self, topic: &str, entry: &mut TopicEntry) {
        if entry.wired || !self.connection.is_connected() {
            return;
        }
        match self.connection.attach(topic) {
            Ok(_) => {
                entry.wired = true;
                debug!(topic = %topic, "topic subscribed");
            }
            Err(e) => debug!(topic = %topic, error = %e, "topic attach deferred"),
        }
    }

    fn release_if_unused(&self, registry: &mut Registry, topic: &str) {
        let unused = registry.topics.get(topic).is_some_and(TopicEntry::is_unused);
        if !unused {
            return;
        }
        if let Some(entry) = registry.topics.remove(topic) {
            if entry.wired {
                self.connection.detach(topic);
            }
            self.presence.forget_topic(topic);
            debug!(topic = %topic, "topic released");
        }
    }

    fn on_state_changed(&self, state: ConnectionState) {
        let mut registry = self.registry();
        if state == ConnectionState::Connected {
            let mut rewired = 0usize;
            for (topic, entry) in &mut registry.topics {
                if !entry.wired {
                    self.wire(topic, entry);
                    rewired += usize::from(entry.wired);
                }
            }
            if rewired > 0 {
                info!(count = rewired, "re-attached topics after connect");
            }
        } else {
            for entry in registry.topics.values_mut() {
                entry.wired = false;
            }
            drop(registry);
            self.presence.clear();
        }
    }

    fn dispatch(&self, topic: &str, raw: RawMessage) {
        let (topic_callbacks, global_callbacks) = {
            let registry = self.registry();
            let Some(entry) = registry.topics.get(topic) else {
                debug!(topic = %topic, "dropping message for unsubscribed topic");
                return;
            };
            let topic_callbacks: Vec<MessageCallback> =
                entry.listeners.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            let global_callbacks: Vec<MessageCallback> = registry
                .globals
                .iter()
                .filter(|g| g.filter.as_ref().is_none_or(|f| f(topic)))
                .map(|g| Arc::clone(&g.callback))
                .collect();
            (topic_callbacks, global_callbacks)
        };

        let message = raw.into_inbound(topic);
        for callback in topic_callbacks.iter().chain(global_callbacks.iter()) {
            if catch_unwind(AssertUnwindSafe(|| callback(&message))).is_err() {
                error!(topic = %topic, "message listener panicked");
            }
        }
    }

    fn dispatch_presence(&self, event: PresenceEvent) {
        self.presence
            .apply(&event.topic, event.action, &event.member);
        let callbacks: Vec<PresenceCallback> = self
            .registry()
            .topics
            .get(&event.topic)
            .map(|entry| {
                entry
                    .presence_listeners
                    .iter()
                    .map(|(_, cb)| Arc::clone(cb))
                    .collect()
            })
            .unwrap_or_default();
        for callback in &callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                error!(topic = %event.topic, "presence listener panicked");
            }
        }
    }
}

// ── Realtime ────────────────────────────────────────────────────────

/// Realtime pub/sub client: connection, topic registry and presence.
///
/// Construct one per process and share it (`Arc<Realtime>`) with everything
/// that publishes or listens.
pub struct Realtime {
    inner: Arc<Inner>,
    pump: tokio::task::JoinHandle<()>,
}

impl Realtime {
    /// Create a disconnected client. Must be called inside a Tokio runtime.
    pub fn new(connector: impl Connector, config: RealtimeConfig) -> Self {
        Self::with_connector(Arc::new(connector), config)
    }

    /// Like [`new`](Self::new) with a shared connector.
    pub fn with_connector(connector: Arc<dyn Connector>, config: RealtimeConfig) -> Self {
        let (connection, events) = Connection::new(connector, &config);
        let inner = Arc::new(Inner {
            connection,
            registry: Mutex::new(Registry::default()),
            presence: PresenceTracker::new(),
            config,
        });
        let pump = tokio::spawn(event_pump(Arc::clone(&inner), events));
        Self { inner, pump }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Connect (or reconnect) with `token`.
    ///
    /// Listener registrations are kept; their topics are re-attached once
    /// the new connection is up.
    ///
    /// # Errors
    ///
    /// See [`Connection::connect`].
    pub async fn connect(&self, token: &str) -> Result<()> {
        self.inner.connection.connect(token).await
    }

    /// Close the connection. Listener registrations are kept.
    pub async fn disconnect(&self) {
        self.inner.connection.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    /// Observe connection state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Wait until connected.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::Auth`] if the connection fails instead,
    /// [`QuizcastError::Timeout`] if neither happens in time.
    pub async fn wait_until_connected(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_receiver();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed)),
        )
        .await
        .map_err(|_| QuizcastError::Timeout)?
        .map(|state| *state)
        .map_err(|_| QuizcastError::NotConnected)?;
        match reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(QuizcastError::Auth("realtime connection failed".into())),
        }
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Register `callback` for messages on `topic`.
    ///
    /// The topic is attached on the first registration only. When the client
    /// is not connected the attach happens as soon as it is.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::InvalidTopic`] for an empty topic.
    pub fn subscribe_to_topic<F>(&self, topic: &str, callback: F) -> Result<ListenerId>
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        if topic.is_empty() {
            return Err(QuizcastError::InvalidTopic(topic.to_owned()));
        }
        let mut registry = self.inner.registry();
        let id = registry.next_id();
        let entry = registry.topics.entry(topic.to_owned()).or_default();
        entry.listeners.push((id, Arc::new(callback)));
        self.inner.wire(topic, entry);
        debug!(topic = %topic, %id, "listener added");
        Ok(id)
    }

    /// Remove one listener. Returns `false` if it was not registered.
    ///
    /// Removing the last listener of a topic detaches it.
    pub fn unsubscribe_from_topic(&self, topic: &str, id: ListenerId) -> bool {
        let mut registry = self.inner.registry();
        let Some(entry) = registry.topics.get_mut(topic) else {
            return false;
        };
        let before = entry.listeners.len();
        entry.listeners.retain(|(lid, _)| *lid != id);
        let removed = entry.listeners.len() != before;
        if removed {
            debug!(topic = %topic, %id, "listener removed");
            self.inner.release_if_unused(&mut registry, topic);
        }
        removed
    }

    /// Register a listener for every message on every subscribed topic.
    ///
    /// Also attaches the configured topics.
    pub fn add_global_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.push_global(None, Arc::new(callback))
    }

    /// Register a global listener that only sees topics matching `filter`.
    pub fn add_pattern_listener<P, F>(&self, filter: P, callback: F) -> ListenerId
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.push_global(Some(Arc::new(filter)), Arc::new(callback))
    }

    fn push_global(&self, filter: Option<TopicFilter>, callback: MessageCallback) -> ListenerId {
        let mut registry = self.inner.registry();
        let id = registry.next_id();
        registry.globals.push(GlobalListener {
            id,
            filter,
            callback,
        });
        for topic in &self.inner.config.configured_topics {
            let entry = registry.topics.entry(topic.clone()).or_default();
            entry.pinned = true;
            self.inner.wire(topic, entry);
        }
        debug!(%id, "global listener added");
        id
    }

    /// Remove a global listener. Configured topics stay attached.
    pub fn remove_global_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.inner.registry();
        let before = registry.globals.len();
        registry.globals.retain(|g| g.id != id);
        registry.globals.len() != before
    }

    /// Alias of [`add_global_listener`](Self::add_global_listener).
    pub fn add_message_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.add_global_listener(callback)
    }

    /// Alias of [`remove_global_listener`](Self::remove_global_listener).
    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.remove_global_listener(id)
    }

    /// Deliver a wire message on `topic` to its listeners, then to the global
    /// listeners, each in registration order.
    ///
    /// Messages for topics without listeners are dropped. A panicking
    /// listener is logged and does not stop the others.
    pub fn process_message(&self, topic: &str, raw: RawMessage) {
        self.inner.dispatch(topic, raw);
    }

    /// Topics that currently have listeners, sorted.
    pub fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.registry().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Number of message listeners on `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner
            .registry()
            .topics
            .get(topic)
            .map_or(0, |e| e.listeners.len())
    }

    pub fn global_listener_count(&self) -> usize {
        self.inner.registry().globals.len()
    }

    // ── Publishing ──────────────────────────────────────────────────

    /// Publish `payload` on `topic` under `event` (default `"message"`),
    /// bounded by the configured publish timeout.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::NotConnected`], [`QuizcastError::Timeout`] or the
    /// service's rejection.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        event: Option<&str>,
    ) -> Result<()> {
        let name = event.unwrap_or(DEFAULT_EVENT_NAME);
        let result = with_timeout(
            self.inner.config.publish_timeout,
            self.inner.connection.publish(topic, name, payload),
        )
        .await;
        if let Err(e) = &result {
            warn!(topic = %topic, event = %name, error = %e, "publish failed");
        }
        result
    }

    /// Publish `message` on `topic`, or on the configured default topic.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn send_message(&self, topic: Option<&str>, message: serde_json::Value) -> Result<()> {
        let topic = topic.unwrap_or(&self.inner.config.default_topic);
        self.publish(topic, message, None).await
    }

    /// Publish `message` to every topic concurrently.
    ///
    /// Returns one result per topic, in input order.
    pub async fn send_to_multiple_topics<S: AsRef<str>>(
        &self,
        message: &serde_json::Value,
        topics: &[S],
    ) -> Vec<Result<()>> {
        join_all(
            topics
                .iter()
                .map(|t| self.publish(t.as_ref(), message.clone(), None)),
        )
        .await
    }

    /// Publish `message` tagged with broadcast metadata
    /// (`_broadcast`, `_timestamp`, `_source`).
    ///
    /// Non-object messages are wrapped as `{"value": message}` first.
    ///
    /// # Errors
    ///
    /// See [`publish`](Self::publish).
    pub async fn broadcast_message(&self, message: serde_json::Value, topic: &str) -> Result<()> {
        let mut object = match message {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        object.insert("_broadcast".into(), serde_json::Value::Bool(true));
        object.insert("_timestamp".into(), serde_json::Value::from(now_millis()));
        object.insert("_source".into(), serde_json::Value::from("broadcast"));
        self.publish(topic, serde_json::Value::Object(object), None)
            .await
    }

    // ── Presence ────────────────────────────────────────────────────

    /// Enter the presence set of an attached topic.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::NotReady`] while the topic is not attached yet,
    /// [`QuizcastError::NotConnected`] when disconnected.
    pub fn enter_presence(&self, topic: &str, data: Option<serde_json::Value>) -> Result<()> {
        self.inner.connection.enter_presence(topic, data)?;
        self.inner.presence.mark_entered(topic);
        Ok(())
    }

    /// Leave the presence set of `topic`. A no-op if this client never entered.
    ///
    /// # Errors
    ///
    /// See [`enter_presence`](Self::enter_presence).
    pub fn leave_presence(&self, topic: &str) -> Result<()> {
        if !self.inner.presence.has_entered(topic) {
            return Ok(());
        }
        self.inner.connection.leave_presence(topic)?;
        self.inner.presence.mark_left(topic);
        Ok(())
    }

    /// Current members of `topic`. Empty when presence is not available yet.
    pub fn get_presence(&self, topic: &str) -> Vec<PresenceMember> {
        if !self.is_connected() {
            return Vec::new();
        }
        self.inner.presence.snapshot(topic)
    }

    /// Number of members on `topic`, `0` when presence is not available yet.
    pub fn presence_count(&self, topic: &str) -> usize {
        if !self.is_connected() {
            return 0;
        }
        self.inner.presence.count(topic)
    }

    /// Register `callback` for presence changes on `topic`.
    ///
    /// Counts as a listener of the topic, so it keeps the topic attached.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::InvalidTopic`] for an empty topic.
    pub fn subscribe_presence<F>(&self, topic: &str, callback: F) -> Result<ListenerId>
    where
        F: Fn(&PresenceEvent) + Send + Sync + 'static,
    {
        if topic.is_empty() {
            return Err(QuizcastError::InvalidTopic(topic.to_owned()));
        }
        let mut registry = self.inner.registry();
        let id = registry.next_id();
        let entry = registry.topics.entry(topic.to_owned()).or_default();
        entry.presence_listeners.push((id, Arc::new(callback)));
        self.inner.wire(topic, entry);
        Ok(id)
    }

    /// Remove a presence listener. Returns `false` if it was not registered.
    pub fn unsubscribe_presence(&self, topic: &str, id: ListenerId) -> bool {
        let mut registry = self.inner.registry();
        let Some(entry) = registry.topics.get_mut(topic) else {
            return false;
        };
        let before = entry.presence_listeners.len();
        entry.presence_listeners.retain(|(lid, _)| *lid != id);
        let removed = entry.presence_listeners.len() != before;
        if removed {
            self.inner.release_if_unused(&mut registry, topic);
        }
        removed
    }
}

#[async_trait]
impl EventSink for Realtime {
    async fn publish_event(&self, topic: &str, event: &HostEvent) -> Result<()> {
        self.publish(topic, event.to_payload()?, Some(event.name()))
            .await
    }
}

impl std::fmt::Debug for Realtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realtime")
            .field("connection", &self.inner.connection)
            .field("topics", &self.subscribed_topics())
            .finish()
    }
}

impl Drop for Realtime {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Applies connection events to the registry and presence tracker.
async fn event_pump(inner: Arc<Inner>, mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::StateChanged { state, reason } => {
                debug!(?state, reason = ?reason, "dispatcher observed state change");
                inner.on_state_changed(state);
            }
            ConnectionEvent::Message {
                topic,
                name,
                data,
                timestamp,
            } => inner.dispatch(
                &topic,
                RawMessage {
                    name,
                    data,
                    timestamp,
                },
            ),
            ConnectionEvent::Presence {
                topic,
                action,
                member,
                timestamp,
            } => inner.dispatch_presence(PresenceEvent {
                topic,
                action,
                member,
                timestamp: timestamp.unwrap_or_else(now_millis),
            }),
            ConnectionEvent::PresenceSync { topic, members } => {
                inner.presence.sync(&topic, members);
            }
        }
    }
    debug!("connection event stream ended");
}
