//! # Quizcast Client
//!
//! Realtime pub/sub client and host-side orchestration for live quiz shows.
//!
//! The crate has two halves:
//!
//! - **Realtime.** [`Realtime`] wraps a single connection to the pub/sub
//!   service. It keeps one channel subscription per topic no matter how many
//!   listeners are registered, re-attaches every active topic after a
//!   reconnect, tracks presence, and publishes with acknowledgements.
//!   [`MultiSender`] buffers broadcasts until the connection is up.
//! - **Game control.** [`GameController`] drives the rounds of one quiz
//!   session against a [`QuizBackend`], announcing each transition through an
//!   [`EventSink`] (normally the [`Realtime`] client).
//!
//! Inbound viewer traffic arrives in several legacy shapes;
//! [`normalize`](mod@normalize) flattens it and decodes typed
//! [`ViewerEvent`]s.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in**: the default `transport-websocket` feature provides [`WebSocketConnector`]
//! - **REST backend**: the `http-backend` feature provides `HttpQuizBackend` over `reqwest`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn run() -> quizcast_client::Result<()> {
//! use std::time::Duration;
//! use quizcast_client::{Realtime, RealtimeConfig, WebSocketConnector};
//!
//! let connector = WebSocketConnector::new("wss://realtime.example.com/v1");
//! let realtime = Realtime::new(connector, RealtimeConfig::default());
//!
//! realtime.subscribe_to_topic("publish/comment/42", |msg| {
//!     println!("{:?}: {}", msg.event, msg.payload);
//! })?;
//!
//! realtime.connect("my-token").await?;
//! realtime.wait_until_connected(Duration::from_secs(10)).await?;
//! realtime
//!     .send_message(Some("publish/comment/42"), serde_json::json!({"hello": "world"}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod activity;
pub mod backend;
pub mod backends;
pub mod connection;
pub mod error;
pub mod error_codes;
pub mod events;
pub mod game;
pub mod message;
pub mod normalize;
pub mod presence;
pub mod protocol;
pub mod realtime;
pub mod round;
pub mod sender;
pub mod timer;
pub mod topics;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use activity::{ActivityEntry, ActivityKind, ActivityLog};
pub use backend::{
    NextQuestion, Question, QuizBackend, QuizEndResult, SessionStart, TallyEntry, TallyResult,
};
pub use connection::{ChannelState, ConnectionState};
pub use error::{QuizcastError, Result};
pub use error_codes::ErrorCode;
pub use events::{EventSink, HostEvent};
pub use game::{GameConfig, GameController, RoundSnapshot, Settlement, TimerStart};
pub use message::{InboundMessage, ListenerId, RawMessage};
pub use normalize::{FeedKind, ViewerEvent};
pub use presence::PresenceEvent;
pub use protocol::{ClientFrame, PresenceAction, PresenceMember, ServerFrame};
pub use realtime::{Realtime, RealtimeConfig};
pub use round::{GamePhase, TimerPhase};
pub use sender::{MultiSender, QueueId};
pub use timer::{with_timeout, CountdownTimer};
pub use transport::{Connector, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};

#[cfg(feature = "http-backend")]
pub use backends::{ApiCredentials, HttpBackendConfig, HttpQuizBackend};
