//! Transport abstraction for the realtime pub/sub connection.
//!
//! The [`Transport`] trait defines a bidirectional text frame channel between
//! the client and the realtime service. Every frame is one JSON message (see
//! [`protocol`](crate::protocol)), so each implementation must handle message
//! framing internally (WebSocket frames, length-prefixed TCP, ...).
//!
//! # Connection Setup
//!
//! Because a connection may be torn down and rebuilt with a fresh token, the
//! client does not take a single connected transport. It takes a
//! [`Connector`], which produces a new connected [`Transport`] every time
//! [`Connection::connect`](crate::connection::Connection::connect) runs.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use quizcast_client::error::QuizcastError;
//! use quizcast_client::transport::Transport;
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), QuizcastError> {
//!         // Send the JSON text frame over your transport
//!         Ok(())
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, QuizcastError>> {
//!         // Receive the next JSON text frame
//!         // Return None when the connection is closed cleanly
//!         None
//!     }
//!
//!     async fn close(&mut self) -> Result<(), QuizcastError> {
//!         Ok(())
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::QuizcastError;

/// A bidirectional text frame transport to the realtime service.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame.
/// Each call to [`recv`](Transport::recv) returns one complete JSON frame.
///
/// # Object Safety
///
/// This trait is object-safe; the connection layer stores `Box<dyn Transport>`
/// so that every reconnect can hand it a fresh instance.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method **MUST** be cancel-safe because it is used
/// inside `tokio::select!`. If `recv` is cancelled before completion, calling it
/// again must not lose data. Channel-based implementations (e.g., wrapping
/// `mpsc::Receiver`) are naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the service.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::TransportSend`] if the frame could not be sent
    /// (e.g., connection broken, write buffer full).
    async fn send(&mut self, message: String) -> Result<(), QuizcastError>;

    /// Receive the next JSON text frame from the service.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred (e.g., [`QuizcastError::TransportReceive`])
    /// - `None`: the connection was closed cleanly by the service
    async fn recv(&mut self) -> Option<Result<String, QuizcastError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the graceful shutdown fails. Implementations should
    /// still release resources even if the close handshake fails.
    async fn close(&mut self) -> Result<(), QuizcastError>;
}

/// Produces connected transports for a realtime token.
///
/// Implementations decide how the token reaches the service (query string,
/// header, ...). The token is also sent in the first `Authenticate` frame.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::Io`] or [`QuizcastError::Timeout`] when the
    /// service cannot be reached.
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, QuizcastError>;
}
