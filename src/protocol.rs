//! Wire frames exchanged with the realtime pub/sub service.
//!
//! Every frame is one JSON text message, adjacently tagged as
//! `{"type": "<Variant>", "data": {...}}`. Channels are identified by their
//! topic string; the service multiplexes all channels over one connection.

use serde::{Deserialize, Serialize};

use crate::error_codes::ErrorCode;

// ── Presence ────────────────────────────────────────────────────────

/// What happened to a presence member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    /// The member joined the channel's presence set.
    Enter,
    /// The member left the channel's presence set.
    Leave,
    /// The member replaced its presence data.
    Update,
    /// The member was already present when the subscription started.
    Present,
}

/// A participant in a channel's presence set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceMember {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ── Frames ──────────────────────────────────────────────────────────

/// Frames sent from client to service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Authenticate the connection (MUST be the first frame).
    Authenticate {
        /// Opaque realtime token obtained out-of-band.
        token: String,
        /// Identity used for presence on this connection.
        client_id: String,
        /// SDK version for debugging.
        #[serde(skip_serializing_if = "Option::is_none")]
        sdk_version: Option<String>,
    },
    /// Start receiving messages for a channel.
    Attach { channel: String },
    /// Stop receiving messages for a channel.
    Detach { channel: String },
    /// Publish a message; acknowledged by `Ack`/`Nack` with the same serial.
    Publish {
        channel: String,
        msg_serial: u64,
        name: String,
        data: serde_json::Value,
    },
    /// Join the channel's presence set.
    PresenceEnter {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
    /// Leave the channel's presence set.
    PresenceLeave { channel: String },
    /// Heartbeat.
    Ping,
}

/// Frames sent from service to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Authentication accepted; the connection is live.
    Connected { connection_id: String },
    /// The channel is attached and will deliver messages.
    Attached { channel: String },
    /// The channel was detached (on request or by the service).
    Detached {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// A message published on an attached channel.
    Message {
        channel: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default)]
        data: serde_json::Value,
        /// Service timestamp in epoch milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// A single presence change on an attached channel.
    Presence {
        channel: String,
        action: PresenceAction,
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    /// The complete presence set of a channel, sent after attaching.
    PresenceSync {
        channel: String,
        #[serde(default)]
        members: Vec<PresenceMember>,
    },
    /// Publish accepted.
    Ack { msg_serial: u64 },
    /// Publish refused.
    Nack {
        msg_serial: u64,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Heartbeat response.
    Pong,
    /// Connection- or channel-level error.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
        /// Set when the error only affects one channel.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    /// The service is closing the connection.
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}
