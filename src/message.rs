//! Canonical inbound message and listener bookkeeping types.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Event name used when a publish does not specify one.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// A message as delivered to listeners.
///
/// Built once per wire message and shared by reference with every matching
/// callback. `payload` is the published data as-is; use
/// [`normalize`](crate::normalize) to flatten nested envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    pub event: Option<String>,
    pub payload: serde_json::Value,
    /// Epoch milliseconds; the service timestamp when present, otherwise the
    /// local receive time.
    pub timestamp: i64,
}

/// A wire message before it is stamped with its topic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub name: Option<String>,
    pub data: serde_json::Value,
    pub timestamp: Option<i64>,
}

impl RawMessage {
    pub fn new(name: Option<String>, data: serde_json::Value) -> Self {
        Self {
            name,
            data,
            timestamp: None,
        }
    }

    /// Build the canonical [`InboundMessage`] for `topic`.
    pub fn into_inbound(self, topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_owned(),
            event: self.name,
            payload: self.data,
            timestamp: self.timestamp.unwrap_or_else(now_millis),
        }
    }
}

/// Handle returned when registering a listener; pass it back to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Callback invoked for every matching [`InboundMessage`].
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
