//! Bounded operator activity log.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::message::now_millis;

/// Severity of an activity entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Info,
    /// The round progressed on a fallback path.
    Degraded,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityEntry {
    pub kind: ActivityKind,
    pub message: String,
    /// Epoch milliseconds.
    pub at_ms: i64,
}

/// Newest-first log of what the controller did, capped at a fixed length.
///
/// Every entry is mirrored to `tracing` at a level matching its kind.
#[derive(Debug)]
pub struct ActivityLog {
    capacity: usize,
    entries: Mutex<VecDeque<ActivityEntry>>,
}

impl ActivityLog {
    /// Values below 1 are clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, kind: ActivityKind, message: impl Into<String>) {
        let message = message.into();
        match kind {
            ActivityKind::Info => info!(activity = %message),
            ActivityKind::Degraded => warn!(activity = %message, "degraded"),
            ActivityKind::Error => error!(activity = %message),
        }
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_front(ActivityEntry {
            kind,
            message,
            at_ms: now_millis(),
        });
        entries.truncate(self.capacity);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(ActivityKind::Info, message);
    }

    pub fn degraded(&self, message: impl Into<String>) {
        self.record(ActivityKind::Degraded, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(ActivityKind::Error, message);
    }

    /// Entries, newest first.
    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
