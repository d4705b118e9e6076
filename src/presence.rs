//! Per-topic presence sets.
//!
//! The tracker mirrors what the service reports: `PresenceSync` replaces a
//! topic's set, single `Presence` frames update it. Reads are point-in-time
//! snapshots.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::{PresenceAction, PresenceMember};

/// One presence change delivered to presence listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub topic: String,
    pub action: PresenceAction,
    pub member: PresenceMember,
    pub timestamp: i64,
}

/// Callback invoked for every presence change on a topic.
pub type PresenceCallback = Arc<dyn Fn(&PresenceEvent) + Send + Sync>;

/// Members of one topic keyed by client id.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    members: BTreeMap<String, Option<serde_json::Value>>,
}

impl PresenceSet {
    pub fn apply(&mut self, action: PresenceAction, member: &PresenceMember) {
        match action {
            PresenceAction::Enter | PresenceAction::Update | PresenceAction::Present => {
                self.members
                    .insert(member.client_id.clone(), member.data.clone());
            }
            PresenceAction::Leave => {
                self.members.remove(&member.client_id);
            }
        }
    }

    pub fn replace(&mut self, members: Vec<PresenceMember>) {
        self.members = members
            .into_iter()
            .map(|m| (m.client_id, m.data))
            .collect();
    }

    pub fn snapshot(&self) -> Vec<PresenceMember> {
        self.members
            .iter()
            .map(|(client_id, data)| PresenceMember {
                client_id: client_id.clone(),
                data: data.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.members.contains_key(client_id)
    }
}

#[derive(Default)]
struct TrackerState {
    sets: HashMap<String, PresenceSet>,
    /// Topics this client has entered.
    entered: HashSet<String>,
}

/// Presence sets for every topic, plus the topics this client has entered.
#[derive(Default)]
pub struct PresenceTracker {
    state: Mutex<TrackerState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn apply(&self, topic: &str, action: PresenceAction, member: &PresenceMember) {
        self.lock()
            .sets
            .entry(topic.to_owned())
            .or_default()
            .apply(action, member);
    }

    pub fn sync(&self, topic: &str, members: Vec<PresenceMember>) {
        self.lock()
            .sets
            .entry(topic.to_owned())
            .or_default()
            .replace(members);
    }

    /// Members of `topic`; empty when nothing is known yet.
    pub fn snapshot(&self, topic: &str) -> Vec<PresenceMember> {
        self.lock()
            .sets
            .get(topic)
            .map(PresenceSet::snapshot)
            .unwrap_or_default()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.lock().sets.get(topic).map_or(0, PresenceSet::len)
    }

    pub fn mark_entered(&self, topic: &str) {
        self.lock().entered.insert(topic.to_owned());
    }

    /// Forget that this client entered `topic`. Returns whether it had.
    pub fn mark_left(&self, topic: &str) -> bool {
        self.lock().entered.remove(topic)
    }

    pub fn has_entered(&self, topic: &str) -> bool {
        self.lock().entered.contains(topic)
    }

    pub fn forget_topic(&self, topic: &str) {
        let mut state = self.lock();
        state.sets.remove(topic);
        state.entered.remove(topic);
    }

    /// Drop every set; the service resends them after reattaching.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.sets.clear();
        state.entered.clear();
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("PresenceTracker")
            .field("topics", &state.sets.len())
            .field("entered", &state.entered)
            .finish()
    }
}
