//! Events the host publishes on the session topic.
//!
//! Each event goes out as `{"event": <name>, "data": {...}}` under the same
//! message name, so viewers can route on either.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{Question, TallyResult};
use crate::error::Result;

/// The revealed answer carried by `timer_end`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectOption {
    pub correct_option: Option<String>,
}

/// Authoritative state transitions announced to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum HostEvent {
    /// A new question was dispatched.
    #[serde(rename = "quest")]
    Question {
        question: Question,
        question_index: u32,
    },
    /// The answer window opened.
    TimerStart { seconds_allowed: u32 },
    /// The answer window closed; reveals the correct option.
    TimerEnd { question: CorrectOption },
    /// Full tally for the question. Always follows `timer_end` of the same round.
    LeaderboardUpdate(TallyResult),
    /// The session is over.
    QuizSessionEnd {},
}

impl HostEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Question { .. } => "quest",
            Self::TimerStart { .. } => "timer_start",
            Self::TimerEnd { .. } => "timer_end",
            Self::LeaderboardUpdate(_) => "leaderboard_update",
            Self::QuizSessionEnd {} => "quiz_session_end",
        }
    }

    /// The `{event, data}` envelope as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`QuizcastError::Serialization`](crate::QuizcastError::Serialization)
    /// if the payload cannot be encoded.
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Where the game controller publishes its events.
///
/// Implemented by [`Realtime`](crate::Realtime); tests substitute recorders.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    /// Publish `event` on `topic`, resolving once the publish is settled.
    async fn publish_event(&self, topic: &str, event: &HostEvent) -> Result<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_shapes_match_viewer_contract() {
        let quest = HostEvent::Question {
            question: Question {
                question_id: 5,
                question: "2+2?".into(),
                ..Question::default()
            },
            question_index: 3,
        };
        let value = quest.to_payload().unwrap();
        assert_eq!(value["event"], "quest");
        assert_eq!(value["data"]["question_index"], 3);
        assert_eq!(value["data"]["question"]["question_id"], 5);

        assert_eq!(
            HostEvent::TimerStart { seconds_allowed: 10 }
                .to_payload()
                .unwrap(),
            json!({"event": "timer_start", "data": {"seconds_allowed": 10}})
        );
        assert_eq!(
            HostEvent::TimerEnd {
                question: CorrectOption {
                    correct_option: Some("B".into())
                }
            }
            .to_payload()
            .unwrap(),
            json!({"event": "timer_end", "data": {"question": {"correct_option": "B"}}})
        );
        assert_eq!(
            HostEvent::QuizSessionEnd {}.to_payload().unwrap(),
            json!({"event": "quiz_session_end", "data": {}})
        );
    }

    #[test]
    fn names_match_serialized_tags() {
        let events = [
            HostEvent::TimerStart { seconds_allowed: 1 },
            HostEvent::TimerEnd {
                question: CorrectOption::default(),
            },
            HostEvent::LeaderboardUpdate(TallyResult::default()),
            HostEvent::QuizSessionEnd {},
        ];
        for event in events {
            assert_eq!(event.to_payload().unwrap()["event"], event.name());
        }
    }

    #[test]
    fn events_round_trip_from_viewer_side() {
        let decoded: HostEvent =
            serde_json::from_value(json!({"event": "leaderboard_update", "data": {"results": []}}))
                .unwrap();
        assert_eq!(decoded, HostEvent::LeaderboardUpdate(TallyResult::default()));
    }
}
