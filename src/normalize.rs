//! Inbound payload normalization and viewer event decoding.
//!
//! Producers wrap the same record in different envelopes: `{data: ...}`,
//! `{payload: ...}`, `{comment: {...}}`, or a one-element array.
//! [`unwrap_payload`] peels those layers in a fixed priority order
//! (`comment`, then `data`, then `payload`).
//!
//! [`decode_viewer_event`] turns a message into a typed [`ViewerEvent`]. It
//! first tries the canonical shapes and only then falls back to the
//! field-by-field legacy chains.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::message::{InboundMessage, DEFAULT_EVENT_NAME};

/// Nesting levels inspected before a value is returned as-is.
pub const MAX_UNWRAP_DEPTH: usize = 8;

const ENVELOPE_KEYS: [&str; 3] = ["comment", "data", "payload"];

/// Event names carrying answer submissions.
pub const ANSWER_EVENTS: [&str; 2] = ["quiz_selected_option", "player_selected_option"];

/// Peel envelope layers off `value`.
///
/// - strings, numbers and booleans are returned as-is
/// - arrays yield their normalized first element (`None` when empty)
/// - objects yield the first of `comment`/`data`/`payload` that normalizes to
///   a value, otherwise the object itself
/// - `null` yields `None`
///
/// Normalizing an already flat object returns it unchanged.
pub fn unwrap_payload(value: &Value) -> Option<&Value> {
    unwrap_at(value, 0)
}

fn unwrap_at(value: &Value, depth: usize) -> Option<&Value> {
    if depth >= MAX_UNWRAP_DEPTH {
        return match value {
            Value::Null => None,
            other => Some(other),
        };
    }
    match value {
        Value::Null => None,
        Value::Array(items) => items.first().and_then(|v| unwrap_at(v, depth + 1)),
        Value::Object(map) => {
            for key in ENVELOPE_KEYS {
                if let Some(nested @ (Value::Object(_) | Value::Array(_))) = map.get(key) {
                    if let Some(found) = unwrap_at(nested, depth + 1) {
                        return Some(found);
                    }
                }
            }
            Some(value)
        }
        _ => Some(value),
    }
}

/// Owned variant of [`unwrap_payload`]; `Null` when nothing is left.
pub fn normalize(value: &Value) -> Value {
    unwrap_payload(value).cloned().unwrap_or(Value::Null)
}

// ── Viewer events ───────────────────────────────────────────────────

/// Which comment event names a feed listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    GoldenHour,
    HustleTvShow,
}

impl FeedKind {
    pub fn comment_events(self) -> &'static [&'static str] {
        match self {
            Self::GoldenHour => &["publish_quiz_comment", "publish-comment"],
            Self::HustleTvShow => &["publish_comment", "publish-comment"],
        }
    }

    pub fn is_comment_event(self, event: &str) -> bool {
        self.comment_events().contains(&event)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentEvent {
    pub user_name: String,
    pub comment: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEvent {
    pub contestant_name: String,
    pub selected_option: String,
    pub timestamp: i64,
}

/// A viewer-originated event after decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerEvent {
    Comment(CommentEvent),
    Answer(AnswerEvent),
}

#[derive(Deserialize)]
struct CanonicalComment {
    user_name: String,
    comment: String,
}

#[derive(Deserialize)]
struct CanonicalAnswer {
    contestant_name: String,
    selected_option: String,
}

/// Decode a comment or answer from `message`.
///
/// Returns `None` for other events and for messages whose mandatory content
/// (comment text, selected option) is empty after every fallback.
pub fn decode_viewer_event(message: &InboundMessage, feed: FeedKind) -> Option<ViewerEvent> {
    let event = event_name(message)?;
    let data = event_data(&message.payload)?;

    if feed.is_comment_event(event) {
        return decode_comment(data).map(|(user_name, comment)| {
            ViewerEvent::Comment(CommentEvent {
                user_name,
                comment,
                timestamp: message.timestamp,
            })
        });
    }
    if ANSWER_EVENTS.contains(&event) {
        return decode_answer(data).map(|(contestant_name, selected_option)| {
            ViewerEvent::Answer(AnswerEvent {
                contestant_name,
                selected_option,
                timestamp: message.timestamp,
            })
        });
    }
    None
}

/// The message name, or `payload.event` when the name is absent or generic.
fn event_name(message: &InboundMessage) -> Option<&str> {
    match message.event.as_deref() {
        Some(name) if !name.is_empty() && name != DEFAULT_EVENT_NAME => Some(name),
        fallback => message
            .payload
            .get("event")
            .and_then(Value::as_str)
            .or(fallback),
    }
}

/// `payload.data`, `payload.payload` or the payload, then one more `data` level.
fn event_data(payload: &Value) -> Option<&Value> {
    let outer = non_null(payload.get("data"))
        .or_else(|| non_null(payload.get("payload")))
        .or_else(|| non_null(Some(payload)))?;
    non_null(outer.get("data")).or(Some(outer))
}

fn decode_comment(data: &Value) -> Option<(String, String)> {
    let candidate = match data.get("comment") {
        Some(nested @ Value::Object(_)) => nested,
        _ => data,
    };
    if let Ok(canonical) = CanonicalComment::deserialize(candidate) {
        if !canonical.comment.is_empty() {
            let name = if canonical.user_name.is_empty() {
                "Anonymous".to_string()
            } else {
                canonical.user_name
            };
            return Some((name, canonical.comment));
        }
    }

    // Legacy producers.
    let source = unwrap_payload(candidate)?.as_object()?;
    let user = ["user", "author", "profile"]
        .iter()
        .find_map(|k| source.get(*k).and_then(Value::as_object));
    let user_name = first_text(source, &["user_name", "contestant_name", "userName"])
        .or_else(|| user.and_then(|u| first_text(u, &["name", "full_name"])))
        .unwrap_or_else(|| "Anonymous".to_string());
    let comment = first_text(source, &["comment", "message", "text", "body", "content"])?;
    Some((user_name, comment))
}

fn decode_answer(data: &Value) -> Option<(String, String)> {
    if let Ok(canonical) = CanonicalAnswer::deserialize(data) {
        if !canonical.selected_option.is_empty() {
            return Some((canonical.contestant_name, canonical.selected_option));
        }
    }

    // Legacy producers.
    let source = data.as_object()?;
    let contestant_name = first_text(source, &["user_name", "contestant_name", "userName"])
        .unwrap_or_else(|| "Player".to_string());
    let selected_option = first_text(source, &["selected_option", "answer"])?;
    Some((contestant_name, selected_option))
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

/// First of `keys` holding a non-empty string, number or boolean.
fn first_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.get(*key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(event: Option<&str>, payload: Value) -> InboundMessage {
        InboundMessage {
            topic: "publish/comment/1".into(),
            event: event.map(str::to_string),
            payload,
            timestamp: 1_000,
        }
    }

    #[test]
    fn nested_comment_envelope_is_flattened() {
        let value = json!({"data": {"comment": {"user_name": "Bo", "comment": "hi"}}});
        assert_eq!(
            unwrap_payload(&value),
            Some(&json!({"user_name": "Bo", "comment": "hi"}))
        );
    }

    #[test]
    fn flat_objects_and_primitives_are_unchanged() {
        let flat = json!({"user_name": "Bo", "comment": "hi", "n": 3});
        assert_eq!(unwrap_payload(&flat), Some(&flat));
        let once = normalize(&json!({"payload": flat.clone()}));
        assert_eq!(normalize(&once), once);
        assert_eq!(unwrap_payload(&json!("text")), Some(&json!("text")));
        assert_eq!(unwrap_payload(&Value::Null), None);
    }

    #[test]
    fn arrays_yield_first_element() {
        assert_eq!(
            unwrap_payload(&json!([{"data": {"a": 1}}, {"b": 2}])),
            Some(&json!({"a": 1}))
        );
        assert_eq!(unwrap_payload(&json!([])), None);
    }

    #[test]
    fn comment_beats_data_beats_payload() {
        let value = json!({
            "payload": {"which": "payload"},
            "data": {"which": "data"},
            "comment": {"which": "comment"}
        });
        assert_eq!(unwrap_payload(&value), Some(&json!({"which": "comment"})));

        let value = json!({"payload": {"which": "payload"}, "data": {"which": "data"}});
        assert_eq!(unwrap_payload(&value), Some(&json!({"which": "data"})));
    }

    #[test]
    fn empty_envelope_falls_through_to_next_key() {
        let value = json!({"comment": [], "payload": {"x": 1}});
        assert_eq!(unwrap_payload(&value), Some(&json!({"x": 1})));
    }

    #[test]
    fn depth_is_bounded() {
        let mut value = json!({"leaf": true});
        for _ in 0..50 {
            value = json!({ "data": value });
        }
        let out = unwrap_payload(&value).unwrap();
        assert!(out.get("data").is_some());
    }

    #[test]
    fn canonical_comment_decodes() {
        let msg = message(
            Some("publish_quiz_comment"),
            json!({"data": {"user_name": "Ada", "comment": "go!"}}),
        );
        assert_eq!(
            decode_viewer_event(&msg, FeedKind::GoldenHour),
            Some(ViewerEvent::Comment(CommentEvent {
                user_name: "Ada".into(),
                comment: "go!".into(),
                timestamp: 1_000,
            }))
        );
        assert_eq!(decode_viewer_event(&msg, FeedKind::HustleTvShow), None);
    }

    #[test]
    fn legacy_comment_uses_fallback_chains() {
        let msg = message(
            None,
            json!({
                "event": "publish_comment",
                "payload": {"comment": [{"author": {"full_name": "Grace H"}, "text": "nice"}]}
            }),
        );
        assert_eq!(
            decode_viewer_event(&msg, FeedKind::HustleTvShow),
            Some(ViewerEvent::Comment(CommentEvent {
                user_name: "Grace H".into(),
                comment: "nice".into(),
                timestamp: 1_000,
            }))
        );
    }

    #[test]
    fn comment_without_text_is_discarded() {
        let msg = message(
            Some("publish-comment"),
            json!({"user_name": "Ada", "comment": ""}),
        );
        assert_eq!(decode_viewer_event(&msg, FeedKind::GoldenHour), None);
    }

    #[test]
    fn anonymous_when_no_name_found() {
        let msg = message(Some("publish-comment"), json!({"message": "hello"}));
        let Some(ViewerEvent::Comment(comment)) = decode_viewer_event(&msg, FeedKind::GoldenHour)
        else {
            panic!("expected comment");
        };
        assert_eq!(comment.user_name, "Anonymous");
        assert_eq!(comment.comment, "hello");
    }

    #[test]
    fn answers_decode_with_fallbacks() {
        let canonical = message(
            Some("quiz_selected_option"),
            json!({"contestant_name": "Lin", "selected_option": "b"}),
        );
        assert_eq!(
            decode_viewer_event(&canonical, FeedKind::GoldenHour),
            Some(ViewerEvent::Answer(AnswerEvent {
                contestant_name: "Lin".into(),
                selected_option: "b".into(),
                timestamp: 1_000,
            }))
        );

        let legacy = message(
            Some("message"),
            json!({"event": "player_selected_option", "data": {"userName": "Kay", "answer": "d"}}),
        );
        let Some(ViewerEvent::Answer(answer)) = decode_viewer_event(&legacy, FeedKind::GoldenHour)
        else {
            panic!("expected answer");
        };
        assert_eq!(answer.contestant_name, "Kay");
        assert_eq!(answer.selected_option, "d");

        let unnamed = message(Some("quiz_selected_option"), json!({"answer": "a"}));
        let Some(ViewerEvent::Answer(answer)) = decode_viewer_event(&unnamed, FeedKind::GoldenHour)
        else {
            panic!("expected answer");
        };
        assert_eq!(answer.contestant_name, "Player");

        let empty = message(Some("quiz_selected_option"), json!({"user_name": "Kay"}));
        assert_eq!(decode_viewer_event(&empty, FeedKind::GoldenHour), None);
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let msg = message(Some("timer_start"), json!({"seconds_allowed": 10}));
        assert_eq!(decode_viewer_event(&msg, FeedKind::GoldenHour), None);
        let nameless = message(None, json!({"comment": "hi"}));
        assert_eq!(decode_viewer_event(&nameless, FeedKind::GoldenHour), None);
    }
}
