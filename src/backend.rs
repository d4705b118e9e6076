//! The quiz REST backend as seen by the game controller.
//!
//! The backend owns authoritative quiz state; the controller only asks it to
//! advance questions, open and close answer windows, and report tallies. The
//! [`QuizBackend`] trait is the seam: [`HttpQuizBackend`](crate::backends::http::HttpQuizBackend)
//! talks to the real service, tests plug in scripted implementations.

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Result;

// ── Payloads ────────────────────────────────────────────────────────

/// A quiz question as returned by "advance question".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Question {
    pub question_id: i64,
    pub question: String,
    pub option_a: String,
    pub option_b: String,
    pub option_c: String,
    pub option_d: String,
    pub correct_option: Option<String>,
    pub category: Option<String>,
}

/// Response of "advance question".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextQuestion {
    pub question: Question,
    pub question_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyQuestion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question_id: Option<i64>,
    pub correct_option: Option<String>,
}

/// One player's answer in a tally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyEntry {
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    /// Seconds the player took to answer.
    pub answered_in: Option<f64>,
    pub is_correct: bool,
    pub is_winner: bool,
    pub answer: Option<String>,
}

/// Aggregated answers for one question.
///
/// Published verbatim as the `leaderboard_update` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyResult {
    pub question: TallyQuestion,
    pub results: Vec<TallyEntry>,
}

impl TallyResult {
    /// Entries ordered winners first, then correct answers, then by answer
    /// time (missing times last).
    pub fn ranked(&self) -> Vec<&TallyEntry> {
        let mut ranked: Vec<&TallyEntry> = self.results.iter().collect();
        ranked.sort_by(|a, b| {
            b.is_winner
                .cmp(&a.is_winner)
                .then(b.is_correct.cmp(&a.is_correct))
                .then_with(|| {
                    let a_time = a.answered_in.unwrap_or(f64::INFINITY);
                    let b_time = b.answered_in.unwrap_or(f64::INFINITY);
                    a_time.total_cmp(&b_time)
                })
        });
        ranked
    }

    pub fn winner(&self) -> Option<&TallyEntry> {
        self.results.iter().find(|e| e.is_winner)
    }

    /// The correct option, upper-cased.
    ///
    /// Falls back to the answer of the first correct entry when the question
    /// carries no correct option.
    pub fn correct_answer(&self) -> Option<String> {
        self.question
            .correct_option
            .as_deref()
            .filter(|o| !o.trim().is_empty())
            .or_else(|| {
                self.results
                    .iter()
                    .find(|e| e.is_correct)
                    .and_then(|e| e.answer.as_deref())
                    .filter(|a| !a.trim().is_empty())
            })
            .map(|o| o.trim().to_uppercase())
    }
}

/// Response of "start session".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStart {
    /// Backend session id, when reported.
    pub session_id: Option<String>,
    /// Realtime token for [`Realtime::connect`](crate::Realtime::connect).
    pub token: Option<String>,
}

impl<'de> Deserialize<'de> for SessionStart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct ConnectData {
            token: Option<String>,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct GameData {
            #[serde(deserialize_with = "string_or_number")]
            session_id: Option<String>,
        }
        #[derive(Deserialize, Default)]
        #[serde(default)]
        struct Wire {
            #[serde(alias = "realtime_connect_data")]
            ably_connect_data: ConnectData,
            game_data: GameData,
        }

        let wire = Wire::deserialize(deserializer)?;
        Ok(Self {
            session_id: wire.game_data.session_id,
            token: wire.ably_connect_data.token.filter(|t| !t.is_empty()),
        })
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<String>, D::Error> {
    Ok(
        match Option::<serde_json::Value>::deserialize(deserializer)? {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
    )
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizEndQuestion {
    pub correct_answer: Option<String>,
    pub assigned_index: Option<u32>,
    pub won: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizEndUser {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub answered_in: Option<f64>,
}

/// Per-question outcome reported by "end quiz".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuizEndResult {
    pub question: QuizEndQuestion,
    pub user: Option<QuizEndUser>,
}

// ── Trait ───────────────────────────────────────────────────────────

/// REST actions the game controller depends on.
#[async_trait]
pub trait QuizBackend: Send + Sync + 'static {
    /// Start the host session and obtain the realtime token.
    async fn start_session(&self, session_id: &str) -> Result<SessionStart>;

    async fn start_quiz(&self, session_id: &str) -> Result<()>;

    /// Advance the session to its next question.
    async fn advance_question(&self, session_id: &str) -> Result<NextQuestion>;

    /// Open the answer window for a question.
    async fn start_question_time(&self, question_id: i64) -> Result<()>;

    /// Close the answer window for a question.
    async fn elapse_question_time(&self, question_id: i64) -> Result<()>;

    async fn question_tally(&self, question_id: i64) -> Result<TallyResult>;

    async fn end_quiz(&self, session_id: &str) -> Result<Vec<QuizEndResult>>;
}
