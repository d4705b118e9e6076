//! Per-session round state owned by the game controller.

use serde::{Deserialize, Serialize};

use crate::backend::{Question, TallyResult};

/// Countdown state of the current question.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerPhase {
    #[default]
    Idle,
    Running,
    Elapsed,
}

/// Phase of the host-side game state machine.
///
/// ```text
/// NoQuestion ─▶ QuestionSent ─▶ TimerRunning ─▶ TimerElapsed ─▶ TallyReady
///                    ▲                                              │
///                    └──────────────────────────────────────────────┘
/// any phase ─▶ SessionEnded (terminal)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GamePhase {
    #[default]
    NoQuestion,
    QuestionSent,
    TimerRunning,
    /// The answer window is closed but the tally has not been published yet.
    TimerElapsed,
    TallyReady,
    SessionEnded,
}

/// Mutable state of the round in progress.
#[derive(Debug, Clone, Default)]
pub struct GameRound {
    pub phase: GamePhase,
    pub current_question: Option<Question>,
    pub question_index: u32,
    pub timer_phase: TimerPhase,
    /// Epoch milliseconds at which the running countdown expires.
    pub timer_deadline: Option<i64>,
    pub tally: Option<TallyResult>,
    pub correct_option: Option<String>,
}

impl GameRound {
    /// Replace the current question and reset per-question state.
    pub fn begin_question(&mut self, question: Question, index: u32) {
        self.current_question = Some(question);
        self.question_index = index;
        self.timer_phase = TimerPhase::Idle;
        self.timer_deadline = None;
        self.tally = None;
        self.correct_option = None;
        self.phase = GamePhase::QuestionSent;
    }

    pub fn start_timer(&mut self, deadline: i64) {
        self.timer_phase = TimerPhase::Running;
        self.timer_deadline = Some(deadline);
        self.phase = GamePhase::TimerRunning;
    }

    /// Close the answer window.
    pub fn elapse_timer(&mut self) {
        self.timer_phase = TimerPhase::Elapsed;
        self.timer_deadline = None;
        self.phase = GamePhase::TimerElapsed;
    }

    pub fn record_tally(&mut self, tally: TallyResult, correct_option: Option<String>) {
        self.tally = Some(tally);
        if correct_option.is_some() {
            self.correct_option = correct_option;
        }
        self.phase = GamePhase::TallyReady;
    }

    /// Discard all round state and enter the terminal phase.
    pub fn end(&mut self) {
        *self = Self {
            phase: GamePhase::SessionEnded,
            ..Self::default()
        };
    }

    pub fn is_ended(&self) -> bool {
        self.phase == GamePhase::SessionEnded
    }

    pub fn question_id(&self) -> Option<i64> {
        self.current_question.as_ref().map(|q| q.question_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: i64) -> Question {
        Question {
            question_id: id,
            question: format!("Question {id}"),
            ..Question::default()
        }
    }

    #[test]
    fn begin_question_resets_timer_and_tally() {
        let mut round = GameRound::default();
        round.begin_question(question(1), 0);
        round.start_timer(1_000);
        round.elapse_timer();
        round.record_tally(TallyResult::default(), Some("B".into()));

        round.begin_question(question(2), 1);
        assert_eq!(round.phase, GamePhase::QuestionSent);
        assert_eq!(round.timer_phase, TimerPhase::Idle);
        assert!(round.tally.is_none());
        assert!(round.correct_option.is_none());
        assert_eq!(round.question_id(), Some(2));
    }

    #[test]
    fn end_clears_round_and_is_terminal() {
        let mut round = GameRound::default();
        round.begin_question(question(3), 4);
        round.end();
        assert!(round.is_ended());
        assert!(round.current_question.is_none());
        assert_eq!(round.question_index, 0);
    }
}
