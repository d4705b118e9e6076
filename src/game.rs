//! Host-side game control.
//!
//! [`GameController`] drives one session's rounds: it asks the
//! [`QuizBackend`] to advance questions and open or close answer windows, and
//! announces each transition on the session topic through an [`EventSink`].
//!
//! ```text
//! send_next_question ─▶ start_timer ─▶ (countdown | end_timer | manual_tally)
//!        ▲                                   │ settlement: elapse, tally,
//!        │                                   │ timer_end, leaderboard_update
//!        └───────────────────────────────────┘
//! end_quiz: terminal from any phase
//! ```
//!
//! Round transitions (sending a question, opening the answer window,
//! settlement, ending the quiz) never overlap. The countdown expiring and an
//! operator triggering [`GameController::end_timer`] may race; the loser gets
//! [`Settlement::AlreadyInProgress`]. Operator actions that find a transition
//! in flight get [`QuizcastError::Busy`]. `timer_end` is always awaited before
//! `leaderboard_update` is sent, and nothing follows `quiz_session_end`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::activity::{ActivityEntry, ActivityLog};
use crate::backend::{NextQuestion, Question, QuizBackend, QuizEndResult, TallyResult};
use crate::error::{QuizcastError, Result};
use crate::events::{CorrectOption, EventSink, HostEvent};
use crate::message::now_millis;
use crate::round::{GamePhase, GameRound, TimerPhase};
use crate::timer::{with_timeout, CountdownTimer};
use crate::topics::session_topic;

// ── Configuration ───────────────────────────────────────────────────

/// Default answer window.
pub const DEFAULT_QUESTION_DURATION: Duration = Duration::from_secs(10);

/// Default countdown tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default bound on the "elapse question time" call during settlement.
pub const DEFAULT_ELAPSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default activity log capacity.
pub const DEFAULT_ACTIVITY_LOG_CAPACITY: usize = 30;

/// Configuration for a [`GameController`].
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Length of each answer window. Announced to viewers in whole seconds.
    pub question_duration: Duration,
    /// Countdown tick; one tick is one announced second.
    pub tick_interval: Duration,
    /// Upper bound on the elapse call before settlement proceeds without it.
    pub elapse_timeout: Duration,
    pub activity_log_capacity: usize,
}

impl GameConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_question_duration(mut self, duration: Duration) -> Self {
        self.question_duration = duration;
        self
    }

    #[must_use]
    pub fn with_tick_interval(mut self, tick: Duration) -> Self {
        self.tick_interval = tick;
        self
    }

    #[must_use]
    pub fn with_elapse_timeout(mut self, timeout: Duration) -> Self {
        self.elapse_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_activity_log_capacity(mut self, capacity: usize) -> Self {
        self.activity_log_capacity = capacity;
        self
    }

    /// Answer window in whole seconds, as announced by `timer_start`.
    pub fn seconds_allowed(&self) -> u32 {
        u32::try_from(self.question_duration.as_secs()).unwrap_or(u32::MAX)
    }
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            question_duration: DEFAULT_QUESTION_DURATION,
            tick_interval: DEFAULT_TICK_INTERVAL,
            elapse_timeout: DEFAULT_ELAPSE_TIMEOUT,
            activity_log_capacity: DEFAULT_ACTIVITY_LOG_CAPACITY,
        }
    }
}

// ── Outcomes ────────────────────────────────────────────────────────

/// Result of an end-of-timer settlement.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Tally fetched and broadcast.
    Completed(TallyResult),
    /// Another round transition was already running; nothing was done.
    AlreadyInProgress,
    /// No question is waiting to be settled.
    NothingToSettle,
}

/// Result of [`GameController::start_timer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TimerStart {
    /// The answer window opened and the countdown is running.
    Started { seconds_allowed: u32 },
    /// The backend refused to open the window; the round was settled
    /// immediately instead.
    Fallback(Settlement),
}

/// What the control surface renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundSnapshot {
    pub phase: GamePhase,
    pub question: Option<Question>,
    pub question_index: u32,
    pub timer_phase: TimerPhase,
    /// Epoch milliseconds at which the running countdown expires.
    pub timer_deadline: Option<i64>,
    pub remaining_seconds: u32,
    pub correct_option: Option<String>,
    pub tally: Option<TallyResult>,
}

// ── Controller ──────────────────────────────────────────────────────

/// Resets its flag when dropped, so early returns and cancellation release it.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    session_id: String,
    topic: String,
    backend: Arc<dyn QuizBackend>,
    sink: Arc<dyn EventSink>,
    config: GameConfig,
    round: Mutex<GameRound>,
    countdown: Mutex<Option<CountdownTimer>>,
    /// Set while an operator action (other than settlement) is in flight.
    busy: AtomicBool,
    /// Set while the round state is being moved: question dispatch, opening
    /// the answer window, settlement or ending the quiz.
    transition: AtomicBool,
    activity: ActivityLog,
}

impl Inner {
    fn round(&self) -> MutexGuard<'_, GameRound> {
        self.round.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn countdown(&self) -> MutexGuard<'_, Option<CountdownTimer>> {
        self.countdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire_busy(&self) -> Result<FlagGuard<'_>> {
        FlagGuard::acquire(&self.busy).ok_or(QuizcastError::Busy)
    }

    fn acquire_transition(&self) -> Result<FlagGuard<'_>> {
        FlagGuard::acquire(&self.transition).ok_or(QuizcastError::Busy)
    }

    fn cancel_countdown(&self) {
        if let Some(mut timer) = self.countdown().take() {
            if timer.cancel() {
                debug!(session_id = %self.session_id, "countdown cancelled");
            }
        }
    }

    /// Publish on the session topic. Failures are logged, never returned.
    async fn publish(&self, event: HostEvent) {
        match self.sink.publish_event(&self.topic, &event).await {
            Ok(()) => debug!(topic = %self.topic, event = event.name(), "published"),
            Err(e) => self
                .activity
                .error(format!("failed to publish {}: {e}", event.name())),
        }
    }
}

/// Orchestrates the rounds of one quiz session.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct GameController {
    inner: Arc<Inner>,
}

impl GameController {
    pub fn new(
        session_id: impl Into<String>,
        backend: Arc<dyn QuizBackend>,
        sink: Arc<dyn EventSink>,
        config: GameConfig,
    ) -> Self {
        let session_id = session_id.into();
        let topic = session_topic(&session_id);
        let activity = ActivityLog::new(config.activity_log_capacity);
        Self {
            inner: Arc::new(Inner {
                session_id,
                topic,
                backend,
                sink,
                config,
                round: Mutex::new(GameRound::default()),
                countdown: Mutex::new(None),
                busy: AtomicBool::new(false),
                transition: AtomicBool::new(false),
                activity,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Topic host events are published on.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn config(&self) -> &GameConfig {
        &self.inner.config
    }

    /// Start the host session and return the realtime token, if the backend
    /// issued one.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::Busy`] if another action is in flight, or the
    /// backend's error.
    pub async fn start_session(&self) -> Result<Option<String>> {
        let inner = &self.inner;
        let _busy = inner.acquire_busy()?;
        match inner.backend.start_session(&inner.session_id).await {
            Ok(start) => {
                if start.token.is_none() {
                    inner
                        .activity
                        .degraded("session started without a realtime token");
                } else {
                    inner.activity.info(format!(
                        "session {} started",
                        start.session_id.as_deref().unwrap_or(&inner.session_id)
                    ));
                }
                Ok(start.token)
            }
            Err(e) => {
                inner.activity.error(format!("failed to start session: {e}"));
                Err(e)
            }
        }
    }

    /// # Errors
    ///
    /// [`QuizcastError::Rejected`] once the session has ended,
    /// [`QuizcastError::Busy`], or the backend's error.
    pub async fn start_quiz(&self) -> Result<()> {
        let inner = &self.inner;
        let _busy = inner.acquire_busy()?;
        self.reject_if_ended("start quiz")?;
        match inner.backend.start_quiz(&inner.session_id).await {
            Ok(()) => {
                inner.activity.info("quiz started");
                Ok(())
            }
            Err(e) => {
                inner.activity.error(format!("failed to start quiz: {e}"));
                Err(e)
            }
        }
    }

    /// Advance to the next question and publish `quest`.
    ///
    /// Rejected without calling the backend while the answer window is open,
    /// while another transition is running, or after the session ended.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::Rejected`], [`QuizcastError::Busy`], or the backend's
    /// error (round state unchanged).
    pub async fn send_next_question(&self) -> Result<NextQuestion> {
        let inner = &self.inner;
        let _busy = inner.acquire_busy()?;
        let _transition = inner.acquire_transition()?;
        {
            let round = inner.round();
            if matches!(round.phase, GamePhase::TimerRunning | GamePhase::SessionEnded) {
                return Err(QuizcastError::Rejected {
                    action: "send next question",
                    phase: round.phase,
                });
            }
        }

        let next = match inner.backend.advance_question(&inner.session_id).await {
            Ok(next) => next,
            Err(e) => {
                inner
                    .activity
                    .error(format!("failed to advance question: {e}"));
                return Err(e);
            }
        };

        inner
            .round()
            .begin_question(next.question.clone(), next.question_index);
        inner.activity.info(format!(
            "question {} sent (id {})",
            next.question_index, next.question.question_id
        ));
        inner
            .publish(HostEvent::Question {
                question: next.question.clone(),
                question_index: next.question_index,
            })
            .await;
        Ok(next)
    }

    /// Open the answer window, publish `timer_start` and start the countdown.
    ///
    /// If the backend refuses to open the window the round is settled right
    /// away and the fallback is recorded as degraded.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::Rejected`] unless a question was just sent,
    /// [`QuizcastError::Busy`], or a settlement error on the fallback path.
    pub async fn start_timer(&self) -> Result<TimerStart> {
        let inner = &self.inner;
        let _busy = inner.acquire_busy()?;
        let transition = inner.acquire_transition()?;
        let question_id = {
            let round = inner.round();
            match (round.phase, round.question_id()) {
                (GamePhase::QuestionSent, Some(id)) => id,
                (phase, _) => {
                    return Err(QuizcastError::Rejected {
                        action: "start timer",
                        phase,
                    })
                }
            }
        };

        if let Err(e) = inner.backend.start_question_time(question_id).await {
            inner.activity.degraded(format!(
                "start timer failed for question {question_id} ({e}); settling immediately"
            ));
            drop(transition);
            let settlement = self.end_timer().await?;
            return Ok(TimerStart::Fallback(settlement));
        }

        let seconds_allowed = inner.config.seconds_allowed();
        inner
            .publish(HostEvent::TimerStart { seconds_allowed })
            .await;

        // Deadline and countdown start together, once viewers have the window.
        let window_ms =
            i64::try_from(inner.config.question_duration.as_millis()).unwrap_or(i64::MAX);
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_expire = move || async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Errors are already in the activity log.
            let _ = GameController { inner }
                .settle(Some(question_id))
                .await;
        };
        {
            let mut round = inner.round();
            round.start_timer(now_millis().saturating_add(window_ms));
            *inner.countdown() =
                Some(CountdownTimer::start(seconds_allowed, inner.config.tick_interval, on_expire));
        }
        drop(transition);
        inner
            .activity
            .info(format!("timer started for question {question_id}"));

        Ok(TimerStart::Started { seconds_allowed })
    }

    /// Close the answer window and broadcast the tally.
    ///
    /// Cancels the countdown, calls "elapse question time" bounded by the
    /// configured timeout (continuing on timeout or failure), fetches the
    /// tally, then publishes `timer_end` followed by `leaderboard_update`.
    ///
    /// # Errors
    ///
    /// The backend's error if the tally cannot be fetched. The round stays in
    /// [`GamePhase::TimerElapsed`] and [`GameController::manual_tally`] can
    /// retry.
    pub async fn end_timer(&self) -> Result<Settlement> {
        self.settle(None).await
    }

    /// Settlement of the current question, or only of `expected` when given.
    async fn settle(&self, expected: Option<i64>) -> Result<Settlement> {
        let inner = &self.inner;
        let Some(_transition) = FlagGuard::acquire(&inner.transition) else {
            debug!(session_id = %inner.session_id, "round transition already in progress");
            return Ok(Settlement::AlreadyInProgress);
        };

        let (question_id, fallback_correct) = {
            let mut round = inner.round();
            let settleable = matches!(
                round.phase,
                GamePhase::QuestionSent | GamePhase::TimerRunning | GamePhase::TimerElapsed
            );
            match round.question_id() {
                Some(id) if expected.is_some_and(|e| e != id) => {
                    debug!(question_id = id, "stale countdown expiry ignored");
                    return Ok(Settlement::NothingToSettle);
                }
                Some(id) if settleable => {
                    round.elapse_timer();
                    let correct = round
                        .current_question
                        .as_ref()
                        .and_then(|q| q.correct_option.clone());
                    (id, correct)
                }
                _ => return Ok(Settlement::NothingToSettle),
            }
        };
        inner.cancel_countdown();

        match with_timeout(
            inner.config.elapse_timeout,
            inner.backend.elapse_question_time(question_id),
        )
        .await
        {
            Ok(()) => debug!(question_id, "answer window closed"),
            Err(QuizcastError::Timeout) => inner.activity.degraded(format!(
                "closing question {question_id} timed out; fetching tally anyway"
            )),
            Err(e) => inner.activity.error(format!(
                "failed to close question {question_id}: {e}; fetching tally anyway"
            )),
        }

        let tally = self.fetch_tally(question_id).await?;
        let correct_option = tally
            .correct_answer()
            .or_else(|| fallback_correct.map(|c| c.trim().to_uppercase()));

        inner
            .publish(HostEvent::TimerEnd {
                question: CorrectOption {
                    correct_option: correct_option.clone(),
                },
            })
            .await;
        inner
            .publish(HostEvent::LeaderboardUpdate(tally.clone()))
            .await;

        inner.round().record_tally(tally.clone(), correct_option);
        inner.activity.info(format!(
            "question {question_id} settled with {} answers",
            tally.results.len()
        ));
        Ok(Settlement::Completed(tally))
    }

    /// Re-fetch and re-broadcast the tally.
    ///
    /// If the answer window is still open (or a previous settlement never
    /// reached the tally) this runs the full [`end_timer`](Self::end_timer)
    /// settlement. After a completed settlement only `leaderboard_update` is
    /// sent again.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::Rejected`] when there is no question, or the
    /// backend's error.
    pub async fn manual_tally(&self) -> Result<Settlement> {
        let inner = &self.inner;
        let phase = inner.round().phase;
        match phase {
            GamePhase::QuestionSent | GamePhase::TimerRunning | GamePhase::TimerElapsed => {
                self.end_timer().await
            }
            GamePhase::TallyReady => {
                let Some(_transition) = FlagGuard::acquire(&inner.transition) else {
                    return Ok(Settlement::AlreadyInProgress);
                };
                // Re-read under the guard: a question may have been sent since.
                let question_id = {
                    let round = inner.round();
                    match (round.phase, round.question_id()) {
                        (GamePhase::TallyReady, Some(id)) => id,
                        _ => return Ok(Settlement::NothingToSettle),
                    }
                };
                let tally = self.fetch_tally(question_id).await?;
                inner
                    .publish(HostEvent::LeaderboardUpdate(tally.clone()))
                    .await;
                let correct = tally.correct_answer();
                inner.round().record_tally(tally.clone(), correct);
                inner
                    .activity
                    .info(format!("tally for question {question_id} resent"));
                Ok(Settlement::Completed(tally))
            }
            GamePhase::NoQuestion | GamePhase::SessionEnded => Err(QuizcastError::Rejected {
                action: "manual tally",
                phase,
            }),
        }
    }

    /// Publish `quiz_session_end`, end the quiz on the backend and enter the
    /// terminal phase.
    ///
    /// The round is terminal even if the backend call fails.
    ///
    /// # Errors
    ///
    /// [`QuizcastError::Rejected`] if already ended, [`QuizcastError::Busy`]
    /// while another action or a settlement is in flight, or the backend's
    /// error.
    pub async fn end_quiz(&self) -> Result<Vec<QuizEndResult>> {
        let inner = &self.inner;
        let _busy = inner.acquire_busy()?;
        let _transition = inner.acquire_transition()?;
        self.reject_if_ended("end quiz")?;
        inner.cancel_countdown();

        inner.publish(HostEvent::QuizSessionEnd {}).await;
        inner.round().end();

        match inner.backend.end_quiz(&inner.session_id).await {
            Ok(results) => {
                inner
                    .activity
                    .info(format!("quiz ended with {} result rows", results.len()));
                Ok(results)
            }
            Err(e) => {
                inner.activity.error(format!("failed to end quiz: {e}"));
                Err(e)
            }
        }
    }

    /// Current round state.
    pub fn snapshot(&self) -> RoundSnapshot {
        let remaining_seconds = self.remaining_seconds();
        let round = self.inner.round();
        RoundSnapshot {
            phase: round.phase,
            question: round.current_question.clone(),
            question_index: round.question_index,
            timer_phase: round.timer_phase,
            timer_deadline: round.timer_deadline,
            remaining_seconds,
            correct_option: round.correct_option.clone(),
            tally: round.tally.clone(),
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.inner.round().phase
    }

    /// Seconds left on the running countdown, or 0.
    pub fn remaining_seconds(&self) -> u32 {
        self.inner
            .countdown()
            .as_ref()
            .filter(|t| t.is_active())
            .map_or(0, CountdownTimer::remaining)
    }

    /// `true` while an action or round transition is in flight.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire) || self.inner.transition.load(Ordering::Acquire)
    }

    /// Activity entries, newest first.
    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.inner.activity.entries()
    }

    /// Cancel the countdown. Call when the control surface goes away.
    pub fn shutdown(&self) {
        self.inner.cancel_countdown();
        info!(session_id = %self.inner.session_id, "game controller shut down");
    }

    fn reject_if_ended(&self, action: &'static str) -> Result<()> {
        let phase = self.inner.round().phase;
        if phase == GamePhase::SessionEnded {
            return Err(QuizcastError::Rejected { action, phase });
        }
        Ok(())
    }

    async fn fetch_tally(&self, question_id: i64) -> Result<TallyResult> {
        self.inner
            .backend
            .question_tally(question_id)
            .await
            .inspect_err(|e| {
                self.inner
                    .activity
                    .error(format!("failed to fetch tally for question {question_id}: {e}"));
            })
    }
}

impl std::fmt::Debug for GameController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameController")
            .field("session_id", &self.inner.session_id)
            .field("phase", &self.phase())
            .field("busy", &self.is_busy())
            .finish()
    }
}
