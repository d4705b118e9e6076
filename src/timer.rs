//! Cancellable countdown and timeout composition.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::error::{QuizcastError, Result};

/// Race `fut` against `duration`.
///
/// # Errors
///
/// Returns [`QuizcastError::Timeout`] if the deadline elapses first, otherwise
/// whatever `fut` returns.
pub async fn with_timeout<T, F>(duration: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| QuizcastError::Timeout)?
}

/// A countdown that ticks once per `tick` and runs a callback when it
/// reaches zero.
///
/// The expiry callback runs in its own task, so cancelling the countdown
/// after it has fired never interrupts the callback. Dropping the handle
/// cancels the countdown.
#[derive(Debug)]
pub struct CountdownTimer {
    active: Arc<AtomicBool>,
    remaining_rx: watch::Receiver<u32>,
    task: Option<JoinHandle<()>>,
}

impl CountdownTimer {
    /// Start counting down from `seconds`.
    pub fn start<F, Fut>(seconds: u32, tick: Duration, on_expire: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let (remaining_tx, remaining_rx) = watch::channel(seconds);

        let task_active = Arc::clone(&active);
        let task = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + tick, tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut remaining = seconds;
            while remaining > 0 {
                interval.tick().await;
                remaining -= 1;
                remaining_tx.send_replace(remaining);
            }
            if task_active.swap(false, Ordering::AcqRel) {
                debug!("countdown expired");
                tokio::spawn(on_expire());
            }
        });

        Self {
            active,
            remaining_rx,
            task: Some(task),
        }
    }

    /// Stop the countdown without running the expiry callback.
    ///
    /// Returns `true` if the countdown was still running.
    pub fn cancel(&mut self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        was_active
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Whole ticks left.
    pub fn remaining(&self) -> u32 {
        *self.remaining_rx.borrow()
    }

    /// Observe the remaining ticks as they count down.
    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.remaining_rx.clone()
    }
}

impl Drop for CountdownTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
