//! Queued multi-topic sender.
//!
//! [`MultiSender::queue_multi_send`] never blocks: it appends to an in-memory
//! FIFO and returns an id. A background task drains the queue whenever the
//! connection is `Connected`, publishing every queued item to all of its
//! topics concurrently. Items leave the queue once every attempt for them has
//! resolved; failed topics are logged, not retried.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::connection::ConnectionState;
use crate::realtime::Realtime;

/// Identifier of a queued item, `queue_<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueId(String);

impl QueueId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
struct QueueItem {
    id: QueueId,
    message: serde_json::Value,
    topics: Vec<String>,
}

struct SenderInner {
    realtime: Arc<Realtime>,
    queue: Mutex<VecDeque<QueueItem>>,
    is_sending: AtomicBool,
    counter: AtomicU64,
    notify: Notify,
}

impl SenderInner {
    fn queue(&self) -> MutexGuard<'_, VecDeque<QueueItem>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Buffers broadcasts until the connection is up.
pub struct MultiSender {
    inner: Arc<SenderInner>,
    task: tokio::task::JoinHandle<()>,
}

impl MultiSender {
    /// Start the drain task. Must be called inside a Tokio runtime.
    pub fn new(realtime: Arc<Realtime>) -> Self {
        let inner = Arc::new(SenderInner {
            realtime,
            queue: Mutex::new(VecDeque::new()),
            is_sending: AtomicBool::new(false),
            counter: AtomicU64::new(0),
            notify: Notify::new(),
        });
        let task = tokio::spawn(drain_loop(Arc::clone(&inner)));
        Self { inner, task }
    }

    /// Queue `message` for every topic in `topics` and return immediately.
    pub fn queue_multi_send<I, S>(&self, message: serde_json::Value, topics: I) -> QueueId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let n = self.inner.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let id = QueueId(format!("queue_{n}"));
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        debug!(id = %id, topics = topics.len(), "queued multi-topic send");
        self.inner.queue().push_back(QueueItem {
            id: id.clone(),
            message,
            topics,
        });
        self.inner.notify.notify_one();
        id
    }

    /// Items still waiting (or being sent).
    pub fn queue_len(&self) -> usize {
        self.inner.queue().len()
    }

    /// Ids of queued items, oldest first.
    pub fn pending_ids(&self) -> Vec<QueueId> {
        self.inner.queue().iter().map(|i| i.id.clone()).collect()
    }

    /// `true` while a drain pass is running.
    pub fn is_sending(&self) -> bool {
        self.inner.is_sending.load(Ordering::Acquire)
    }
}

impl fmt::Debug for MultiSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiSender")
            .field("queued", &self.queue_len())
            .field("is_sending", &self.is_sending())
            .finish()
    }
}

impl Drop for MultiSender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn drain_loop(inner: Arc<SenderInner>) {
    let mut state_rx = inner.realtime.state_receiver();
    loop {
        let connected = *state_rx.borrow_and_update() == ConnectionState::Connected;
        if connected && !inner.queue().is_empty() {
            drain(&inner).await;
            continue;
        }
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    debug!("connection state channel closed, stopping sender");
                    break;
                }
            }
            _ = inner.notify.notified() => {}
        }
    }
}

/// One pass over everything queued when the pass starts.
async fn drain(inner: &SenderInner) {
    if inner.is_sending.swap(true, Ordering::AcqRel) {
        return;
    }
    let batch: Vec<QueueItem> = inner.queue().iter().cloned().collect();
    info!(items = batch.len(), "flushing queued sends");

    join_all(batch.into_iter().map(|item| async move {
        let results = inner
            .realtime
            .send_to_multiple_topics(&item.message, item.topics.as_slice())
            .await;
        for (topic, result) in item.topics.iter().zip(results) {
            if let Err(e) = result {
                warn!(id = %item.id, topic = %topic, error = %e, "queued send failed");
            }
        }
        inner.queue().retain(|queued| queued.id != item.id);
    }))
    .await;

    inner.is_sending.store(false, Ordering::Release);
}
