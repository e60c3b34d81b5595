use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::state_db::{DocPair, StateDb, StateDbError, now_ms};
use crate::config::ConfigHandle;
use crate::events::{EngineEvent, EventSender, QueueProgress};

const FEED_INTERVAL: Duration = Duration::from_secs(1);
const ERROR_DELAYS: [Duration; 3] = [
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
    Duration::from_secs(60 * 60),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    LocalFolder,
    LocalFile,
    RemoteFolder,
    RemoteFile,
}

impl QueueKind {
    pub fn route(pair: &DocPair) -> Self {
        match (pair.pair_state.is_local_side(), pair.folderish) {
            (true, true) => QueueKind::LocalFolder,
            (true, false) => QueueKind::LocalFile,
            (false, true) => QueueKind::RemoteFolder,
            (false, false) => QueueKind::RemoteFile,
        }
    }
}

/// Sort key: creations by ascending depth, then deletions by descending depth.
pub type QueueKey = (i64, i64, i64);

pub fn queue_key(pair: &DocPair) -> QueueKey {
    if pair.pair_state.is_delete() {
        (1, -pair.depth(), pair.id)
    } else {
        (0, pair.depth(), pair.id)
    }
}

/// Delay before an errored row is retried. Rows below `max_errors` are
/// retried on the next feed.
pub fn retry_delay(error_count: u32, max_errors: u32) -> Option<Duration> {
    if error_count < max_errors {
        return None;
    }
    let idx = (error_count - max_errors) as usize;
    Some(ERROR_DELAYS[idx.min(ERROR_DELAYS.len() - 1)])
}

/// True once a row has been retried at every backoff step.
pub fn backoff_exhausted(error_count: u32, max_errors: u32) -> bool {
    error_count >= max_errors.saturating_add(ERROR_DELAYS.len() as u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Duplicate,
    Full,
}

#[derive(Default)]
struct QueueState {
    items: BTreeSet<QueueKey>,
    keys: HashMap<i64, QueueKey>,
}

/// Bounded, de-duplicated queue of row ids.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_push(&self, id: i64, key: QueueKey) -> PushOutcome {
        let mut state = self.lock();
        if state.keys.contains_key(&id) {
            return PushOutcome::Duplicate;
        }
        if state.items.len() >= self.capacity {
            return PushOutcome::Full;
        }
        state.items.insert(key);
        state.keys.insert(id, key);
        drop(state);
        self.not_empty.notify_one();
        PushOutcome::Queued
    }

    /// Waits for room when the queue is full. Returns `Full` only when cancelled.
    pub async fn push(&self, id: i64, key: QueueKey, cancel: &CancellationToken) -> PushOutcome {
        loop {
            match self.try_push(id, key) {
                PushOutcome::Full => {}
                outcome => return outcome,
            }
            tokio::select! {
                _ = cancel.cancelled() => return PushOutcome::Full,
                _ = self.not_full.notified() => {}
            }
        }
    }

    pub fn try_pop(&self) -> Option<i64> {
        let mut state = self.lock();
        let key = state.items.pop_first()?;
        let id = key.2;
        state.keys.remove(&id);
        drop(state);
        self.not_full.notify_one();
        Some(id)
    }

    pub async fn pop(&self, cancel: &CancellationToken) -> Option<i64> {
        loop {
            if let Some(id) = self.try_pop() {
                return Some(id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.not_empty.notified() => {}
            }
        }
    }

    pub fn remove(&self, id: i64) -> bool {
        let mut state = self.lock();
        match state.keys.remove(&id) {
            Some(key) => {
                state.items.remove(&key);
                drop(state);
                self.not_full.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().keys.contains_key(&id)
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.items.clear();
        state.keys.clear();
        drop(state);
        self.not_full.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Feeds dirty rows from the state store into the four work queues and
/// holds rows that exhausted their retries until their delay expires.
pub struct QueueManager {
    engine: String,
    db: StateDb,
    config: ConfigHandle,
    events: EventSender,
    local_folder: WorkQueue,
    local_file: WorkQueue,
    remote_folder: WorkQueue,
    remote_file: WorkQueue,
    in_flight: Mutex<HashSet<i64>>,
    errors_waiting: AtomicUsize,
    wake: Arc<Notify>,
    saturated: Arc<AtomicBool>,
    last_progress: Mutex<QueueProgress>,
}

impl QueueManager {
    pub fn new(engine: impl Into<String>, db: StateDb, config: ConfigHandle, events: EventSender) -> Self {
        let capacity = config.snapshot().queue_capacity;
        Self {
            engine: engine.into(),
            db,
            config,
            events,
            local_folder: WorkQueue::new(capacity),
            local_file: WorkQueue::new(capacity),
            remote_folder: WorkQueue::new(capacity),
            remote_file: WorkQueue::new(capacity),
            in_flight: Mutex::new(HashSet::new()),
            errors_waiting: AtomicUsize::new(0),
            wake: Arc::new(Notify::new()),
            saturated: Arc::new(AtomicBool::new(false)),
            last_progress: Mutex::new(QueueProgress::default()),
        }
    }

    /// Signalled by watchers whenever they write dirty rows.
    pub fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    /// Set while any queue is at capacity; the local watcher then coalesces harder.
    pub fn saturation_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.saturated)
    }

    pub fn queue(&self, kind: QueueKind) -> &WorkQueue {
        match kind {
            QueueKind::LocalFolder => &self.local_folder,
            QueueKind::LocalFile => &self.local_file,
            QueueKind::RemoteFolder => &self.remote_folder,
            QueueKind::RemoteFile => &self.remote_file,
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run_feeder(&self, cancel: CancellationToken) {
        loop {
            if let Err(err) = self.feed_once(&cancel).await {
                warn!(engine = %self.engine, error = %err, "queue feed failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(FEED_INTERVAL) => {}
            }
        }
        debug!(engine = %self.engine, "queue feeder stopped");
    }

    /// One pass over the store. Returns how many rows were queued.
    pub async fn feed_once(&self, cancel: &CancellationToken) -> Result<usize, StateDbError> {
        let config = self.config.snapshot();
        let now = now_ms();
        let limit = (config.queue_capacity * 4) as i64;
        let mut queued = 0;

        for pair in self.db.dirty_rows(config.max_errors, now, limit).await? {
            if self.enqueue(&pair, cancel).await? {
                queued += 1;
            }
            if cancel.is_cancelled() {
                return Ok(queued);
            }
        }

        let errored = self.db.errored_rows(config.max_errors).await?;
        self.errors_waiting.store(errored.len(), Ordering::Relaxed);
        for pair in errored {
            let due = pair.retry_after.is_none_or(|at| at <= now);
            if due && pair.processor == 0 && self.enqueue(&pair, cancel).await? {
                debug!(engine = %self.engine, id = pair.id, errors = pair.error_count, "retrying errored row");
                queued += 1;
            }
        }

        self.update_saturation();
        self.publish_progress();
        Ok(queued)
    }

    async fn enqueue(&self, pair: &DocPair, cancel: &CancellationToken) -> Result<bool, StateDbError> {
        if self.in_flight().contains(&pair.id) {
            return Ok(false);
        }
        let queue = self.queue(QueueKind::route(pair));
        let mut outcome = queue.try_push(pair.id, queue_key(pair));
        if outcome == PushOutcome::Full {
            self.saturated.store(true, Ordering::Relaxed);
            self.publish_progress();
            outcome = queue.push(pair.id, queue_key(pair), cancel).await;
        }
        Ok(outcome == PushOutcome::Queued)
    }

    fn update_saturation(&self) {
        let queues = [
            &self.local_folder,
            &self.local_file,
            &self.remote_folder,
            &self.remote_file,
        ];
        if queues.iter().any(|q| q.len() >= q.capacity()) {
            self.saturated.store(true, Ordering::Relaxed);
        } else if queues.iter().all(|q| q.len() <= q.capacity() / 2) {
            self.saturated.store(false, Ordering::Relaxed);
        }
    }

    pub async fn pop(&self, kind: QueueKind, cancel: &CancellationToken) -> Option<i64> {
        let id = self.queue(kind).pop(cancel).await?;
        self.in_flight().insert(id);
        Some(id)
    }

    /// Takes the next file row, trying `first` before the other file queue.
    pub async fn pop_file(&self, prefer_local: bool, cancel: &CancellationToken) -> Option<i64> {
        let (first, second) = if prefer_local {
            (&self.local_file, &self.remote_file)
        } else {
            (&self.remote_file, &self.local_file)
        };
        loop {
            if let Some(id) = first.try_pop().or_else(|| second.try_pop()) {
                self.in_flight().insert(id);
                return Some(id);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = first.not_empty.notified() => {}
                _ = second.not_empty.notified() => {}
            }
        }
    }

    /// Marks a popped row as finished so it may be queued again.
    pub fn done(&self, id: i64) {
        self.in_flight().remove(&id);
        self.update_saturation();
        self.publish_progress();
    }

    pub fn clear(&self) {
        for kind in [
            QueueKind::LocalFolder,
            QueueKind::LocalFile,
            QueueKind::RemoteFolder,
            QueueKind::RemoteFile,
        ] {
            self.queue(kind).clear();
        }
        self.in_flight().clear();
        self.saturated.store(false, Ordering::Relaxed);
    }

    pub fn progress(&self) -> QueueProgress {
        QueueProgress {
            local_folder: self.local_folder.len(),
            local_file: self.local_file.len(),
            remote_folder: self.remote_folder.len(),
            remote_file: self.remote_file.len(),
            errors: self.errors_waiting.load(Ordering::Relaxed),
        }
    }

    fn publish_progress(&self) {
        let progress = self.progress();
        let mut last = self.last_progress.lock().unwrap_or_else(PoisonError::into_inner);
        if *last == progress {
            return;
        }
        *last = progress;
        drop(last);
        let _ = self.events.send(EngineEvent::QueueProgress {
            engine: self.engine.clone(),
            progress,
        });
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
