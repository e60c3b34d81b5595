use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::digest::{DigestAlgorithm, same_digest};
use super::local_client::{FileInfo, LocalClient, LocalClientError, is_generated_tmp_file};
use super::pair_state::SideState;
use super::paths;
use super::state_db::{DocPair, NewPair, StateDb, StateDbError, WriteTxn};
use crate::config::ConfigHandle;

const TICK: Duration = Duration::from_millis(250);
const STORM_CALM: Duration = Duration::from_secs(1);
const SATURATED_QUARANTINE_FACTOR: u32 = 5;
/// How long a scratch-looking name that may turn into a real document must
/// stay untouched before it is synchronized under that name.
const MAY_BECOME_FINAL_DELAY: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    State(#[from] StateDbError),
    #[error(transparent)]
    Local(#[from] LocalClientError),
    #[error("filesystem notifications unavailable: {0}")]
    Notify(#[from] notify::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    Moved { from: String, to: String },
}

impl LocalEvent {
    fn key(&self) -> &str {
        match self {
            LocalEvent::Created(path) | LocalEvent::Modified(path) | LocalEvent::Deleted(path) => {
                path
            }
            LocalEvent::Moved { to, .. } => to,
        }
    }
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
        Err(err) => warn!(error = %err, "filesystem watcher error"),
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    let mut local_paths = event
        .paths
        .iter()
        .filter_map(|path| paths::to_local(root, path).ok())
        .filter(|path| path != paths::ROOT);
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (local_paths.next(), local_paths.next()) {
                (Some(from), Some(to)) => vec![LocalEvent::Moved { from, to }],
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            local_paths.map(LocalEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => {
            local_paths.map(LocalEvent::Created).collect()
        }
        EventKind::Modify(_) => local_paths.map(LocalEvent::Modified).collect(),
        EventKind::Remove(_) => local_paths.map(LocalEvent::Deleted).collect(),
        _ => Vec::new(),
    }
}

struct Quarantined {
    event: LocalEvent,
    seq: u64,
    last_seen: Instant,
}

/// Holds events per path until the path has been quiet long enough,
/// collapsing bursts into one event.
#[derive(Default)]
pub struct Quarantine {
    entries: HashMap<String, Quarantined>,
    seq: u64,
}

impl Quarantine {
    pub fn push(&mut self, event: LocalEvent, now: Instant) {
        if let LocalEvent::Moved { from, to } = &event {
            // The rename halves reported separately are superseded by the move.
            self.entries.remove(from);
            self.entries.remove(to);
        }
        let key = event.key().to_string();
        self.seq += 1;
        match self.entries.get_mut(&key) {
            Some(existing) => {
                if let Some(merged) = merge(&existing.event, event) {
                    existing.event = merged;
                }
                existing.last_seen = now;
            }
            None => {
                self.entries.insert(
                    key,
                    Quarantined {
                        event,
                        seq: self.seq,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Events whose path has been quiet for `delay`, oldest first.
    pub fn drain_ready(&mut self, now: Instant, delay: Duration) -> Vec<LocalEvent> {
        let ready: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, q)| now.saturating_duration_since(q.last_seen) >= delay)
            .map(|(key, _)| key.clone())
            .collect();
        let mut drained: Vec<Quarantined> = ready
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect();
        drained.sort_by_key(|q| q.seq);
        drained.into_iter().map(|q| q.event).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn merge(existing: &LocalEvent, next: LocalEvent) -> Option<LocalEvent> {
    use LocalEvent as E;
    Some(match (existing, next) {
        (E::Created(path), E::Modified(_)) => E::Created(path.clone()),
        (E::Deleted(path), E::Created(_)) => E::Modified(path.clone()),
        (E::Moved { from, to }, E::Modified(_)) => E::Moved {
            from: from.clone(),
            to: to.clone(),
        },
        (E::Moved { from, .. }, E::Deleted(_)) => E::Deleted(from.clone()),
        (_, next) => next,
    })
}

/// Counts events per second and trips after `seconds` consecutive seconds
/// above `threshold`. Ingestion stays paused until events calm down.
pub struct StormDetector {
    threshold: u64,
    seconds: u64,
    bucket_start: Instant,
    bucket_count: u64,
    hot: u64,
    paused: bool,
    last_event: Instant,
}

impl StormDetector {
    pub fn new(threshold: u64, seconds: u64, now: Instant) -> Self {
        Self {
            threshold,
            seconds: seconds.max(1),
            bucket_start: now,
            bucket_count: 0,
            hot: 0,
            paused: false,
            last_event: now,
        }
    }

    /// Records one event; returns true while ingestion is paused.
    pub fn record(&mut self, now: Instant) -> bool {
        self.last_event = now;
        if now.saturating_duration_since(self.bucket_start) >= Duration::from_secs(1) {
            if self.bucket_count > self.threshold {
                self.hot += 1;
            } else {
                self.hot = 0;
            }
            self.bucket_start = now;
            self.bucket_count = 0;
        }
        self.bucket_count += 1;
        if !self.paused && self.hot >= self.seconds {
            warn!(threshold = self.threshold, seconds = self.seconds, "event storm, pausing ingestion");
            self.paused = true;
        }
        self.paused
    }

    /// True once the storm has calmed down and a scan should replace the dropped events.
    pub fn should_rescan(&mut self, now: Instant) -> bool {
        if self.paused && now.saturating_duration_since(self.last_event) >= STORM_CALM {
            self.paused = false;
            self.hot = 0;
            self.bucket_count = 0;
            self.bucket_start = now;
            return true;
        }
        false
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }
}

struct PendingDelete {
    local_path: String,
    folderish: bool,
    size: Option<i64>,
    digest: Option<String>,
    remote_ref: Option<String>,
    deadline: Instant,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub created: usize,
    pub modified: usize,
    pub moved: usize,
    pub deleted: usize,
}

impl ScanStats {
    pub fn writes(&self) -> usize {
        self.created + self.modified + self.moved + self.deleted
    }
}

/// Turns filesystem activity under one engine root into local-side intents.
pub struct LocalWatcher {
    db: StateDb,
    local: LocalClient,
    config: ConfigHandle,
    algorithm: DigestAlgorithm,
    wake: Arc<Notify>,
    saturated: Arc<AtomicBool>,
    quarantine: Quarantine,
    pending_deletes: Vec<PendingDelete>,
    deferred: HashMap<String, Instant>,
    storm: StormDetector,
}

impl LocalWatcher {
    pub fn new(
        db: StateDb,
        local: LocalClient,
        config: ConfigHandle,
        algorithm: DigestAlgorithm,
        wake: Arc<Notify>,
        saturated: Arc<AtomicBool>,
    ) -> Self {
        let snapshot = config.snapshot();
        let storm = StormDetector::new(snapshot.storm_threshold, snapshot.storm_seconds, Instant::now());
        Self {
            db,
            local,
            config,
            algorithm,
            wake,
            saturated,
            quarantine: Quarantine::default(),
            pending_deletes: Vec::new(),
            deferred: HashMap::new(),
            storm,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WatcherError> {
        let (_watcher, mut rx) = start_notify_watcher(self.local.root())?;
        let stats = self.scan().await?;
        info!(root = %self.local.root().display(), ?stats, "local scan finished");
        if stats.writes() > 0 {
            self.wake.notify_one();
        }

        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => self.ingest(event, Instant::now()),
                    None => break,
                },
                _ = tick.tick() => {
                    if let Err(err) = self.flush(Instant::now()).await {
                        warn!(error = %err, "applying local events failed");
                    }
                }
            }
        }
        debug!("local watcher stopped");
        Ok(())
    }

    pub fn ingest(&mut self, event: LocalEvent, now: Instant) {
        if self.storm.record(now) {
            self.quarantine.clear();
            return;
        }
        self.quarantine.push(event, now);
    }

    /// Applies quarantined events that are due. Returns how many were applied.
    pub async fn flush(&mut self, now: Instant) -> Result<usize, WatcherError> {
        let mut applied = 0;
        if self.storm.should_rescan(now) {
            let stats = self.scan().await?;
            info!(?stats, "rescan after event storm");
            applied += stats.writes();
        }

        let mut delay = self.config.snapshot().quarantine;
        if self.saturated.load(Ordering::Relaxed) {
            delay *= SATURATED_QUARANTINE_FACTOR;
        }
        for event in self.quarantine.drain_ready(now, delay) {
            debug!(?event, "applying local event");
            if self.apply(event, now).await? {
                applied += 1;
            }
        }

        let (expired, pending): (Vec<_>, Vec<_>) = self
            .pending_deletes
            .drain(..)
            .partition(|p| p.deadline <= now);
        self.pending_deletes = pending;
        for delete in expired {
            self.mark_deleted(&delete.local_path).await?;
            applied += 1;
        }

        let due: Vec<String> = self
            .deferred
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in due {
            self.deferred.remove(&path);
            if self.apply_deferred(&path, now).await? {
                applied += 1;
            }
        }

        if applied > 0 {
            self.wake.notify_one();
        }
        Ok(applied)
    }

    pub async fn apply(&mut self, event: LocalEvent, now: Instant) -> Result<bool, WatcherError> {
        match event {
            LocalEvent::Created(path) => self.apply_created(&path, now).await,
            LocalEvent::Modified(path) => self.apply_modified(&path, now).await,
            LocalEvent::Deleted(path) => self.apply_deleted(&path, now).await,
            LocalEvent::Moved { from, to } => self.apply_moved(&from, &to, now).await,
        }
    }

    /// True when the event on `local_path` must not be applied now. Names that
    /// may still become final are re-checked once they have been quiet for
    /// [`MAY_BECOME_FINAL_DELAY`].
    fn skipped(&mut self, local_path: &str, now: Instant) -> bool {
        if self.local.is_ignored_path(local_path) {
            return true;
        }
        match is_generated_tmp_file(paths::name(local_path)) {
            (false, _) => false,
            (true, false) => true,
            (true, true) => {
                self.deferred
                    .insert(local_path.to_string(), now + MAY_BECOME_FINAL_DELAY);
                true
            }
        }
    }

    /// Treats a deferred path as a regular document if it is still there.
    async fn apply_deferred(&mut self, path: &str, now: Instant) -> Result<bool, WatcherError> {
        match self.local.get_info(path).await? {
            Some(info) => {
                debug!(path, "temporary-looking name kept, synchronizing it");
                self.record_created(info).await
            }
            None => self.record_deleted(path, now).await,
        }
    }

    async fn apply_created(&mut self, path: &str, now: Instant) -> Result<bool, WatcherError> {
        if self.skipped(path, now) {
            return Ok(false);
        }
        let Some(info) = self.local.get_info(path).await? else {
            return Ok(false);
        };
        self.record_created(info).await
    }

    async fn record_created(&mut self, info: FileInfo) -> Result<bool, WatcherError> {
        let path = info.local_path.clone();
        if let Some(pending) = self.take_matching_delete(&info).await?
            && let Some(source) = self.db.get_by_path(&pending.local_path).await?
        {
            debug!(from = %pending.local_path, to = %path, "re-paired delete and create as a move");
            return self.move_row(source, info).await;
        }

        let changed = self.upsert_from_disk(&info).await?;
        if info.folderish {
            // Children created before the watch caught up on the new folder.
            let stats = self.scan_subtree(&path).await?;
            return Ok(changed || stats.writes() > 0);
        }
        Ok(changed)
    }

    async fn upsert_from_disk(&mut self, info: &FileInfo) -> Result<bool, WatcherError> {
        let mut txn = self.db.write().await?;
        let changed = match txn.get_by_path(&info.local_path).await? {
            Some(mut row) => {
                let changed = refresh_local(&mut row, info);
                if changed {
                    txn.save(&mut row).await?;
                }
                changed
            }
            None => {
                txn.insert(new_local_pair(info)).await?;
                true
            }
        };
        txn.commit().await?;
        Ok(changed)
    }

    async fn apply_modified(&mut self, path: &str, now: Instant) -> Result<bool, WatcherError> {
        if self.skipped(path, now) {
            return Ok(false);
        }
        let Some(info) = self.local.get_info(path).await? else {
            return self.apply_deleted(path, now).await;
        };
        let mut txn = self.db.write().await?;
        let Some(mut row) = txn.get_by_path(path).await? else {
            drop(txn);
            return self.apply_created(path, now).await;
        };
        let changed = refresh_local(&mut row, &info);
        if changed {
            txn.save(&mut row).await?;
        }
        txn.commit().await?;
        Ok(changed)
    }

    async fn apply_deleted(&mut self, path: &str, now: Instant) -> Result<bool, WatcherError> {
        if self.skipped(path, now) {
            return Ok(false);
        }
        self.record_deleted(path, now).await
    }

    async fn record_deleted(&mut self, path: &str, now: Instant) -> Result<bool, WatcherError> {
        if let Some(info) = self.local.get_info(path).await? {
            // Deleted then recreated within the quarantine.
            return self.upsert_from_disk(&info).await;
        }
        let Some(row) = self.db.get_by_path(path).await? else {
            return Ok(false);
        };
        if row.remote_ref.is_some() && row.local_state != SideState::Unsynchronized {
            let window = self.config.snapshot().move_window;
            self.pending_deletes.push(PendingDelete {
                local_path: row.local_path.clone(),
                folderish: row.folderish,
                size: row.size,
                digest: row.local_digest.clone().or(row.remote_digest.clone()),
                remote_ref: row.remote_ref.clone(),
                deadline: now + window,
            });
            return Ok(false);
        }
        self.mark_deleted(path).await?;
        Ok(true)
    }

    async fn apply_moved(&mut self, from: &str, to: &str, now: Instant) -> Result<bool, WatcherError> {
        self.deferred.remove(from);
        if self.skipped(to, now) {
            // Renamed into an ignored name: the object is gone for the server.
            self.pending_deletes.retain(|p| p.local_path != from);
            self.mark_deleted(from).await?;
            return Ok(true);
        }
        let source = if self.local.is_ignored_path(from) || is_generated_tmp_file(paths::name(from)).0
        {
            None
        } else {
            self.db.get_by_path(from).await?
        };
        let Some(source) = source else {
            return self.apply_created(to, now).await;
        };
        self.pending_deletes.retain(|p| p.local_path != from);
        let Some(info) = self.local.get_info(to).await? else {
            // Gone again before the quarantine expired.
            self.mark_deleted(from).await?;
            return Ok(true);
        };
        self.move_row(source, info).await
    }

    /// Points `source` and its descendants at the path of `info`.
    async fn move_row(&mut self, mut source: DocPair, info: FileInfo) -> Result<bool, WatcherError> {
        let from = source.local_path.clone();
        let to = info.local_path.as_str();
        let mut txn = self.db.write().await?;
        if let Some(mut target) = txn.get_by_path(to).await?
            && target.id != source.id
        {
            // Moved over a tracked object: keep both versions reachable.
            warn!(from = %from, to, "move overwrote a tracked object, flagging conflict");
            target.local_state = SideState::Modified;
            if matches!(target.remote_state, SideState::Synchronized | SideState::Unknown)
                && target.remote_ref.is_some()
            {
                target.remote_state = SideState::Modified;
            }
            target.size = Some(info.size as i64);
            target.last_local_updated = Some(info.mtime);
            target.local_digest = None;
            txn.save(&mut target).await?;
            cascade_deleted(&mut txn, &mut source).await?;
            txn.commit().await?;
            return Ok(true);
        }

        source.local_path = to.to_string();
        if source.local_state == SideState::Synchronized {
            source.local_state = SideState::Moved;
        }
        if !info.folderish {
            source.size = Some(info.size as i64);
            source.last_local_updated = Some(info.mtime);
        }
        txn.save(&mut source).await?;
        txn.rebase_tree(&from, to).await?;
        txn.commit().await?;
        Ok(true)
    }

    async fn take_matching_delete(
        &mut self,
        info: &FileInfo,
    ) -> Result<Option<PendingDelete>, WatcherError> {
        if self.pending_deletes.is_empty() {
            return Ok(None);
        }
        if let Some(tag) = &info.remote_ref
            && let Some(idx) = self
                .pending_deletes
                .iter()
                .position(|p| p.remote_ref.as_deref() == Some(tag.as_str()))
        {
            return Ok(Some(self.pending_deletes.remove(idx)));
        }
        if info.folderish {
            return Ok(None);
        }
        let size = info.size as i64;
        if !self
            .pending_deletes
            .iter()
            .any(|p| !p.folderish && p.size == Some(size) && p.digest.is_some())
        {
            return Ok(None);
        }
        let digest = self.local.digest(&info.local_path, self.algorithm).await?;
        let found = self.pending_deletes.iter().position(|p| {
            !p.folderish
                && p.size == Some(size)
                && p.digest.as_deref().is_some_and(|d| same_digest(d, &digest))
        });
        Ok(found.map(|idx| self.pending_deletes.remove(idx)))
    }

    async fn mark_deleted(&mut self, path: &str) -> Result<(), WatcherError> {
        let mut txn = self.db.write().await?;
        if let Some(mut row) = txn.get_by_path(path).await? {
            cascade_deleted(&mut txn, &mut row).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Reconciles the database with the tree on disk. Running it twice in a
    /// row performs no writes the second time.
    pub async fn scan(&mut self) -> Result<ScanStats, WatcherError> {
        self.scan_subtree(paths::ROOT).await
    }

    async fn scan_subtree(&mut self, root: &str) -> Result<ScanStats, WatcherError> {
        let mut found = Vec::new();
        let mut may_become_final = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(dir) = stack.pop() {
            let children = match self.local.get_children(&dir).await {
                Ok(children) => children,
                Err(LocalClientError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            for child in children {
                match is_generated_tmp_file(&child.name) {
                    (false, _) => {}
                    (true, false) => continue,
                    (true, true) => {
                        may_become_final.push(child);
                        continue;
                    }
                }
                if child.folderish {
                    stack.push(child.local_path.clone());
                }
                found.push(child);
            }
        }
        found.sort_by(|a, b| {
            paths::depth(&a.local_path)
                .cmp(&paths::depth(&b.local_path))
                .then_with(|| a.local_path.cmp(&b.local_path))
        });
        let mut found_paths: HashSet<String> =
            found.iter().map(|f| f.local_path.clone()).collect();

        let mut stats = ScanStats::default();
        let mut txn = self.db.write().await?;
        let now = Instant::now();
        for info in &may_become_final {
            found_paths.insert(info.local_path.clone());
            match txn.get_by_path(&info.local_path).await? {
                // Already synchronized under this name once.
                Some(mut row) => {
                    if refresh_local(&mut row, info) {
                        txn.save(&mut row).await?;
                        stats.modified += 1;
                    }
                }
                None => {
                    self.deferred
                        .entry(info.local_path.clone())
                        .or_insert(now + MAY_BECOME_FINAL_DELAY);
                }
            }
        }
        for info in &found {
            if let Some(mut row) = txn.get_by_path(&info.local_path).await? {
                if refresh_local(&mut row, info) {
                    txn.save(&mut row).await?;
                    stats.modified += 1;
                }
                continue;
            }
            if let Some(tag) = &info.remote_ref
                && let Some(mut moved) = txn.get_by_ref(tag).await?
                && !found_paths.contains(&moved.local_path)
                && !self.local.exists(&moved.local_path).await
            {
                let old = moved.local_path.clone();
                moved.local_path = info.local_path.clone();
                if moved.local_state == SideState::Synchronized {
                    moved.local_state = SideState::Moved;
                }
                txn.save(&mut moved).await?;
                txn.rebase_tree(&old, &info.local_path).await?;
                stats.moved += 1;
                continue;
            }
            txn.insert(new_local_pair(info)).await?;
            stats.created += 1;
        }

        for mut row in txn.descendants(root).await? {
            if row.is_root() || found_paths.contains(&row.local_path) {
                continue;
            }
            if matches!(
                row.local_state,
                SideState::Synchronized
                    | SideState::Created
                    | SideState::Modified
                    | SideState::Moved
                    | SideState::Resolved
            ) {
                row.local_state = SideState::Deleted;
                txn.save(&mut row).await?;
                stats.deleted += 1;
            }
        }
        txn.commit().await?;
        Ok(stats)
    }
}

fn new_local_pair(info: &FileInfo) -> NewPair {
    NewPair {
        local_path: info.local_path.clone(),
        folderish: info.folderish,
        local_state: Some(SideState::Created),
        size: (!info.folderish).then_some(info.size as i64),
        last_local_updated: Some(info.mtime),
        ..NewPair::default()
    }
}

/// Records what the disk says about an existing row. Returns true when the row changed.
fn refresh_local(row: &mut DocPair, info: &FileInfo) -> bool {
    match row.local_state {
        SideState::Unknown | SideState::Unsynchronized | SideState::Direct => return false,
        SideState::Deleted => {
            row.local_state = if row.folderish {
                SideState::Synchronized
            } else {
                SideState::Modified
            };
            row.size = (!info.folderish).then_some(info.size as i64);
            row.last_local_updated = Some(info.mtime);
            row.local_digest = None;
            return true;
        }
        _ => {}
    }
    if row.folderish {
        return false;
    }
    let size = info.size as i64;
    if row.size == Some(size) && row.last_local_updated == Some(info.mtime) {
        return false;
    }
    row.size = Some(size);
    row.last_local_updated = Some(info.mtime);
    row.local_digest = None;
    if row.local_state == SideState::Synchronized {
        row.local_state = SideState::Modified;
    }
    true
}

async fn cascade_deleted(txn: &mut WriteTxn<'_>, row: &mut DocPair) -> Result<(), WatcherError> {
    let path = row.local_path.clone();
    let mut descendants = txn.descendants(&path).await?;
    // Deepest first so parents are purged after their children.
    descendants.sort_by_key(|d| std::cmp::Reverse(d.depth()));
    for mut child in descendants {
        mark_row_deleted(txn, &mut child).await?;
    }
    mark_row_deleted(txn, row).await?;
    Ok(())
}

async fn mark_row_deleted(txn: &mut WriteTxn<'_>, row: &mut DocPair) -> Result<(), WatcherError> {
    if row.local_state == SideState::Unsynchronized {
        txn.purge(row.id).await?;
        return Ok(());
    }
    if row.local_state == SideState::Deleted {
        return Ok(());
    }
    row.local_state = SideState::Deleted;
    txn.save(row).await?;
    Ok(())
}

#[cfg(test)]
#[path = "local_watcher_tests.rs"]
mod tests;
