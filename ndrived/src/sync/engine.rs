use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use ndrive_core::{RemoteClient, RemoteError};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::digest::DigestAlgorithm;
use super::local_client::{IgnoreRules, LocalClient, LocalClientError, RootTag};
use super::local_watcher::LocalWatcher;
use super::pair_state::{PairState, SideState};
use super::paths;
use super::processor::Processor;
use super::queue::{QueueKind, QueueManager};
use super::remote_watcher::RemoteWatcher;
use super::state_db::{DocPair, NewPair, StateCounts, StateDb, StateDbError};
use super::transfer::{DEFAULT_CHUNK_SIZE, TransferClient, TransferError};
use crate::config::ConfigHandle;
use crate::events::{EngineEvent, EngineStatus, EventSender, QueueProgress};

pub const DEFAULT_ENGINE_KIND: &str = "NXDRIVE";
pub const READONLY_ENGINE_KIND: &str = "READONLY";
pub const REMOTE_ROOT_PATH_KEY: &str = "remote_root_path";
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);
const FOLDER_WORKER_IDS: [i64; 2] = [1, 2];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state db error: {0}")]
    State(#[from] StateDbError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("local error: {0}")]
    Local(#[from] LocalClientError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("local folder {0} does not exist")]
    RootMissing(PathBuf),
    #[error("local folder {path} belongs to engine {owner}")]
    RootTagMismatch { path: PathBuf, owner: String },
    #[error("unknown engine type: {0}")]
    UnknownKind(String),
    #[error("row {0} not found")]
    MissingRow(i64),
    #[error("engine {0} is not running")]
    NotRunning(String),
}

/// Behaviour that differs between engine implementations.
pub trait EngineKind: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the processor acts on rows in `state`. Rows in other
    /// non-idle states are detached as unsynchronized.
    fn handles(&self, state: PairState) -> bool;
}

/// Two-way synchronization.
pub struct StandardEngine;

impl EngineKind for StandardEngine {
    fn name(&self) -> &'static str {
        DEFAULT_ENGINE_KIND
    }

    fn handles(&self, state: PairState) -> bool {
        !state.is_idle()
    }
}

/// Server to disk only. Local edits are never pushed.
pub struct ReadOnlyEngine;

impl EngineKind for ReadOnlyEngine {
    fn name(&self) -> &'static str {
        READONLY_ENGINE_KIND
    }

    fn handles(&self, state: PairState) -> bool {
        !state.is_idle() && !state.is_local_side()
    }
}

/// Engine implementations by name, filled once at Manager construction.
pub struct EngineRegistry {
    kinds: HashMap<String, Arc<dyn EngineKind>>,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(Arc::new(StandardEngine));
        registry.register(Arc::new(ReadOnlyEngine));
        registry
    }
}

impl EngineRegistry {
    pub fn register(&mut self, kind: Arc<dyn EngineKind>) {
        self.kinds.insert(kind.name().to_string(), kind);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn EngineKind>, EngineError> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownKind(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Splits `https://host/ctx#READONLY` into the bare URL and the engine type.
pub fn split_server_url(url: &str) -> (String, Option<String>) {
    match url.split_once('#') {
        Some((base, kind)) if !kind.trim().is_empty() => {
            (base.to_string(), Some(kind.trim().to_ascii_uppercase()))
        }
        Some((base, _)) => (base.to_string(), None),
        None => (url.to_string(), None),
    }
}

/// Persistent description of one local folder bound to a remote root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineBinding {
    pub uid: String,
    pub kind: String,
    pub name: String,
    pub local_folder: PathBuf,
    pub server_url: String,
    pub remote_user: String,
    pub remote_root: String,
}

impl EngineBinding {
    pub fn root_tag(&self) -> RootTag {
        RootTag {
            engine_type: self.kind.clone(),
            server_url: self.server_url.clone(),
            user: self.remote_user.clone(),
            engine_uid: self.uid.clone(),
        }
    }
}

/// Everything the watchers, feeder and workers of one engine share.
/// Workers hold it through a `Weak` so a dropped engine stops them.
pub struct EngineContext {
    pub uid: String,
    pub kind: Arc<dyn EngineKind>,
    pub db: StateDb,
    pub local: LocalClient,
    pub remote: RemoteClient,
    pub remote_root: String,
    pub config: ConfigHandle,
    pub events: EventSender,
    pub queues: QueueManager,
    pub last_poll: Arc<AtomicI64>,
    transfers: RwLock<TransferClient>,
    parent_waits: Mutex<HashMap<i64, u32>>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        uid: impl Into<String>,
        kind: Arc<dyn EngineKind>,
        db: StateDb,
        local: LocalClient,
        remote: RemoteClient,
        remote_root: impl Into<String>,
        config: ConfigHandle,
        events: EventSender,
    ) -> Self {
        let uid = uid.into();
        let snapshot = config.snapshot();
        let transfers = TransferClient::new(
            remote.clone(),
            uid.clone(),
            snapshot.max_concurrent_transfers,
        );
        let queues = QueueManager::new(uid.clone(), db.clone(), config.clone(), events.clone());
        Self {
            uid,
            kind,
            db,
            local,
            remote,
            remote_root: remote_root.into(),
            config,
            events,
            queues,
            last_poll: Arc::new(AtomicI64::new(0)),
            transfers: RwLock::new(transfers),
            parent_waits: Mutex::new(HashMap::new()),
        }
    }

    /// Records one more postponement of row `id` for a missing parent and
    /// returns how many happened in a row.
    pub(crate) fn note_parent_wait(&self, id: i64) -> u32 {
        let mut waits = self.parent_waits.lock().unwrap_or_else(PoisonError::into_inner);
        let count = waits.entry(id).or_default();
        *count += 1;
        *count
    }

    pub(crate) fn clear_parent_wait(&self, id: i64) {
        self.parent_waits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    pub fn transfers(&self) -> TransferClient {
        self.transfers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.transfers().algorithm()
    }

    fn configure_transfers(&self, algorithm: DigestAlgorithm, chunk_size: u64) {
        let mut guard = self.transfers.write().unwrap_or_else(PoisonError::into_inner);
        *guard = guard
            .clone()
            .with_algorithm(algorithm)
            .with_chunk_size(chunk_size);
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }
}

/// Counters the UI collaborator polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub queued: QueueProgress,
    pub errored: i64,
    pub conflicted: i64,
    pub unsynchronized: i64,
    pub syncing: i64,
    pub total: i64,
    /// Unix milliseconds of the last successful remote poll.
    pub last_remote_poll: Option<i64>,
    pub digests_computed: u64,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

pub struct Engine {
    binding: EngineBinding,
    ctx: Arc<EngineContext>,
    running: tokio::sync::Mutex<Option<Running>>,
    status: Mutex<EngineStatus>,
    prepared: tokio::sync::OnceCell<()>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("binding", &self.binding)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Opens the engine's store. Nothing runs until `start`.
    pub async fn open(
        binding: EngineBinding,
        kind: Arc<dyn EngineKind>,
        remote: RemoteClient,
        config: ConfigHandle,
        events: EventSender,
    ) -> Result<Self, EngineError> {
        let snapshot = config.snapshot();
        let db = StateDb::open(&snapshot.engine_db_path(&binding.uid)).await?;
        let local = LocalClient::new(&binding.local_folder, IgnoreRules::from_config(&snapshot)?);
        let ctx = EngineContext::new(
            binding.uid.clone(),
            kind,
            db,
            local,
            remote,
            binding.remote_root.clone(),
            config,
            events,
        );
        Ok(Self::with_context(binding, ctx))
    }

    pub fn with_context(binding: EngineBinding, ctx: EngineContext) -> Self {
        Self {
            binding,
            ctx: Arc::new(ctx),
            running: tokio::sync::Mutex::new(None),
            status: Mutex::new(EngineStatus::Stopped),
            prepared: tokio::sync::OnceCell::new(),
        }
    }

    pub fn uid(&self) -> &str {
        &self.binding.uid
    }

    pub fn binding(&self) -> &EngineBinding {
        &self.binding
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: EngineStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
        self.ctx.emit(EngineEvent::Status {
            engine: self.binding.uid.clone(),
            status,
        });
    }

    /// Writes the root tag on a freshly bound folder.
    pub fn tag_root(&self) -> Result<(), EngineError> {
        self.ctx.local.set_root_tag(&self.binding.root_tag())?;
        Ok(())
    }

    /// Runs the one-time startup checks, then spawns every task.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        self.prepared.get_or_try_init(|| self.prepare()).await?;
        *running = Some(self.spawn_tasks());
        drop(running);
        self.set_status(EngineStatus::Running);
        info!(engine = %self.binding.uid, root = %self.binding.local_folder.display(), "engine started");
        Ok(())
    }

    async fn prepare(&self) -> Result<(), EngineError> {
        let ctx = &self.ctx;
        if !tokio::fs::metadata(ctx.local.root())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(EngineError::RootMissing(ctx.local.root().to_path_buf()));
        }
        match ctx.local.get_root_tag() {
            Some(tag) if tag.engine_uid != self.binding.uid => {
                return Err(EngineError::RootTagMismatch {
                    path: ctx.local.root().to_path_buf(),
                    owner: tag.engine_uid,
                });
            }
            Some(_) => {}
            None => self.tag_root()?,
        }

        match ctx.remote.server_configuration().await {
            Ok(server) => {
                let algorithm = DigestAlgorithm::from_server(&server.digest_algorithm);
                let chunk_size = server.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
                debug!(engine = %ctx.uid, algorithm = algorithm.as_str(), chunk_size, "server configuration");
                ctx.configure_transfers(algorithm, chunk_size);
            }
            Err(RemoteError::AuthExpired) => return Err(RemoteError::AuthExpired.into()),
            Err(err) => {
                warn!(engine = %ctx.uid, error = %err, "server configuration unavailable, using defaults");
            }
        }

        let released = ctx.db.release_all().await?;
        if released > 0 {
            info!(engine = %ctx.uid, released, "claims left by an unclean stop released");
        }
        ctx.transfers().clean_stale_downloads(&ctx.db).await?;

        if ctx.db.root().await?.is_none() {
            let mut txn = ctx.db.write().await?;
            txn.insert(NewPair {
                local_path: paths::ROOT.into(),
                folderish: true,
                local_state: Some(SideState::Synchronized),
                remote_state: Some(SideState::Synchronized),
                remote_ref: Some(ctx.remote_root.clone()),
                ..NewPair::default()
            })
            .await?;
            txn.commit().await?;
        }
        match ctx.remote.document(&ctx.remote_root).await {
            Ok(doc) => {
                if let Some(path) = doc.path.as_deref() {
                    ctx.db.set_config(REMOTE_ROOT_PATH_KEY, Some(path)).await?;
                }
            }
            Err(RemoteError::AuthExpired) => return Err(RemoteError::AuthExpired.into()),
            Err(err) => warn!(engine = %ctx.uid, error = %err, "remote root lookup failed"),
        }
        self.backup_store().await;
        Ok(())
    }

    /// Snapshots the state db so a corrupted store can be restored on open.
    async fn backup_store(&self) {
        if let Err(err) = self.ctx.db.backup().await {
            warn!(engine = %self.binding.uid, error = %err, "state db backup failed");
        }
    }

    fn spawn_tasks(&self) -> Running {
        let ctx = &self.ctx;
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let config = ctx.config.snapshot();

        let engine_for_feeder = Arc::clone(ctx);
        let cancel_feeder = cancel.clone();
        tasks.push((
            "queue-feeder".to_string(),
            tokio::spawn(async move { engine_for_feeder.queues.run_feeder(cancel_feeder).await }),
        ));

        let local_watcher = LocalWatcher::new(
            ctx.db.clone(),
            ctx.local.clone(),
            ctx.config.clone(),
            ctx.algorithm(),
            ctx.queues.wake_handle(),
            ctx.queues.saturation_flag(),
        );
        let cancel_local = cancel.clone();
        let uid_local = ctx.uid.clone();
        tasks.push((
            "local-watcher".to_string(),
            tokio::spawn(async move {
                if let Err(err) = local_watcher.run(cancel_local).await {
                    warn!(engine = %uid_local, error = %err, "local watcher stopped");
                }
            }),
        ));

        let remote_watcher = RemoteWatcher::new(
            ctx.uid.clone(),
            ctx.db.clone(),
            ctx.remote.clone(),
            ctx.remote_root.clone(),
            ctx.config.clone(),
            ctx.queues.wake_handle(),
            ctx.events.clone(),
            Arc::clone(&ctx.last_poll),
        );
        let cancel_remote = cancel.clone();
        tasks.push((
            "remote-watcher".to_string(),
            tokio::spawn(remote_watcher.run(cancel_remote)),
        ));

        for (id, kind) in FOLDER_WORKER_IDS
            .into_iter()
            .zip([QueueKind::LocalFolder, QueueKind::RemoteFolder])
        {
            let processor = Processor::new(Arc::downgrade(ctx), id);
            let cancel_worker = cancel.clone();
            tasks.push((
                format!("folder-worker-{id}"),
                tokio::spawn(processor.run_folder_worker(kind, cancel_worker)),
            ));
        }
        let first_file_id = FOLDER_WORKER_IDS.len() as i64 + 1;
        for n in 0..config.file_workers.max(1) {
            let id = first_file_id + n as i64;
            let processor = Processor::new(Arc::downgrade(ctx), id);
            let cancel_worker = cancel.clone();
            tasks.push((
                format!("file-worker-{id}"),
                tokio::spawn(processor.run_file_worker(n % 2 == 0, cancel_worker)),
            ));
        }

        Running { cancel, tasks }
    }

    /// Cancels every task and waits for them, abandoning any still alive
    /// after the join timeout.
    async fn halt(&self, keep_queues: bool) -> bool {
        let Some(running) = self.running.lock().await.take() else {
            return false;
        };
        running.cancel.cancel();
        for (name, handle) in running.tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_panic() => {
                    warn!(engine = %self.binding.uid, task = %name, "task panicked");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(engine = %self.binding.uid, task = %name, "task did not stop in time, abandoning");
                    abort.abort();
                }
            }
        }
        if !keep_queues {
            self.ctx.queues.clear();
        }
        if let Err(err) = self.ctx.db.release_all().await {
            warn!(engine = %self.binding.uid, error = %err, "failed to release claims");
        }
        self.backup_store().await;
        true
    }

    pub async fn stop(&self) {
        if self.halt(false).await {
            self.set_status(EngineStatus::Stopped);
            info!(engine = %self.binding.uid, "engine stopped");
        }
    }

    /// Stops workers and watchers but keeps what is queued.
    pub async fn pause(&self) {
        if self.halt(true).await {
            self.set_status(EngineStatus::Paused);
            info!(engine = %self.binding.uid, "engine paused");
        }
    }

    /// Like `pause`, for conditions the user must fix first (credentials, disk space).
    pub async fn suspend(&self) {
        if self.halt(true).await {
            self.set_status(EngineStatus::Suspended);
            warn!(engine = %self.binding.uid, "engine suspended");
        }
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.start().await
    }

    pub async fn metrics(&self) -> Result<EngineMetrics, EngineError> {
        let counts: StateCounts = self.ctx.db.counts().await?;
        let last_poll = self.ctx.last_poll.load(Ordering::Relaxed);
        Ok(EngineMetrics {
            queued: self.ctx.queues.progress(),
            errored: counts.errored,
            conflicted: counts.get(PairState::Conflicted),
            unsynchronized: counts.get(PairState::Unsynchronized),
            syncing: counts.syncing,
            total: counts.total,
            last_remote_poll: (last_poll > 0).then_some(last_poll),
            digests_computed: self.ctx.local.digests_computed(),
        })
    }

    pub async fn state_counts(&self) -> Result<StateCounts, EngineError> {
        Ok(self.ctx.db.counts().await?)
    }

    pub async fn conflicts(&self) -> Result<Vec<DocPair>, EngineError> {
        Ok(self.ctx.db.rows_in_state(PairState::Conflicted).await?)
    }

    pub async fn errors(&self) -> Result<Vec<DocPair>, EngineError> {
        Ok(self.ctx.db.rows_with_errors().await?)
    }

    pub async fn unsynchronized(&self) -> Result<Vec<DocPair>, EngineError> {
        Ok(self.ctx.db.rows_in_state(PairState::Unsynchronized).await?)
    }

    async fn edit_row<F>(&self, id: i64, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut DocPair),
    {
        self.ctx
            .db
            .update_pair(id, f)
            .await?
            .ok_or(EngineError::MissingRow(id))?;
        self.ctx.queues.wake_handle().notify_one();
        Ok(())
    }

    /// Keeps the local content: it is uploaded over the server's.
    pub async fn resolve_with_local(&self, id: i64) -> Result<(), EngineError> {
        self.edit_row(id, |pair| {
            pair.local_state = SideState::Resolved;
            pair.checked_version = None;
            pair.clear_error();
        })
        .await
    }

    /// Keeps the server content: it is downloaded over the local file.
    pub async fn resolve_with_remote(&self, id: i64) -> Result<(), EngineError> {
        self.edit_row(id, |pair| {
            pair.local_state = SideState::Synchronized;
            pair.remote_state = SideState::Modified;
            pair.checked_version = None;
            pair.clear_error();
        })
        .await
    }

    pub async fn retry(&self, id: i64) -> Result<(), EngineError> {
        self.edit_row(id, |pair| {
            pair.checked_version = None;
            pair.clear_error();
        })
        .await
    }

    pub async fn unsynchronize(&self, id: i64) -> Result<(), EngineError> {
        self.edit_row(id, |pair| {
            if pair.local_state != SideState::Unsynchronized {
                pair.suspended_local_state = Some(pair.local_state);
                pair.local_state = SideState::Unsynchronized;
            }
        })
        .await
    }

    pub async fn resynchronize(&self, id: i64) -> Result<(), EngineError> {
        self.edit_row(id, |pair| {
            if pair.local_state == SideState::Unsynchronized {
                pair.local_state = pair
                    .suspended_local_state
                    .take()
                    .unwrap_or(SideState::Synchronized);
            }
            pair.clear_error();
        })
        .await
    }

    /// Maps a server path onto this engine's tree, if it lies inside it.
    pub async fn local_path_for(&self, remote_path: &str) -> Result<Option<String>, EngineError> {
        let Some(root_path) = self.ctx.db.get_config(REMOTE_ROOT_PATH_KEY).await? else {
            return Ok(None);
        };
        Ok(paths::rebase(remote_path, &root_path, paths::ROOT))
    }

    /// Stops synchronizing everything under `remote_path`. Its rows are
    /// dropped and its local copy goes to the trash.
    pub async fn add_filter(&self, remote_path: &str) -> Result<usize, EngineError> {
        let local_path = self.local_path_for(remote_path).await?;
        let mut txn = self.ctx.db.write().await?;
        txn.add_filter(remote_path).await?;
        let mut purged = 0;
        if let Some(local_path) = local_path.as_deref().filter(|p| *p != paths::ROOT) {
            let mut rows = txn.descendants(local_path).await?;
            if let Some(top) = txn.get_by_path(local_path).await? {
                rows.push(top);
            }
            for row in &rows {
                for kind in [
                    QueueKind::LocalFolder,
                    QueueKind::LocalFile,
                    QueueKind::RemoteFolder,
                    QueueKind::RemoteFile,
                ] {
                    self.ctx.queues.queue(kind).remove(row.id);
                }
            }
            purged = txn.purge_tree(local_path).await? as usize;
        }
        txn.commit().await?;
        if let Some(local_path) = local_path.as_deref().filter(|p| *p != paths::ROOT) {
            self.ctx.local.delete(local_path).await?;
        }
        info!(engine = %self.binding.uid, path = %remote_path, purged, "filter added");
        Ok(purged)
    }

    /// Re-includes `remote_path`; the next poll walks the whole tree.
    pub async fn remove_filter(&self, remote_path: &str) -> Result<(), EngineError> {
        let mut txn = self.ctx.db.write().await?;
        txn.remove_filter(remote_path).await?;
        txn.clear_remote_token().await?;
        txn.commit().await?;
        info!(engine = %self.binding.uid, path = %remote_path, "filter removed");
        Ok(())
    }

    pub async fn filters(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.ctx.db.filters().await?)
    }

    /// Stops the engine and removes every trace of it from the folder.
    pub async fn unbind(&self) -> Result<(), EngineError> {
        self.stop().await;
        for row in self.ctx.db.all().await? {
            if row.remote_ref.is_some()
                && !row.is_root()
                && let Err(err) = self.ctx.local.remove_remote_id(&row.local_path)
            {
                debug!(path = %row.local_path, error = %err, "tag already gone");
            }
        }
        if let Err(err) = self.ctx.local.remove_root_tag() {
            debug!(error = %err, "root tag already gone");
        }
        self.ctx.db.close().await;
        Ok(())
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
