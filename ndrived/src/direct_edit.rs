use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use ndrive_core::{CommitOperation, CommitRequest, RemoteClient, RemoteError};
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autolock::OpenFileSource;
use crate::config::ConfigHandle;
use crate::events::{EngineEvent, EventSender};
use crate::sync::digest::{DigestAlgorithm, file_digest, same_digest};
use crate::sync::local_client::safe_filename;
use crate::sync::state_db::now_ms;
use crate::sync::transfer::{TransferClient, TransferError, UploadRequest};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/direct_edit");

const STORE_FILE_NAME: &str = "direct_edit.db";
const TRANSFER_ID: &str = "direct_edit";

#[derive(Debug, Error)]
pub enum DirectEditError {
    #[error("no engine is bound to {user} on {server_url}")]
    NoBoundAccount { server_url: String, user: String },
    #[error("document {doc_id} is locked by {owner}")]
    LockedByOther { doc_id: String, owner: String },
    #[error("no edit in progress for {0}")]
    UnknownEdit(String),
    #[error("document {0} changed on the server, a decision is required")]
    ConflictPending(String),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("edit store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error("edit store migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// What the user asked to edit, as carried by an `edit` deep link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRequest {
    pub server_url: String,
    pub user: String,
    pub doc_id: String,
    pub file_name: String,
    pub download_url: Option<String>,
}

/// How a server-side change made during an edit is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Upload the local copy over the server's.
    Overwrite,
    /// Drop local changes and fetch the server's copy.
    Discard,
}

impl ConflictDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictDecision::Overwrite => "overwrite",
            ConflictDecision::Discard => "discard",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "overwrite" => Some(ConflictDecision::Overwrite),
            "discard" => Some(ConflictDecision::Discard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditRecord {
    pub doc_id: String,
    pub server_url: String,
    pub remote_user: String,
    pub file_name: String,
    pub local_path: PathBuf,
    /// Digest of the content both sides last agreed on.
    pub digest: Option<String>,
    pub algorithm: DigestAlgorithm,
    pub locked: bool,
    pub uploads: i64,
    pub pending_conflict: bool,
    pub decision: Option<ConflictDecision>,
    pub started_at: i64,
    pub updated_at: i64,
}

impl EditRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let local_path: String = row.try_get("local_path")?;
        let algorithm: String = row.try_get("digest_algorithm")?;
        let decision: Option<String> = row.try_get("decision")?;
        Ok(Self {
            doc_id: row.try_get("doc_id")?,
            server_url: row.try_get("server_url")?,
            remote_user: row.try_get("remote_user")?,
            file_name: row.try_get("file_name")?,
            local_path: PathBuf::from(local_path),
            digest: row.try_get("digest")?,
            algorithm: DigestAlgorithm::from_server(&algorithm),
            locked: row.try_get::<i64, _>("locked")? != 0,
            uploads: row.try_get("uploads")?,
            pending_conflict: row.try_get::<i64, _>("pending_conflict")? != 0,
            decision: decision.as_deref().and_then(ConflictDecision::parse),
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Edit records, kept apart from every engine database.
#[derive(Clone)]
pub struct EditStore {
    pool: SqlitePool,
}

impl EditStore {
    pub async fn open(path: &Path) -> Result<Self, DirectEditError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn get(&self, doc_id: &str) -> Result<Option<EditRecord>, DirectEditError> {
        let row = sqlx::query("SELECT * FROM edits WHERE doc_id = ?1")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(EditRecord::from_row).transpose()?)
    }

    pub async fn all(&self) -> Result<Vec<EditRecord>, DirectEditError> {
        let rows = sqlx::query("SELECT * FROM edits ORDER BY started_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(EditRecord::from_row)
            .collect::<Result<_, _>>()?)
    }

    pub async fn save(&self, record: &EditRecord) -> Result<(), DirectEditError> {
        sqlx::query(
            "INSERT OR REPLACE INTO edits (
                doc_id, server_url, remote_user, file_name, local_path, digest,
                digest_algorithm, locked, uploads, pending_conflict, decision,
                started_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(&record.doc_id)
        .bind(&record.server_url)
        .bind(&record.remote_user)
        .bind(&record.file_name)
        .bind(record.local_path.to_string_lossy().to_string())
        .bind(&record.digest)
        .bind(record.algorithm.as_str())
        .bind(i64::from(record.locked))
        .bind(record.uploads)
        .bind(i64::from(record.pending_conflict))
        .bind(record.decision.map(|d| d.as_str()))
        .bind(record.started_at)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, doc_id: &str) -> Result<(), DirectEditError> {
        sqlx::query("DELETE FROM edits WHERE doc_id = ?1")
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Hands a downloaded file to the desktop.
pub trait FileOpener: Send + Sync {
    fn open(&self, path: &Path) -> std::io::Result<()>;
}

/// Uses the platform's default application.
#[derive(Debug, Default)]
pub struct SystemOpener;

impl FileOpener for SystemOpener {
    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut command = if cfg!(target_os = "macos") {
            Command::new("open")
        } else if cfg!(windows) {
            let mut command = Command::new("cmd");
            command.args(["/C", "start", ""]);
            command
        } else {
            Command::new("xdg-open")
        };
        command
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }
}

/// What one poll did to one edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    Idle,
    Uploaded,
    Conflicted,
    Reverted,
    Finished,
}

/// Edit-in-place of single server documents under `<home>/edit`.
pub struct DirectEdit {
    config: ConfigHandle,
    store: EditStore,
    accounts: RwLock<HashMap<(String, String), RemoteClient>>,
    opener: Arc<dyn FileOpener>,
    open_files: Arc<dyn OpenFileSource>,
    seen_open: Mutex<HashSet<String>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    /// Edit folders written to since the last poll.
    changed: Arc<Mutex<HashSet<String>>>,
    events: EventSender,
    cancel: CancellationToken,
}

impl DirectEdit {
    pub async fn open(
        config: ConfigHandle,
        opener: Arc<dyn FileOpener>,
        open_files: Arc<dyn OpenFileSource>,
        events: EventSender,
    ) -> Result<Self, DirectEditError> {
        let store = EditStore::open(&config.snapshot().home.join(STORE_FILE_NAME)).await?;
        Ok(Self {
            config,
            store,
            accounts: RwLock::new(HashMap::new()),
            opener,
            open_files,
            seen_open: Mutex::new(HashSet::new()),
            watcher: Mutex::new(None),
            changed: Arc::new(Mutex::new(HashSet::new())),
            events,
            cancel: CancellationToken::new(),
        })
    }

    /// Makes `remote` the client for documents of `user` on `server_url`.
    pub fn register_account(&self, server_url: &str, user: &str, remote: RemoteClient) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_key(server_url, user), remote);
    }

    pub fn forget_account(&self, server_url: &str, user: &str) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&account_key(server_url, user));
    }

    fn remote_for(&self, server_url: &str, user: &str) -> Result<RemoteClient, DirectEditError> {
        self.accounts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account_key(server_url, user))
            .cloned()
            .ok_or_else(|| DirectEditError::NoBoundAccount {
                server_url: server_url.to_string(),
                user: user.to_string(),
            })
    }

    pub async fn edits(&self) -> Result<Vec<EditRecord>, DirectEditError> {
        self.store.all().await
    }

    pub async fn edit(&self, doc_id: &str) -> Result<Option<EditRecord>, DirectEditError> {
        self.store.get(doc_id).await
    }

    /// Locks, downloads and opens the document. An edit already in
    /// progress for the same document is simply reopened.
    pub async fn start(&self, request: &EditRequest) -> Result<PathBuf, DirectEditError> {
        let remote = self.remote_for(&request.server_url, &request.user)?;
        if let Some(existing) = self.store.get(&request.doc_id).await? {
            self.open_file(&existing.local_path);
            return Ok(existing.local_path);
        }
        if let Some(url) = &request.download_url {
            debug!(doc_id = %request.doc_id, url = %url, "download url supplied");
        }

        let locked = if self.config.snapshot().direct_edit_auto_lock {
            self.lock(&remote, request).await?
        } else {
            false
        };

        let algorithm = match remote.server_configuration().await {
            Ok(config) => DigestAlgorithm::from_server(&config.digest_algorithm),
            Err(err) => {
                debug!(error = %err, "server configuration unavailable, using md5");
                DigestAlgorithm::default()
            }
        };
        let target = self
            .config
            .snapshot()
            .edit_dir()
            .join(safe_filename(&request.doc_id))
            .join(safe_filename(&request.file_name));
        let digest = match self
            .transfers(&remote, algorithm)
            .download(None, 0, &request.doc_id, &target, &self.cancel)
            .await
        {
            Ok(digest) => digest,
            Err(err) => {
                if locked && let Err(unlock_err) = remote.unlock(&request.doc_id).await {
                    warn!(doc_id = %request.doc_id, error = %unlock_err, "failed to release lock");
                }
                return Err(err.into());
            }
        };

        let now = now_ms();
        let record = EditRecord {
            doc_id: request.doc_id.clone(),
            server_url: request.server_url.clone(),
            remote_user: request.user.clone(),
            file_name: request.file_name.clone(),
            local_path: target.clone(),
            digest: Some(digest),
            algorithm,
            locked,
            uploads: 0,
            pending_conflict: false,
            decision: None,
            started_at: now,
            updated_at: now,
        };
        self.store.save(&record).await?;
        self.changed().insert(edit_key(&record));
        info!(doc_id = %request.doc_id, path = %target.display(), locked, "direct edit started");
        let _ = self.events.send(EngineEvent::DirectEditStarted {
            doc_id: request.doc_id.clone(),
            path: target.to_string_lossy().to_string(),
        });
        self.open_file(&target);
        Ok(target)
    }

    async fn lock(&self, remote: &RemoteClient, request: &EditRequest) -> Result<bool, DirectEditError> {
        match remote.lock(&request.doc_id).await {
            Ok(_) => Ok(true),
            Err(RemoteError::Conflict { owner, .. }) => match owner {
                Some(owner) if owner == request.user => Ok(true),
                owner => Err(DirectEditError::LockedByOther {
                    doc_id: request.doc_id.clone(),
                    owner: owner.unwrap_or_else(|| "unknown".into()),
                }),
            },
            Err(err) => {
                warn!(doc_id = %request.doc_id, error = %err, "could not lock document, editing unlocked");
                Ok(false)
            }
        }
    }

    fn open_file(&self, path: &Path) {
        if let Err(err) = self.opener.open(path) {
            warn!(path = %path.display(), error = %err, "failed to open document");
        }
    }

    fn transfers(&self, remote: &RemoteClient, algorithm: DigestAlgorithm) -> TransferClient {
        TransferClient::new(remote.clone(), TRANSFER_ID, 1).with_algorithm(algorithm)
    }

    /// Records the user's answer to a conflict; the next poll acts on it.
    pub async fn resolve_conflict(
        &self,
        doc_id: &str,
        decision: ConflictDecision,
    ) -> Result<(), DirectEditError> {
        let mut record = self
            .store
            .get(doc_id)
            .await?
            .ok_or_else(|| DirectEditError::UnknownEdit(doc_id.to_string()))?;
        record.decision = Some(decision);
        self.store.save(&record).await?;
        info!(doc_id, decision = decision.as_str(), "direct edit conflict decided");
        Ok(())
    }

    /// One round over every edit: upload the files written since the last
    /// round, then finish the edits whose file was open and has been
    /// closed since. A file saved and closed between two rounds counts as
    /// opened.
    pub async fn poll_once(&self) -> Result<Vec<(String, PollAction)>, DirectEditError> {
        let check_all = self.watch_edits();
        let mut changed = std::mem::take(&mut *self.changed());
        let open: HashSet<PathBuf> = self
            .open_files
            .open_files()
            .into_iter()
            .map(|file| file.path)
            .collect();
        let mut actions = Vec::new();
        for mut record in self.store.all().await? {
            let doc_id = record.doc_id.clone();
            let key = edit_key(&record);
            let written = changed.remove(&key) || check_all;
            let action = if written || record.pending_conflict {
                match self.sync_record(&mut record).await {
                    Ok(action) => action,
                    Err(err) => {
                        warn!(doc_id = %doc_id, error = %err, "direct edit sync failed");
                        if written {
                            self.changed().insert(key);
                        }
                        continue;
                    }
                }
            } else {
                PollAction::Idle
            };
            let is_open = open.contains(&record.local_path);
            let was_open = if is_open {
                self.seen_open().insert(doc_id.clone());
                true
            } else {
                self.seen_open().contains(&doc_id) || action == PollAction::Uploaded
            };
            let action = if !is_open && was_open && !record.pending_conflict {
                match self.close_edit(&record).await {
                    Ok(()) => PollAction::Finished,
                    Err(err) => {
                        warn!(doc_id = %doc_id, error = %err, "failed to finish direct edit");
                        action
                    }
                }
            } else {
                action
            };
            actions.push((doc_id, action));
        }
        Ok(actions)
    }

    /// Starts the edit folder watcher when it is not running. Returns true
    /// when every edit has to be checked, which is the case right after
    /// the watcher starts and whenever it cannot be started.
    fn watch_edits(&self) -> bool {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.is_some() {
            return false;
        }
        let edit_dir = self.config.snapshot().edit_dir();
        match start_edit_watcher(&edit_dir, self.changed.clone()) {
            Ok(started) => {
                debug!(path = %edit_dir.display(), "watching direct edit folder");
                *watcher = Some(started);
            }
            Err(err) => warn!(error = %err, "direct edit watcher unavailable, checking every edit"),
        }
        true
    }

    /// Ends an edit on user request: a last upload, then cleanup.
    pub async fn finish(&self, doc_id: &str) -> Result<(), DirectEditError> {
        let mut record = self
            .store
            .get(doc_id)
            .await?
            .ok_or_else(|| DirectEditError::UnknownEdit(doc_id.to_string()))?;
        self.sync_record(&mut record).await?;
        if record.pending_conflict {
            return Err(DirectEditError::ConflictPending(doc_id.to_string()));
        }
        self.close_edit(&record).await
    }

    async fn sync_record(&self, record: &mut EditRecord) -> Result<PollAction, DirectEditError> {
        if !tokio::fs::try_exists(&record.local_path).await? {
            return Ok(PollAction::Idle);
        }
        let current = file_digest(&record.local_path, record.algorithm).await?;
        let changed = record
            .digest
            .as_deref()
            .is_none_or(|known| !same_digest(known, &current));
        if !changed && !record.pending_conflict {
            return Ok(PollAction::Idle);
        }
        let remote = self.remote_for(&record.server_url, &record.remote_user)?;

        match record.decision {
            None => {
                if record.pending_conflict {
                    return Ok(PollAction::Conflicted);
                }
                let server = remote.document(&record.doc_id).await?;
                let server_changed = match (&server.digest, &record.digest) {
                    (Some(theirs), Some(ours)) => !same_digest(theirs, ours),
                    _ => false,
                };
                if server_changed {
                    record.pending_conflict = true;
                    self.store.save(record).await?;
                    warn!(doc_id = %record.doc_id, "document changed on the server during edit");
                    let _ = self.events.send(EngineEvent::DirectEditConflict {
                        doc_id: record.doc_id.clone(),
                        path: record.local_path.to_string_lossy().to_string(),
                    });
                    return Ok(PollAction::Conflicted);
                }
                self.upload(&remote, record, current).await
            }
            Some(ConflictDecision::Overwrite) => self.upload(&remote, record, current).await,
            Some(ConflictDecision::Discard) => {
                let digest = self
                    .transfers(&remote, record.algorithm)
                    .download(None, 0, &record.doc_id, &record.local_path, &self.cancel)
                    .await?;
                record.digest = Some(digest);
                record.pending_conflict = false;
                record.decision = None;
                self.store.save(record).await?;
                info!(doc_id = %record.doc_id, "local changes discarded");
                Ok(PollAction::Reverted)
            }
        }
    }

    async fn upload(
        &self,
        remote: &RemoteClient,
        record: &mut EditRecord,
        digest: String,
    ) -> Result<PollAction, DirectEditError> {
        let request = UploadRequest {
            doc_pair_id: 0,
            source: &record.local_path,
            file_name: &record.file_name,
            commit: CommitRequest {
                operation: CommitOperation::UpdateDocument,
                target_parent: None,
                name: None,
                target_ref: Some(record.doc_id.clone()),
            },
        };
        self.transfers(remote, record.algorithm)
            .upload(None, request, &self.cancel)
            .await?;
        record.digest = Some(digest);
        record.uploads += 1;
        record.pending_conflict = false;
        record.decision = None;
        self.store.save(record).await?;
        info!(doc_id = %record.doc_id, uploads = record.uploads, "direct edit uploaded");
        let _ = self.events.send(EngineEvent::DirectEditUploaded {
            doc_id: record.doc_id.clone(),
        });
        Ok(PollAction::Uploaded)
    }

    async fn close_edit(&self, record: &EditRecord) -> Result<(), DirectEditError> {
        if record.locked {
            match self.remote_for(&record.server_url, &record.remote_user) {
                Ok(remote) => match remote.unlock(&record.doc_id).await {
                    Ok(()) | Err(RemoteError::NotFound(_)) => {}
                    Err(err) => warn!(doc_id = %record.doc_id, error = %err, "failed to unlock document"),
                },
                Err(err) => warn!(doc_id = %record.doc_id, error = %err, "lock left in place"),
            }
        }
        self.store.delete(&record.doc_id).await?;
        if let Some(dir) = record.local_path.parent() {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.seen_open().remove(&record.doc_id);
        self.changed().remove(&edit_key(record));
        info!(doc_id = %record.doc_id, "direct edit finished");
        let _ = self.events.send(EngineEvent::DirectEditFinished {
            doc_id: record.doc_id.clone(),
        });
        Ok(())
    }

    fn seen_open(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.seen_open.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn changed(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.changed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Interrupts transfers in flight and stops watching the edit folder.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

fn account_key(server_url: &str, user: &str) -> (String, String) {
    (server_url.trim_end_matches('/').to_string(), user.to_string())
}

/// Name of the folder holding the edited file, directly under the edit dir.
fn edit_key(record: &EditRecord) -> String {
    record
        .local_path
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn edit_key_of(root: &Path, path: &Path) -> Option<String> {
    match path.strip_prefix(root).ok()?.components().next()? {
        Component::Normal(name) => Some(name.to_string_lossy().to_string()),
        _ => None,
    }
}

fn writes_content(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Watches the edit dir and records which edit folders see writes.
fn start_edit_watcher(
    edit_dir: &Path,
    changed: Arc<Mutex<HashSet<String>>>,
) -> Result<RecommendedWatcher, DirectEditError> {
    std::fs::create_dir_all(edit_dir)?;
    let root = std::fs::canonicalize(edit_dir)?;
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) if writes_content(&event.kind) => {
            let mut changed = changed.lock().unwrap_or_else(PoisonError::into_inner);
            changed.extend(
                event
                    .paths
                    .iter()
                    .filter_map(|path| edit_key_of(&watch_root, path)),
            );
        }
        Ok(_) => {}
        Err(err) => warn!(error = %err, "direct edit watcher error"),
    })?;
    watcher.watch(&root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

#[cfg(test)]
#[path = "direct_edit_tests.rs"]
mod tests;
