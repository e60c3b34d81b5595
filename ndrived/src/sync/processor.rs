use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ndrive_core::{CommitOperation, CommitRequest, CommitResult, Document, RemoteError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::conflict::dedup_name;
use super::digest::same_digest;
use super::engine::EngineContext;
use super::errors::SyncErrorKind;
use super::local_client::{FileInfo, LocalClientError, safe_filename};
use super::pair_state::{PairState, SideState};
use super::paths;
use super::queue::{QueueKind, backoff_exhausted, retry_delay};
use super::state_db::{DocPair, StateDbError, now_ms};
use super::transfer::{TransferError, UploadRequest};
use crate::config::DeletePolicy;
use crate::events::EngineEvent;

const PARENT_RETRY: Duration = Duration::from_secs(2);
/// Short postponements before a missing parent counts as a row error.
const PARENT_WAITS: u32 = 15;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Local(#[from] LocalClientError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error(transparent)]
    State(#[from] StateDbError),
    #[error("parent of {0} is not synchronized yet")]
    ParentNotReady(String),
    #[error("row {0} has no remote reference")]
    MissingRef(i64),
    #[error("engine is shutting down")]
    Cancelled,
}

impl ProcessorError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            ProcessorError::Remote(err) => SyncErrorKind::from_remote(err),
            ProcessorError::Local(err) => match err {
                LocalClientError::Io(io) => SyncErrorKind::from_io(io),
                LocalClientError::NotFound(_) | LocalClientError::AlreadyExists(_) => {
                    SyncErrorKind::LocalIo
                }
                LocalClientError::Path(_) | LocalClientError::Pattern(_) => SyncErrorKind::Internal,
            },
            ProcessorError::Transfer(err) => match err {
                TransferError::Remote(remote) => SyncErrorKind::from_remote(remote),
                TransferError::Io(io) => SyncErrorKind::from_io(io),
                TransferError::Corrupt { .. } | TransferError::Truncated { .. } => {
                    SyncErrorKind::Corrupt
                }
                TransferError::Paused
                | TransferError::ConcurrencyClosed
                | TransferError::Incomplete { .. } => SyncErrorKind::Transient,
                TransferError::State(_) => SyncErrorKind::Internal,
            },
            ProcessorError::State(_) | ProcessorError::MissingRef(_) => SyncErrorKind::Internal,
            ProcessorError::ParentNotReady(_) | ProcessorError::Cancelled => {
                SyncErrorKind::Transient
            }
        }
    }
}

/// What to do with a claimed row once its handler returns.
#[derive(Debug)]
enum Outcome {
    Save(Box<DocPair>),
    Purge,
    Conflict,
    Release,
}

fn save(pair: DocPair) -> Result<Outcome, ProcessorError> {
    Ok(Outcome::Save(Box::new(pair)))
}

/// One worker: claims rows popped from its queues and runs the handler
/// for their pair state.
pub struct Processor {
    ctx: Weak<EngineContext>,
    id: i64,
}

impl Processor {
    pub fn new(ctx: Weak<EngineContext>, id: i64) -> Self {
        Self { ctx, id }
    }

    pub async fn run_folder_worker(self, kind: QueueKind, cancel: CancellationToken) {
        loop {
            let Some(ctx) = self.ctx.upgrade() else { break };
            let Some(id) = ctx.queues.pop(kind, &cancel).await else {
                break;
            };
            self.process(&ctx, id, &cancel).await;
            ctx.queues.done(id);
        }
        debug!(processor = self.id, ?kind, "folder worker stopped");
    }

    pub async fn run_file_worker(self, prefer_local: bool, cancel: CancellationToken) {
        loop {
            let Some(ctx) = self.ctx.upgrade() else { break };
            let Some(id) = ctx.queues.pop_file(prefer_local, &cancel).await else {
                break;
            };
            self.process(&ctx, id, &cancel).await;
            ctx.queues.done(id);
        }
        debug!(processor = self.id, "file worker stopped");
    }

    /// Processes row `id` once. Returns false when the engine is gone.
    pub async fn process_one(&self, id: i64, cancel: &CancellationToken) -> bool {
        let Some(ctx) = self.ctx.upgrade() else {
            return false;
        };
        self.process(&ctx, id, cancel).await;
        true
    }

    async fn process(&self, ctx: &Arc<EngineContext>, id: i64, cancel: &CancellationToken) {
        match ctx.db.claim(id, self.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(id, processor = self.id, "row owned by another worker");
                return;
            }
            Err(err) => {
                warn!(id, error = %err, "claim failed");
                return;
            }
        }
        let pair = match ctx.db.get(id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => return,
            Err(err) => {
                warn!(id, error = %err, "row read failed");
                self.release(ctx, id).await;
                return;
            }
        };

        let state = pair.derived_state();
        let result = if cancel.is_cancelled() {
            Err(ProcessorError::Cancelled)
        } else if !state.is_idle() && !ctx.kind.handles(state) {
            debug!(id, state = state.as_str(), kind = ctx.kind.name(), "state not handled by engine, detaching");
            let mut done = pair.clone();
            done.suspended_local_state = Some(done.local_state);
            done.local_state = SideState::Unsynchronized;
            save(done)
        } else {
            debug!(id, path = %pair.local_path, state = state.as_str(), "processing");
            self.dispatch(ctx, &pair, state, cancel).await
        };

        if !matches!(result, Err(ProcessorError::ParentNotReady(_))) {
            ctx.clear_parent_wait(id);
        }
        let finished = match result {
            Ok(outcome) => self.finish(ctx, &pair, outcome).await,
            Err(err) => {
                self.fail(ctx, &pair, err).await;
                Ok(())
            }
        };
        if let Err(err) = finished {
            error!(id, error = %err, "failed to record processing result");
            self.release(ctx, id).await;
        }
    }

    async fn dispatch(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        state: PairState,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ProcessorError> {
        let live_ref = pair
            .remote_ref
            .as_deref()
            .filter(|_| pair.remote_state != SideState::Deleted);
        match state {
            PairState::LocallyCreated | PairState::LocallyModified => match live_ref {
                Some(remote_ref) => self.push_content(ctx, pair, remote_ref, false, cancel).await,
                None => self.push_new(ctx, pair, cancel).await,
            },
            PairState::LocallyResolved => match live_ref {
                Some(remote_ref) => self.push_content(ctx, pair, remote_ref, true, cancel).await,
                None => self.push_new(ctx, pair, cancel).await,
            },
            PairState::LocallyMoved => match live_ref {
                Some(remote_ref) => self.push_move(ctx, pair, remote_ref).await,
                None => self.push_new(ctx, pair, cancel).await,
            },
            PairState::LocallyDeleted => self.push_delete(ctx, pair).await,
            PairState::RemotelyCreated => self.pull_new(ctx, pair, cancel).await,
            PairState::RemotelyModified => self.pull_content(ctx, pair, cancel).await,
            PairState::RemotelyMoved => self.pull_move(ctx, pair).await,
            PairState::RemotelyDeleted => self.pull_delete(ctx, pair).await,
            PairState::Conflicted => self.check_conflict(ctx, pair).await,
            PairState::Deleted => Ok(Outcome::Purge),
            PairState::Synchronized
            | PairState::Unknown
            | PairState::Unsynchronized
            | PairState::DirectTransfer => Ok(Outcome::Release),
        }
    }

    // Local to remote.

    async fn push_new(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ProcessorError> {
        let mut done = pair.clone();
        let Some(info) = ctx.local.get_info(&pair.local_path).await? else {
            done.local_state = SideState::Deleted;
            if done.remote_state != SideState::Deleted {
                done.remote_state = SideState::Unknown;
            }
            return save(done);
        };
        let parent_ref = self.remote_parent_ref(ctx, pair).await?;
        done.remote_ref = None;
        done.remote_state = SideState::Unknown;
        let local_digest = if info.folderish {
            None
        } else {
            Some(local_digest(ctx, pair, &info).await?)
        };
        record_disk(&mut done, &info, local_digest.clone());

        let siblings = ctx.remote.children(&parent_ref).await?;
        if let Some(doc) = self
            .attachable(ctx, &siblings, &pair.local_name, info.folderish, local_digest.as_deref())
            .await?
        {
            let mut doc = doc.clone();
            if safe_filename(&doc.name) != pair.local_name {
                info!(path = %pair.local_path, uid = %doc.uid, "same content found remotely, renaming it");
                doc = ctx
                    .remote
                    .move_document(&doc.uid, &parent_ref, &pair.local_name)
                    .await?;
            }
            attach(&mut done, &doc, &parent_ref);
            let same = info.folderish
                || matches!((doc.digest.as_deref(), local_digest.as_deref()),
                    (Some(remote), Some(local)) if same_digest(remote, local));
            if same {
                done.set_synchronized();
            } else {
                // Both sides created different content under one name.
                done.remote_state = SideState::Created;
            }
            tag(ctx, &done);
            return save(done);
        }

        let (remote_ref, remote_digest) = if info.folderish {
            let doc = ctx.remote.mkdir(&parent_ref, &pair.local_name).await?;
            done.remote_name = Some(doc.name.clone());
            (doc.uid, None)
        } else {
            let commit = CommitRequest {
                operation: CommitOperation::CreateDocument,
                target_parent: Some(parent_ref.clone()),
                name: Some(pair.local_name.clone()),
                target_ref: None,
            };
            let result = self.upload(ctx, pair, commit, cancel).await?;
            done.remote_name = Some(pair.local_name.clone());
            (result.new_ref, result.digest.or(local_digest))
        };
        info!(path = %pair.local_path, uid = %remote_ref, "created remotely");
        done.remote_ref = Some(remote_ref);
        done.remote_parent_ref = Some(parent_ref);
        done.remote_digest = remote_digest;
        done.set_synchronized();
        tag(ctx, &done);
        save(done)
    }

    async fn push_content(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        remote_ref: &str,
        overwrite: bool,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ProcessorError> {
        let mut done = pair.clone();
        let Some(info) = ctx.local.get_info(&pair.local_path).await? else {
            // The watcher records the deletion.
            return Ok(Outcome::Release);
        };
        if info.folderish {
            done.set_synchronized();
            return save(done);
        }
        let digest = local_digest(ctx, pair, &info).await?;
        record_disk(&mut done, &info, Some(digest.clone()));

        if !overwrite {
            if pair
                .remote_digest
                .as_deref()
                .is_some_and(|remote| same_digest(remote, &digest))
            {
                done.set_synchronized();
                return save(done);
            }
            let doc = match ctx.remote.document(remote_ref).await {
                Ok(doc) => doc,
                Err(RemoteError::NotFound(_)) => {
                    done.remote_state = SideState::Deleted;
                    return save(done);
                }
                Err(err) => return Err(err.into()),
            };
            if let (Some(server), Some(known)) = (doc.digest.as_deref(), pair.remote_digest.as_deref())
                && !same_digest(server, known)
            {
                done.remote_digest = Some(server.to_string());
                if same_digest(server, &digest) {
                    done.set_synchronized();
                } else {
                    info!(path = %pair.local_path, "server content changed too, conflict");
                    done.remote_state = SideState::Modified;
                }
                return save(done);
            }
        }

        let commit = CommitRequest {
            operation: CommitOperation::UpdateDocument,
            target_parent: None,
            name: None,
            target_ref: Some(remote_ref.to_string()),
        };
        match self.upload(ctx, pair, commit, cancel).await {
            Ok(result) => {
                info!(path = %pair.local_path, uid = %remote_ref, "content uploaded");
                done.remote_ref = Some(result.new_ref);
                done.remote_digest = Some(result.digest.unwrap_or(digest));
                done.set_synchronized();
                tag(ctx, &done);
            }
            Err(ProcessorError::Transfer(TransferError::Remote(RemoteError::Conflict {
                message,
                ..
            }))) => {
                info!(path = %pair.local_path, %message, "server rejected the update, conflict");
                done.remote_state = SideState::Modified;
            }
            Err(ProcessorError::Transfer(TransferError::Remote(RemoteError::NotFound(_)))) => {
                done.remote_state = SideState::Deleted;
            }
            Err(err) => return Err(err),
        }
        save(done)
    }

    async fn push_move(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        remote_ref: &str,
    ) -> Result<Outcome, ProcessorError> {
        let parent_ref = self.remote_parent_ref(ctx, pair).await?;
        let mut done = pair.clone();
        let unchanged = pair.remote_parent_ref.as_deref() == Some(parent_ref.as_str())
            && pair.remote_name.as_deref() == Some(pair.local_name.as_str());
        if !unchanged {
            let siblings = ctx.remote.children(&parent_ref).await?;
            let taken: HashSet<&str> = siblings
                .iter()
                .filter(|doc| doc.uid != remote_ref)
                .map(|doc| doc.name.as_str())
                .collect();
            let name = dedup_name(&pair.local_name, pair.folderish, |n| taken.contains(n));
            if name != pair.local_name {
                let renamed = ctx.local.rename(&pair.local_path, &name).await?;
                info!(from = %pair.local_path, to = %renamed, "name taken remotely, renamed locally");
                self.relocate(ctx, &mut done, &renamed).await?;
            }
            let doc = match ctx.remote.move_document(remote_ref, &parent_ref, &name).await {
                Ok(doc) => doc,
                Err(RemoteError::NotFound(_)) => {
                    done.remote_state = SideState::Deleted;
                    return save(done);
                }
                Err(err) => return Err(err.into()),
            };
            info!(path = %done.local_path, uid = %remote_ref, "moved remotely");
            done.remote_parent_ref = Some(parent_ref);
            done.remote_name = Some(doc.name);
            if let Some(digest) = doc.digest.filter(|_| !pair.folderish) {
                done.remote_digest = Some(digest);
            }
        }
        done.local_state = SideState::Synchronized;
        done.clear_error();
        if !done.folderish
            && let Some(info) = ctx.local.get_info(&done.local_path).await?
        {
            let digest = local_digest(ctx, &done, &info).await?;
            let changed = done
                .remote_digest
                .as_deref()
                .is_none_or(|remote| !same_digest(remote, &digest));
            record_disk(&mut done, &info, Some(digest));
            if changed {
                done.local_state = SideState::Modified;
            }
        }
        save(done)
    }

    async fn push_delete(&self, ctx: &EngineContext, pair: &DocPair) -> Result<Outcome, ProcessorError> {
        let Some(remote_ref) = pair.remote_ref.as_deref() else {
            return Ok(Outcome::Purge);
        };
        if ctx.config.snapshot().delete_policy == DeletePolicy::Unsync {
            let mut done = pair.clone();
            done.suspended_local_state = Some(SideState::Deleted);
            done.local_state = SideState::Unsynchronized;
            done.clear_error();
            info!(path = %pair.local_path, "deleted locally, kept on the server");
            return save(done);
        }
        if let Some(parent) = self.parent_row(ctx, pair).await?
            && parent.pair_state == PairState::LocallyDeleted
            && parent.remote_ref.is_some()
        {
            // Removed on the server together with its parent.
            return Ok(Outcome::Purge);
        }
        match ctx.remote.delete(remote_ref).await {
            Ok(()) | Err(RemoteError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        info!(path = %pair.local_path, uid = %remote_ref, "deleted remotely");
        Ok(Outcome::Purge)
    }

    // Remote to local.

    async fn pull_new(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ProcessorError> {
        let remote_ref = pair.remote_ref.clone().ok_or(ProcessorError::MissingRef(pair.id))?;
        let parent = self.local_target_parent(ctx, pair).await?;
        let mut done = pair.clone();
        let target = self.free_local_path(ctx, pair, &parent.local_path).await?;
        if target != pair.local_path {
            self.relocate(ctx, &mut done, &target).await?;
        }

        let digest = if pair.folderish {
            ctx.local
                .mkdir(&parent.local_path, paths::name(&done.local_path))
                .await?;
            None
        } else {
            match ctx.local.get_info(&done.local_path).await? {
                Some(existing) if !existing.folderish => {
                    let local = local_digest(ctx, &done, &existing).await?;
                    let matches = pair
                        .remote_digest
                        .as_deref()
                        .is_some_and(|remote| same_digest(remote, &local));
                    if !matches {
                        // An untracked file already sits there: both sides created it.
                        record_disk(&mut done, &existing, Some(local));
                        done.local_state = SideState::Created;
                        return save(done);
                    }
                    Some(local)
                }
                _ => Some(self.download(ctx, &done, &remote_ref, cancel).await?),
            }
        };
        self.finish_pull(ctx, done, digest).await
    }

    async fn pull_content(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        cancel: &CancellationToken,
    ) -> Result<Outcome, ProcessorError> {
        let remote_ref = pair.remote_ref.clone().ok_or(ProcessorError::MissingRef(pair.id))?;
        let mut done = pair.clone();
        let info = ctx.local.get_info(&pair.local_path).await?;
        if pair.folderish || info.as_ref().is_some_and(|i| i.folderish) {
            done.set_synchronized();
            return save(done);
        }
        if let Some(info) = &info {
            let local = local_digest(ctx, pair, info).await?;
            if pair
                .remote_digest
                .as_deref()
                .is_some_and(|remote| same_digest(remote, &local))
            {
                record_disk(&mut done, info, Some(local));
                done.set_synchronized();
                return save(done);
            }
            let edited = pair.size.is_some_and(|size| size != info.size as i64)
                || pair
                    .last_local_updated
                    .is_some_and(|mtime| mtime != info.mtime);
            if edited {
                // Edited locally after the last sync and not recorded yet.
                record_disk(&mut done, info, Some(local));
                done.local_state = SideState::Modified;
                return save(done);
            }
        } else {
            let parent = self.local_target_parent(ctx, pair).await?;
            debug!(path = %pair.local_path, parent = %parent.local_path, "local copy missing, downloading again");
        }
        let digest = self.download(ctx, &done, &remote_ref, cancel).await?;
        self.finish_pull(ctx, done, Some(digest)).await
    }

    async fn pull_move(&self, ctx: &EngineContext, pair: &DocPair) -> Result<Outcome, ProcessorError> {
        let parent = self.local_target_parent(ctx, pair).await?;
        let mut done = pair.clone();
        let target = self.free_local_path(ctx, pair, &parent.local_path).await?;

        if target != pair.local_path {
            if !ctx.local.exists(&pair.local_path).await {
                self.relocate(ctx, &mut done, &target).await?;
                done.local_state = SideState::Unknown;
                done.remote_state = SideState::Created;
                return save(done);
            }
            let moved = ctx
                .local
                .move_to(&pair.local_path, &parent.local_path, Some(paths::name(&target)))
                .await?;
            info!(from = %pair.local_path, to = %moved, "moved locally");
            self.relocate(ctx, &mut done, &moved).await?;
        }

        done.remote_state = SideState::Synchronized;
        if done.local_state == SideState::Moved {
            done.local_state = SideState::Synchronized;
        }
        done.clear_error();
        if !done.folderish
            && let Some(info) = ctx.local.get_info(&done.local_path).await?
        {
            let digest = local_digest(ctx, &done, &info).await?;
            let stale = done
                .remote_digest
                .as_deref()
                .is_some_and(|remote| !same_digest(remote, &digest));
            record_disk(&mut done, &info, Some(digest));
            if stale && done.local_state == SideState::Synchronized {
                done.remote_state = SideState::Modified;
            }
        }
        save(done)
    }

    async fn pull_delete(&self, ctx: &EngineContext, pair: &DocPair) -> Result<Outcome, ProcessorError> {
        if ctx.config.snapshot().delete_policy == DeletePolicy::Unsync {
            let mut done = pair.clone();
            done.suspended_local_state = Some(done.local_state);
            done.local_state = SideState::Unsynchronized;
            done.clear_error();
            info!(path = %pair.local_path, "deleted remotely, kept on disk");
            return save(done);
        }
        if let Some(parent) = self.parent_row(ctx, pair).await?
            && parent.pair_state == PairState::RemotelyDeleted
        {
            return Ok(Outcome::Purge);
        }
        ctx.local.delete(&pair.local_path).await?;
        info!(path = %pair.local_path, "deleted locally");
        Ok(Outcome::Purge)
    }

    async fn check_conflict(&self, ctx: &EngineContext, pair: &DocPair) -> Result<Outcome, ProcessorError> {
        let mut done = pair.clone();
        if pair.folderish {
            done.set_synchronized();
            return save(done);
        }
        let Some(info) = ctx.local.get_info(&pair.local_path).await? else {
            return Ok(Outcome::Release);
        };
        let local = local_digest(ctx, pair, &info).await?;
        if pair
            .remote_digest
            .as_deref()
            .is_some_and(|remote| same_digest(remote, &local))
        {
            debug!(path = %pair.local_path, "both sides hold the same content");
            record_disk(&mut done, &info, Some(local));
            done.set_synchronized();
            tag(ctx, &done);
            return save(done);
        }
        Ok(Outcome::Conflict)
    }

    // Helpers.

    async fn download(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        remote_ref: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ProcessorError> {
        let target = ctx.local.abspath(&pair.local_path)?;
        let locked = match ctx.local.get_info(&pair.local_path).await? {
            Some(info) if !info.folderish => Some(ctx.local.lock_ref(&pair.local_path)?),
            _ => None,
        };
        let digest = ctx
            .transfers()
            .download(Some(&ctx.db), pair.id, remote_ref, &target, cancel)
            .await;
        if let Some(was_readonly) = locked {
            unlock(ctx, &pair.local_path, was_readonly);
        }
        let digest = digest?;
        info!(path = %pair.local_path, uid = %remote_ref, "content downloaded");
        Ok(digest)
    }

    /// Uploads the row's file, read-only for the duration of the transfer.
    async fn upload(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        commit: CommitRequest,
        cancel: &CancellationToken,
    ) -> Result<CommitResult, ProcessorError> {
        let source = ctx.local.abspath(&pair.local_path)?;
        let was_readonly = ctx.local.lock_ref(&pair.local_path)?;
        let result = ctx
            .transfers()
            .upload(
                Some(&ctx.db),
                UploadRequest {
                    doc_pair_id: pair.id,
                    source: &source,
                    file_name: &pair.local_name,
                    commit,
                },
                cancel,
            )
            .await;
        unlock(ctx, &pair.local_path, was_readonly);
        Ok(result?)
    }

    async fn finish_pull(
        &self,
        ctx: &EngineContext,
        mut done: DocPair,
        digest: Option<String>,
    ) -> Result<Outcome, ProcessorError> {
        let Some(info) = ctx.local.get_info(&done.local_path).await? else {
            return Err(LocalClientError::NotFound(done.local_path.clone()).into());
        };
        if done.remote_digest.is_none() {
            done.remote_digest = digest.clone();
        }
        record_disk(&mut done, &info, digest);
        done.set_synchronized();
        tag(ctx, &done);
        save(done)
    }

    async fn parent_row(&self, ctx: &EngineContext, pair: &DocPair) -> Result<Option<DocPair>, ProcessorError> {
        match paths::parent(&pair.local_path) {
            Some(parent) => Ok(ctx.db.get_by_path(parent).await?),
            None => Ok(None),
        }
    }

    /// Server id of the folder the row sits in on disk.
    async fn remote_parent_ref(&self, ctx: &EngineContext, pair: &DocPair) -> Result<String, ProcessorError> {
        let not_ready = || ProcessorError::ParentNotReady(pair.local_path.clone());
        let parent = self.parent_row(ctx, pair).await?.ok_or_else(not_ready)?;
        if parent.remote_state == SideState::Deleted {
            return Err(not_ready());
        }
        parent.remote_ref.ok_or_else(not_ready)
    }

    /// Row of the folder the server places this object in. It must exist on disk.
    async fn local_target_parent(&self, ctx: &EngineContext, pair: &DocPair) -> Result<DocPair, ProcessorError> {
        let not_ready = || ProcessorError::ParentNotReady(pair.local_path.clone());
        let parent = match pair.remote_parent_ref.as_deref() {
            Some(parent_ref) => ctx.db.get_by_ref(parent_ref).await?,
            None => self.parent_row(ctx, pair).await?,
        }
        .ok_or_else(not_ready)?;
        if !parent.is_root() && !ctx.local.exists(&parent.local_path).await {
            return Err(not_ready());
        }
        Ok(parent)
    }

    /// Where the row's remote name lands under `parent`, numbered when
    /// another row already holds that name.
    async fn free_local_path(
        &self,
        ctx: &EngineContext,
        pair: &DocPair,
        parent: &str,
    ) -> Result<String, ProcessorError> {
        let wanted = safe_filename(pair.remote_name.as_deref().unwrap_or(&pair.local_name));
        let taken: HashSet<String> = ctx
            .db
            .children(parent)
            .await?
            .into_iter()
            .filter(|row| row.id != pair.id)
            .map(|row| row.local_name)
            .collect();
        let name = dedup_name(&wanted, pair.folderish, |n| taken.contains(n));
        Ok(paths::join(parent, &name))
    }

    /// Commits a new local path for the row and its descendants right away,
    /// so watcher events for the new location find the row.
    async fn relocate(&self, ctx: &EngineContext, done: &mut DocPair, target: &str) -> Result<(), ProcessorError> {
        let from = std::mem::replace(&mut done.local_path, target.to_string());
        let mut txn = ctx.db.write().await?;
        if let Some(mut row) = txn.get(done.id).await? {
            row.local_path = target.to_string();
            txn.save(&mut row).await?;
            txn.rebase_tree(&from, target).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Searches `siblings` for a server object this new local one should be
    /// bound to instead of creating a duplicate.
    async fn attachable<'a>(
        &self,
        ctx: &EngineContext,
        siblings: &'a [Document],
        name: &str,
        folderish: bool,
        digest: Option<&str>,
    ) -> Result<Option<&'a Document>, ProcessorError> {
        let mut by_digest = None;
        for doc in siblings.iter().filter(|doc| doc.folderish == folderish) {
            if ctx.db.get_by_ref(&doc.uid).await?.is_some() {
                continue;
            }
            if safe_filename(&doc.name) == name {
                return Ok(Some(doc));
            }
            let same_content = matches!((doc.digest.as_deref(), digest),
                (Some(remote), Some(local)) if same_digest(remote, local));
            if by_digest.is_none() && !folderish && same_content {
                by_digest = Some(doc);
            }
        }
        Ok(by_digest)
    }

    async fn finish(&self, ctx: &EngineContext, original: &DocPair, outcome: Outcome) -> Result<(), StateDbError> {
        match outcome {
            Outcome::Save(mut done) => {
                let mut txn = ctx.db.write().await?;
                let Some(current) = txn.get(done.id).await? else {
                    return Ok(());
                };
                if current.version != original.version {
                    merge_concurrent(original, &current, &mut done);
                }
                done.processor = 0;
                txn.save(&mut done).await?;
                txn.commit().await?;
                if done.pair_state == PairState::Synchronized {
                    let _ = ctx.events.send(EngineEvent::Synced {
                        engine: ctx.uid.clone(),
                        row_id: done.id,
                        path: done.local_path.clone(),
                    });
                } else {
                    debug!(id = done.id, state = done.pair_state.as_str(), "row left for another pass");
                }
            }
            Outcome::Purge => {
                let mut txn = ctx.db.write().await?;
                let Some(mut current) = txn.get(original.id).await? else {
                    return Ok(());
                };
                if current.local_state != original.local_state
                    && !matches!(current.local_state, SideState::Deleted | SideState::Unknown)
                {
                    // The object reappeared on disk meanwhile: push it again.
                    current.remote_ref = None;
                    current.remote_parent_ref = None;
                    current.remote_digest = None;
                    current.remote_state = SideState::Unknown;
                    current.local_state = SideState::Created;
                    current.processor = 0;
                    txn.save(&mut current).await?;
                } else if current.folderish {
                    txn.purge_tree(&current.local_path).await?;
                } else {
                    txn.purge(current.id).await?;
                }
                txn.commit().await?;
            }
            Outcome::Conflict => {
                let mut txn = ctx.db.write().await?;
                txn.mark_checked(original.id).await?;
                txn.commit().await?;
                self.release(ctx, original.id).await;
                warn!(path = %original.local_path, "conflict needs a decision");
                let _ = ctx.events.send(EngineEvent::Conflict {
                    engine: ctx.uid.clone(),
                    row_id: original.id,
                    path: original.local_path.clone(),
                });
            }
            Outcome::Release => self.release(ctx, original.id).await,
        }
        Ok(())
    }

    async fn fail(&self, ctx: &EngineContext, pair: &DocPair, err: ProcessorError) {
        match &err {
            ProcessorError::Cancelled | ProcessorError::Transfer(TransferError::Paused) => {
                debug!(id = pair.id, "processing interrupted");
                self.release(ctx, pair.id).await;
                return;
            }
            ProcessorError::ParentNotReady(path) => {
                let waits = ctx.note_parent_wait(pair.id);
                if waits > PARENT_WAITS {
                    info!(id = pair.id, %path, waits, "parent still missing, counting as an error");
                    return self.record_error(ctx, pair, err).await;
                }
                debug!(id = pair.id, %path, "waiting for the parent");
                let retry_at = now_ms() + PARENT_RETRY.as_millis() as i64;
                let updated = ctx
                    .db
                    .update_pair(pair.id, |row| {
                        row.processor = 0;
                        row.retry_after = Some(retry_at);
                    })
                    .await;
                if let Err(err) = updated {
                    warn!(id = pair.id, error = %err, "failed to postpone row");
                    self.release(ctx, pair.id).await;
                }
                return;
            }
            _ => {}
        }
        self.record_error(ctx, pair, err).await;
    }

    /// Counts the error on the row, backing it off or detaching it.
    async fn record_error(&self, ctx: &EngineContext, pair: &DocPair, err: ProcessorError) {
        let kind = err.kind();
        let message = err.to_string();
        match kind {
            SyncErrorKind::AuthExpired => {
                warn!(id = pair.id, path = %pair.local_path, "credentials rejected");
                let _ = ctx.events.send(EngineEvent::AuthExpired {
                    engine: ctx.uid.clone(),
                });
            }
            SyncErrorKind::NoSpaceLeft => {
                error!(id = pair.id, path = %pair.local_path, "no space left on device");
                let _ = ctx.events.send(EngineEvent::NoSpaceLeft {
                    engine: ctx.uid.clone(),
                });
            }
            SyncErrorKind::Internal => {
                error!(id = pair.id, path = %pair.local_path, error = ?err, "internal error");
            }
            _ => warn!(id = pair.id, path = %pair.local_path, kind = kind.code(), error = %message, "processing failed"),
        }

        let max_errors = ctx.config.snapshot().max_errors;
        let orphan = matches!(err, ProcessorError::ParentNotReady(_));
        let now = now_ms();
        let updated = ctx
            .db
            .update_pair(pair.id, |row| {
                row.processor = 0;
                row.last_error = Some(kind.code().to_string());
                row.last_error_details = Some(message.clone());
                row.last_sync_error_date = Some(now);
                if kind.is_permanent() || (orphan && backoff_exhausted(row.error_count, max_errors)) {
                    if row.local_state != SideState::Unsynchronized {
                        row.suspended_local_state = Some(row.local_state);
                        row.local_state = SideState::Unsynchronized;
                    }
                    return;
                }
                match kind {
                    SyncErrorKind::AuthExpired => {}
                    SyncErrorKind::Corrupt => row.error_count = row.error_count.max(max_errors),
                    _ => row.error_count += 1,
                }
                row.retry_after = retry_delay(row.error_count, max_errors)
                    .map(|delay| now + delay.as_millis() as i64);
            })
            .await;
        if let Err(err) = updated {
            warn!(id = pair.id, error = %err, "failed to record row error");
            self.release(ctx, pair.id).await;
        }
        let _ = ctx.events.send(EngineEvent::RowError {
            engine: ctx.uid.clone(),
            row_id: pair.id,
            path: pair.local_path.clone(),
            kind: kind.code().to_string(),
            message,
        });
    }

    async fn release(&self, ctx: &EngineContext, id: i64) {
        if let Err(err) = ctx.db.release(id, self.id).await {
            warn!(id, error = %err, "failed to release claim");
        }
    }
}

/// Digest of the file `info` describes. The one stored on the row is reused
/// while the size and mtime it was computed for still match.
async fn local_digest(
    ctx: &EngineContext,
    pair: &DocPair,
    info: &FileInfo,
) -> Result<String, ProcessorError> {
    let algorithm = ctx.algorithm();
    if let Some(cached) = pair.local_digest.as_deref()
        && algorithm.produced(cached)
        && pair.size == Some(info.size as i64)
        && pair.last_local_updated == Some(info.mtime)
    {
        return Ok(cached.to_string());
    }
    Ok(ctx.local.digest(&info.local_path, algorithm).await?)
}

fn record_disk(pair: &mut DocPair, info: &FileInfo, digest: Option<String>) {
    pair.size = (!info.folderish).then_some(info.size as i64);
    pair.last_local_updated = Some(info.mtime);
    if digest.is_some() {
        pair.local_digest = digest;
    }
}

fn attach(pair: &mut DocPair, doc: &Document, parent_ref: &str) {
    pair.remote_ref = Some(doc.uid.clone());
    pair.remote_parent_ref = Some(parent_ref.to_string());
    pair.remote_name = Some(doc.name.clone());
    pair.remote_digest = doc.digest.clone();
}

fn unlock(ctx: &EngineContext, local_path: &str, was_readonly: bool) {
    if let Err(err) = ctx.local.unlock_ref(local_path, was_readonly) {
        warn!(path = %local_path, error = %err, "could not restore write access");
    }
}

/// Best effort: filesystems without extended attributes still sync.
fn tag(ctx: &EngineContext, pair: &DocPair) {
    let Some(remote_ref) = pair.remote_ref.as_deref() else {
        return;
    };
    if let Err(err) = ctx.local.set_remote_id(&pair.local_path, remote_ref) {
        debug!(path = %pair.local_path, error = %err, "remote id tag not written");
    }
}

/// Keeps what the watchers recorded while the row was being processed.
fn merge_concurrent(original: &DocPair, current: &DocPair, done: &mut DocPair) {
    macro_rules! keep_newer {
        ($($field:ident),+) => {
            $(if current.$field != original.$field {
                done.$field = current.$field.clone();
            })+
        };
    }
    keep_newer!(
        local_state,
        remote_state,
        local_path,
        size,
        last_local_updated,
        remote_parent_ref,
        remote_name,
        last_remote_updated
    );
    if current.local_digest != original.local_digest {
        done.local_digest = current.local_digest.clone();
    }
    if current.remote_digest != original.remote_digest {
        done.remote_digest = current.remote_digest.clone();
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
