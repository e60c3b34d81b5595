use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use ndrive_core::{AuditChange, ChangeKind, Document, RemoteClient, RemoteError};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::conflict::numbered_name;
use super::digest::same_digest;
use super::local_client::safe_filename;
use super::pair_state::SideState;
use super::paths;
use super::state_db::{DocPair, NewPair, StateDb, StateDbError, WriteTxn, now_ms};
use crate::config::ConfigHandle;
use crate::events::{EngineEvent, EventSender};

const CLOCK_SKEW_TOLERANCE_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Error)]
pub enum RemoteWatcherError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    State(#[from] StateDbError),
    #[error("full scan requested again before the minimum interval")]
    FullScanTooSoon,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub changes: usize,
    pub full_scan: bool,
}

/// One remote object as seen by an audit entry or a tree walk.
#[derive(Debug, Clone)]
struct RemoteItem {
    uid: String,
    kind: ChangeKind,
    parent_ref: Option<String>,
    path: Option<String>,
    name: Option<String>,
    folderish: bool,
    digest: Option<String>,
    timestamp: i64,
}

impl From<AuditChange> for RemoteItem {
    fn from(change: AuditChange) -> Self {
        Self {
            uid: change.uid,
            kind: change.kind,
            parent_ref: change.parent_ref,
            path: change.path,
            name: change.name,
            folderish: change.folderish,
            digest: change.digest,
            timestamp: change.timestamp,
        }
    }
}

impl RemoteItem {
    fn from_document(doc: Document, parent: &str, scanned_at: i64) -> Self {
        Self {
            uid: doc.uid,
            kind: ChangeKind::Created,
            parent_ref: doc.parent_ref.or_else(|| Some(parent.to_string())),
            path: doc.path,
            name: Some(doc.name),
            folderish: doc.folderish,
            digest: doc.digest,
            timestamp: doc.last_modified.unwrap_or(scanned_at),
        }
    }

    fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or_else(|| self.path.as_deref().map(paths::name))
            .filter(|name| !name.is_empty())
    }
}

pub fn is_filtered(remote_path: Option<&str>, filters: &[String]) -> bool {
    remote_path.is_some_and(|path| {
        filters
            .iter()
            .any(|filter| paths::is_same_or_descendant(path, filter))
    })
}

/// Polls the server change feed and records remote-side intents.
pub struct RemoteWatcher {
    engine: String,
    db: StateDb,
    remote: RemoteClient,
    remote_root: String,
    config: ConfigHandle,
    wake: Arc<Notify>,
    events: EventSender,
    last_poll: Arc<AtomicI64>,
    last_full_scan: Option<Instant>,
}

impl RemoteWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: impl Into<String>,
        db: StateDb,
        remote: RemoteClient,
        remote_root: impl Into<String>,
        config: ConfigHandle,
        wake: Arc<Notify>,
        events: EventSender,
        last_poll: Arc<AtomicI64>,
    ) -> Self {
        Self {
            engine: engine.into(),
            db,
            remote,
            remote_root: remote_root.into(),
            config,
            wake,
            events,
            last_poll,
            last_full_scan: None,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.poll_once() => outcome,
            };
            match outcome {
                Ok(outcome) => {
                    if outcome.changes > 0 {
                        self.wake.notify_one();
                    }
                    let _ = self.events.send(EngineEvent::RemotePoll {
                        engine: self.engine.clone(),
                        changes: outcome.changes,
                        full_scan: outcome.full_scan,
                    });
                }
                Err(RemoteWatcherError::Remote(RemoteError::AuthExpired)) => {
                    warn!(engine = %self.engine, "remote credentials rejected, stopping poll");
                    let _ = self.events.send(EngineEvent::AuthExpired {
                        engine: self.engine.clone(),
                    });
                    break;
                }
                Err(RemoteWatcherError::FullScanTooSoon) => {
                    debug!(engine = %self.engine, "full scan postponed");
                }
                Err(err) => warn!(engine = %self.engine, error = %err, "remote poll failed"),
            }
            let interval = self.config.snapshot().remote_poll_interval;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!(engine = %self.engine, "remote watcher stopped");
    }

    /// Fetches and applies everything since the stored token. Without a
    /// usable token the whole remote tree is walked instead.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, RemoteWatcherError> {
        let Some(mut cursor) = self.db.remote_token().await? else {
            return self.full_scan().await;
        };
        let start_token = cursor.clone();
        let mut changes = Vec::new();
        loop {
            let page = match self.remote.audit_changes(Some(&cursor), &self.remote_root).await {
                Ok(page) => page,
                Err(RemoteError::TokenInvalid) => {
                    warn!(engine = %self.engine, "change token rejected, falling back to a full scan");
                    return self.rate_limited_full_scan().await;
                }
                Err(err) => return Err(err.into()),
            };
            changes.extend(page.changes);
            cursor = page.new_token;
            if !page.has_more {
                break;
            }
        }
        self.last_poll.store(now_ms(), Ordering::Relaxed);
        if changes.is_empty() && cursor == start_token {
            return Ok(PollOutcome::default());
        }
        let applied = self.apply_changes(changes, &cursor).await?;
        Ok(PollOutcome {
            changes: applied,
            full_scan: false,
        })
    }

    async fn rate_limited_full_scan(&mut self) -> Result<PollOutcome, RemoteWatcherError> {
        let min_interval = self.config.snapshot().full_scan_min_interval;
        if let Some(last) = self.last_full_scan
            && last.elapsed() < min_interval
        {
            return Err(RemoteWatcherError::FullScanTooSoon);
        }
        self.full_scan().await
    }

    /// Applies a batch of audit entries and the new token atomically.
    async fn apply_changes(
        &self,
        changes: Vec<AuditChange>,
        new_token: &str,
    ) -> Result<usize, RemoteWatcherError> {
        let filters = self.db.filters().await?;
        let now = now_ms();
        let mut previous_ts = i64::MIN;
        let mut applied = 0;

        let mut txn = self.db.write().await?;
        for change in changes {
            let item = RemoteItem::from(change);
            if item.timestamp < previous_ts {
                warn!(engine = %self.engine, uid = %item.uid, "audit entries out of order, possible clock skew");
            }
            if item.timestamp > now + CLOCK_SKEW_TOLERANCE_MS {
                warn!(engine = %self.engine, uid = %item.uid, "audit entry from the future, check server clock");
            }
            previous_ts = previous_ts.max(item.timestamp);
            if is_filtered(item.path.as_deref(), &filters) {
                debug!(uid = %item.uid, "change under a filtered path ignored");
                continue;
            }
            if self.apply_item(&mut txn, &item).await? {
                applied += 1;
            }
        }
        txn.set_remote_token(new_token).await?;
        txn.commit().await?;
        if applied > 0 {
            info!(engine = %self.engine, applied, "remote changes recorded");
        }
        Ok(applied)
    }

    /// Walks the remote tree and reconciles every known row with it.
    pub async fn full_scan(&mut self) -> Result<PollOutcome, RemoteWatcherError> {
        info!(engine = %self.engine, "remote full scan");
        // Taking the cursor first means changes made during the walk are replayed.
        let token = self.current_token().await?;
        let scanned_at = now_ms();
        let filters = self.db.filters().await?;

        let mut items = Vec::new();
        let mut pending = VecDeque::from([self.remote_root.clone()]);
        while let Some(folder) = pending.pop_front() {
            for doc in self.remote.children(&folder).await? {
                if is_filtered(doc.path.as_deref(), &filters) {
                    continue;
                }
                if doc.folderish {
                    pending.push_back(doc.uid.clone());
                }
                items.push(RemoteItem::from_document(doc, &folder, scanned_at));
            }
        }

        let mut seen: HashSet<String> = HashSet::from([self.remote_root.clone()]);
        let mut applied = 0;
        let mut txn = self.db.write().await?;
        for item in &items {
            seen.insert(item.uid.clone());
            if self.apply_item(&mut txn, item).await? {
                applied += 1;
            }
        }
        for mut row in txn.descendants(paths::ROOT).await? {
            let Some(remote_ref) = row.remote_ref.as_deref() else {
                continue;
            };
            if row.is_root() || seen.contains(remote_ref) {
                continue;
            }
            if matches!(row.remote_state, SideState::Deleted | SideState::Unknown)
                || row.local_state == SideState::Unsynchronized
            {
                continue;
            }
            row.remote_state = SideState::Deleted;
            txn.save(&mut row).await?;
            applied += 1;
        }
        txn.set_remote_token(&token).await?;
        txn.commit().await?;

        self.last_full_scan = Some(Instant::now());
        self.last_poll.store(now_ms(), Ordering::Relaxed);
        info!(engine = %self.engine, items = items.len(), applied, "remote full scan finished");
        Ok(PollOutcome {
            changes: applied,
            full_scan: true,
        })
    }

    async fn current_token(&self) -> Result<String, RemoteWatcherError> {
        let mut page = self.remote.audit_changes(None, &self.remote_root).await?;
        while page.has_more {
            page = self
                .remote
                .audit_changes(Some(&page.new_token), &self.remote_root)
                .await?;
        }
        Ok(page.new_token)
    }

    async fn apply_item(
        &self,
        txn: &mut WriteTxn<'_>,
        item: &RemoteItem,
    ) -> Result<bool, RemoteWatcherError> {
        if item.uid == self.remote_root {
            return Ok(false);
        }
        let existing = txn.get_by_ref(&item.uid).await?;
        match (item.kind, existing) {
            (ChangeKind::Deleted, Some(row)) => Ok(mark_remote_deleted(txn, row).await?),
            (ChangeKind::Deleted, None) => Ok(false),
            (_, Some(row)) => Ok(update_known(txn, row, item).await?),
            (_, None) => Ok(insert_unknown(txn, item).await?),
        }
    }
}

async fn mark_remote_deleted(txn: &mut WriteTxn<'_>, mut row: DocPair) -> Result<bool, StateDbError> {
    if row.remote_state == SideState::Deleted || row.local_state == SideState::Unsynchronized {
        return Ok(false);
    }
    if row.folderish {
        for mut child in txn.descendants(&row.local_path).await? {
            if child.remote_ref.is_some() && child.remote_state != SideState::Deleted {
                child.remote_state = SideState::Deleted;
                txn.save(&mut child).await?;
            }
        }
    }
    row.remote_state = SideState::Deleted;
    txn.save(&mut row).await?;
    Ok(true)
}

async fn update_known(
    txn: &mut WriteTxn<'_>,
    mut row: DocPair,
    item: &RemoteItem,
) -> Result<bool, StateDbError> {
    if row.local_state == SideState::Unsynchronized {
        return Ok(false);
    }
    let mut changed = false;

    let name = item.display_name().map(str::to_string);
    let relocated = item.parent_ref.is_some()
        && name.is_some()
        && (item.parent_ref != row.remote_parent_ref || name != row.remote_name);
    if relocated {
        row.remote_parent_ref = item.parent_ref.clone();
        row.remote_name = name;
        if row.local_state == SideState::Unknown {
            // Nothing on disk yet: download straight to the new place.
            if let Some(target) = target_path(txn, &row, item).await? {
                let old = std::mem::replace(&mut row.local_path, target.clone());
                txn.rebase_tree(&old, &target).await?;
            }
        } else if matches!(
            row.remote_state,
            SideState::Synchronized | SideState::Unknown | SideState::Modified
        ) {
            row.remote_state = SideState::Moved;
        }
        changed = true;
    }

    if !row.folderish
        && let Some(digest) = item.digest.as_deref()
        && !row
            .remote_digest
            .as_deref()
            .is_some_and(|known| same_digest(known, digest))
    {
        row.remote_digest = Some(digest.to_string());
        if matches!(row.remote_state, SideState::Synchronized | SideState::Unknown) {
            row.remote_state = SideState::Modified;
        }
        changed = true;
    }

    if row.remote_state == SideState::Deleted {
        // Reappeared on the server, e.g. restored from the trash.
        row.remote_state = SideState::Created;
        changed = true;
    }

    if changed {
        row.last_remote_updated = Some(item.timestamp);
        txn.save(&mut row).await?;
    }
    Ok(changed)
}

async fn insert_unknown(txn: &mut WriteTxn<'_>, item: &RemoteItem) -> Result<bool, StateDbError> {
    let Some(parent_ref) = item.parent_ref.as_deref() else {
        return Ok(false);
    };
    let Some(parent) = txn.get_by_ref(parent_ref).await? else {
        debug!(uid = %item.uid, parent = parent_ref, "parent unknown, change ignored");
        return Ok(false);
    };
    if parent.local_state == SideState::Unsynchronized {
        return Ok(false);
    }
    let Some(name) = item.display_name() else {
        return Ok(false);
    };
    let local_name = safe_filename(name);
    let path = paths::join(&parent.local_path, &local_name);

    match txn.get_by_path(&path).await? {
        Some(mut local) if local.remote_ref.is_none() && local.folderish == item.folderish => {
            // Created on both sides under the same name: pair them.
            local.remote_ref = Some(item.uid.clone());
            local.remote_parent_ref = Some(parent_ref.to_string());
            local.remote_name = Some(name.to_string());
            local.remote_digest = item.digest.clone();
            local.last_remote_updated = Some(item.timestamp);
            local.remote_state = SideState::Created;
            txn.save(&mut local).await?;
        }
        Some(_) => {
            let free = free_path(txn, &parent.local_path, &local_name, item.folderish).await?;
            txn.insert(remote_pair(item, parent_ref, name, free)).await?;
        }
        None => {
            txn.insert(remote_pair(item, parent_ref, name, path)).await?;
        }
    }
    Ok(true)
}

fn remote_pair(item: &RemoteItem, parent_ref: &str, name: &str, local_path: String) -> NewPair {
    NewPair {
        local_path,
        folderish: item.folderish,
        local_state: Some(SideState::Unknown),
        remote_state: Some(SideState::Created),
        remote_ref: Some(item.uid.clone()),
        remote_parent_ref: Some(parent_ref.to_string()),
        remote_name: Some(name.to_string()),
        remote_digest: item.digest.clone(),
        last_remote_updated: Some(item.timestamp),
        ..NewPair::default()
    }
}

async fn target_path(
    txn: &mut WriteTxn<'_>,
    row: &DocPair,
    item: &RemoteItem,
) -> Result<Option<String>, StateDbError> {
    let (Some(parent_ref), Some(name)) = (item.parent_ref.as_deref(), item.display_name()) else {
        return Ok(None);
    };
    let Some(parent) = txn.get_by_ref(parent_ref).await? else {
        return Ok(None);
    };
    let local_name = safe_filename(name);
    let path = paths::join(&parent.local_path, &local_name);
    if path == row.local_path {
        return Ok(None);
    }
    match txn.get_by_path(&path).await? {
        None => Ok(Some(path)),
        Some(_) => Ok(Some(free_path(txn, &parent.local_path, &local_name, item.folderish).await?)),
    }
}

async fn free_path(
    txn: &mut WriteTxn<'_>,
    parent: &str,
    name: &str,
    folderish: bool,
) -> Result<String, StateDbError> {
    let mut n = 1;
    loop {
        let numbered = if folderish {
            format!("{name} ({n})")
        } else {
            numbered_name(name, n)
        };
        let candidate = paths::join(parent, &numbered);
        if txn.get_by_path(&candidate).await?.is_none() {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
#[path = "remote_watcher_tests.rs"]
mod tests;
