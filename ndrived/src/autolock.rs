use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use ndrive_core::RemoteError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventSender};
use crate::manager_db::{AutoLocked, ManagerDb, ManagerDbError};
use crate::sync::engine::Engine;
use crate::sync::state_db::{StateDbError, now_ms};

#[derive(Debug, Error)]
pub enum AutoLockError {
    #[error(transparent)]
    Store(#[from] ManagerDbError),
    #[error(transparent)]
    State(#[from] StateDbError),
}

/// A file some local process holds open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub pid: u32,
    pub path: PathBuf,
}

/// Lists files currently open by the user's processes.
pub trait OpenFileSource: Send + Sync {
    fn open_files(&self) -> Vec<OpenFile>;
}

/// Reads `/proc/<pid>/fd` for every process of the current user. Reports
/// nothing on platforms without a procfs.
#[derive(Debug, Default)]
pub struct ProcOpenFiles;

impl OpenFileSource for ProcOpenFiles {
    #[cfg(target_os = "linux")]
    fn open_files(&self) -> Vec<OpenFile> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_user(UpdateKind::OnlyIfNotSet),
        );
        let own_pid = sysinfo::get_current_pid().ok();
        let own_user = own_pid
            .and_then(|pid| system.process(pid))
            .and_then(|process| process.user_id())
            .cloned();

        let mut files = Vec::new();
        for (pid, process) in system.processes() {
            if Some(*pid) == own_pid {
                continue;
            }
            if own_user.is_some() && process.user_id() != own_user.as_ref() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(format!("/proc/{}/fd", pid.as_u32())) else {
                continue;
            };
            for entry in entries.flatten() {
                if let Ok(target) = std::fs::read_link(entry.path())
                    && target.is_absolute()
                {
                    files.push(OpenFile {
                        pid: pid.as_u32(),
                        path: target,
                    });
                }
            }
        }
        files
    }

    #[cfg(not(target_os = "linux"))]
    fn open_files(&self) -> Vec<OpenFile> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub locked: usize,
    pub unlocked: usize,
    pub held_by_others: usize,
}

/// Locks remotely the synchronized files a desktop application has open
/// and releases them once closed. Taken locks survive restarts in
/// `manager.db` so a crash does not leave documents locked forever.
pub struct AutoLocker {
    db: ManagerDb,
    source: Arc<dyn OpenFileSource>,
    events: EventSender,
}

impl AutoLocker {
    pub fn new(db: ManagerDb, source: Arc<dyn OpenFileSource>, events: EventSender) -> Self {
        Self { db, source, events }
    }

    pub fn source(&self) -> &Arc<dyn OpenFileSource> {
        &self.source
    }

    /// One polling round: lock what was opened, unlock what was closed.
    pub async fn scan_once(&self, engines: &[Arc<Engine>]) -> Result<ScanReport, AutoLockError> {
        let open = self.source.open_files();
        let held = self.held().await?;
        let mut report = ScanReport::default();
        let mut still_open = HashSet::new();

        for file in &open {
            if held.contains_key(&file.path) {
                still_open.insert(file.path.clone());
                continue;
            }
            let Some(engine) = owner_of(engines, &file.path) else {
                continue;
            };
            let ctx = engine.context();
            let Ok(local_path) = ctx.local.local_path(&file.path) else {
                continue;
            };
            let Some(row) = ctx.db.get_by_path(&local_path).await? else {
                continue;
            };
            let Some(remote_ref) = row.remote_ref.filter(|_| !row.folderish) else {
                continue;
            };
            if !still_open.insert(file.path.clone()) {
                continue;
            }
            match ctx.remote.lock(&remote_ref).await {
                Ok(_) => {
                    self.db
                        .insert_autolocked(&AutoLocked {
                            path: file.path.clone(),
                            engine_uid: engine.uid().to_string(),
                            remote_ref,
                            process_id: Some(file.pid),
                            locked_at: now_ms(),
                        })
                        .await?;
                    info!(engine = %engine.uid(), path = %local_path, pid = file.pid, "document locked");
                    let _ = self.events.send(EngineEvent::Locked {
                        engine: engine.uid().to_string(),
                        path: local_path,
                    });
                    report.locked += 1;
                }
                Err(RemoteError::Conflict { owner, .. }) => {
                    info!(path = %local_path, owner = owner.as_deref().unwrap_or("unknown"), "document already locked by another user");
                    report.held_by_others += 1;
                }
                Err(err) => warn!(path = %local_path, error = %err, "failed to lock document"),
            }
        }

        report.unlocked = self.release(engines, &held, &still_open).await?;
        Ok(report)
    }

    /// Unlocks every persisted lock whose file is no longer open.
    pub async fn release_closed(&self, engines: &[Arc<Engine>]) -> Result<usize, AutoLockError> {
        let open: HashSet<PathBuf> = self
            .source
            .open_files()
            .into_iter()
            .map(|file| file.path)
            .collect();
        let held = self.held().await?;
        self.release(engines, &held, &open).await
    }

    async fn held(&self) -> Result<HashMap<PathBuf, AutoLocked>, AutoLockError> {
        Ok(self
            .db
            .autolocked()
            .await?
            .into_iter()
            .map(|lock| (lock.path.clone(), lock))
            .collect())
    }

    async fn release(
        &self,
        engines: &[Arc<Engine>],
        held: &HashMap<PathBuf, AutoLocked>,
        open: &HashSet<PathBuf>,
    ) -> Result<usize, AutoLockError> {
        let mut released = 0;
        for (path, lock) in held {
            if open.contains(path) {
                continue;
            }
            let Some(engine) = engines.iter().find(|e| e.uid() == lock.engine_uid) else {
                debug!(path = %path.display(), "engine gone, forgetting lock");
                self.db.delete_autolocked(path).await?;
                continue;
            };
            match engine.context().remote.unlock(&lock.remote_ref).await {
                Ok(()) | Err(RemoteError::NotFound(_)) => {}
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "failed to unlock document");
                    continue;
                }
            }
            self.db.delete_autolocked(path).await?;
            let local_path = engine
                .context()
                .local
                .local_path(path)
                .unwrap_or_else(|_| path.to_string_lossy().to_string());
            info!(engine = %lock.engine_uid, path = %local_path, "document unlocked");
            let _ = self.events.send(EngineEvent::Unlocked {
                engine: lock.engine_uid.clone(),
                path: local_path,
            });
            released += 1;
        }
        Ok(released)
    }
}

fn owner_of<'a>(engines: &'a [Arc<Engine>], path: &std::path::Path) -> Option<&'a Arc<Engine>> {
    engines
        .iter()
        .filter(|engine| path.starts_with(&engine.binding().local_folder))
        .max_by_key(|engine| engine.binding().local_folder.components().count())
}

#[cfg(test)]
#[path = "autolock_tests.rs"]
mod tests;
