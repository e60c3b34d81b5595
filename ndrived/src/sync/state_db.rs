use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::pair_state::{PairState, SideState, StateParseError, derive_pair_state};
use super::paths;
use super::transfer::ChunkBitmap;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/engine");

const BACKUPS_KEPT: usize = 3;
const REMOTE_TOKEN_KEY: &str = "remote_last_token";

#[derive(Debug, Error)]
pub enum StateDbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    State(#[from] StateParseError),
    #[error("database is corrupted and no backup is available: {0}")]
    Corrupt(String),
    #[error("invalid transfer field: {0}")]
    InvalidTransfer(String),
    #[error("row {0} not found")]
    MissingRow(i64),
}

/// One tracked filesystem object.
#[derive(Debug, Clone, PartialEq)]
pub struct DocPair {
    pub id: i64,
    pub local_path: String,
    pub local_parent_path: Option<String>,
    pub local_name: String,
    pub remote_ref: Option<String>,
    pub remote_parent_ref: Option<String>,
    pub remote_name: Option<String>,
    pub folderish: bool,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub size: Option<i64>,
    pub last_local_updated: Option<i64>,
    pub last_remote_updated: Option<i64>,
    pub local_state: SideState,
    pub remote_state: SideState,
    pub pair_state: PairState,
    pub suspended_local_state: Option<SideState>,
    pub version: i64,
    pub checked_version: Option<i64>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_details: Option<String>,
    pub last_sync_error_date: Option<i64>,
    pub retry_after: Option<i64>,
    pub processor: i64,
}

impl DocPair {
    pub fn is_root(&self) -> bool {
        self.local_path == paths::ROOT
    }

    pub fn depth(&self) -> i64 {
        paths::depth(&self.local_path)
    }

    pub fn derived_state(&self) -> PairState {
        derive_pair_state(self.local_state, self.remote_state, self.folderish)
    }

    pub fn set_synchronized(&mut self) {
        self.local_state = SideState::Synchronized;
        self.remote_state = SideState::Synchronized;
        self.clear_error();
    }

    pub fn clear_error(&mut self) {
        self.error_count = 0;
        self.last_error = None;
        self.last_error_details = None;
        self.last_sync_error_date = None;
        self.retry_after = None;
    }

    fn from_row(row: &SqliteRow) -> Result<Self, StateDbError> {
        let local_state: String = row.try_get("local_state")?;
        let remote_state: String = row.try_get("remote_state")?;
        let pair_state: String = row.try_get("pair_state")?;
        let suspended: Option<String> = row.try_get("suspended_local_state")?;
        let folderish: i64 = row.try_get("folderish")?;
        let error_count: i64 = row.try_get("error_count")?;
        Ok(Self {
            id: row.try_get("id")?,
            local_path: row.try_get("local_path")?,
            local_parent_path: row.try_get("local_parent_path")?,
            local_name: row.try_get("local_name")?,
            remote_ref: row.try_get("remote_ref")?,
            remote_parent_ref: row.try_get("remote_parent_ref")?,
            remote_name: row.try_get("remote_name")?,
            folderish: folderish != 0,
            local_digest: row.try_get("local_digest")?,
            remote_digest: row.try_get("remote_digest")?,
            size: row.try_get("size")?,
            last_local_updated: row.try_get("last_local_updated")?,
            last_remote_updated: row.try_get("last_remote_updated")?,
            local_state: SideState::parse(&local_state)?,
            remote_state: SideState::parse(&remote_state)?,
            pair_state: PairState::parse(&pair_state)?,
            suspended_local_state: suspended.as_deref().map(SideState::parse).transpose()?,
            version: row.try_get("version")?,
            checked_version: row.try_get("checked_version")?,
            error_count: u32::try_from(error_count).unwrap_or(0),
            last_error: row.try_get("last_error")?,
            last_error_details: row.try_get("last_error_details")?,
            last_sync_error_date: row.try_get("last_sync_error_date")?,
            retry_after: row.try_get("retry_after")?,
            processor: row.try_get("processor")?,
        })
    }
}

/// Fields for a brand new row. Everything else starts empty.
#[derive(Debug, Clone, Default)]
pub struct NewPair {
    pub local_path: String,
    pub folderish: bool,
    pub local_state: Option<SideState>,
    pub remote_state: Option<SideState>,
    pub remote_ref: Option<String>,
    pub remote_parent_ref: Option<String>,
    pub remote_name: Option<String>,
    pub local_digest: Option<String>,
    pub remote_digest: Option<String>,
    pub size: Option<i64>,
    pub last_local_updated: Option<i64>,
    pub last_remote_updated: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    Purged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Up,
    Down,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Up => "up",
            TransferDirection::Down => "down",
        }
    }

    fn parse(value: &str) -> Result<Self, StateDbError> {
        match value {
            "up" => Ok(TransferDirection::Up),
            "down" => Ok(TransferDirection::Down),
            other => Err(StateDbError::InvalidTransfer(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Todo,
    Ongoing,
    Done,
    Paused,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Todo => "todo",
            TransferStatus::Ongoing => "ongoing",
            TransferStatus::Done => "done",
            TransferStatus::Paused => "paused",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    fn parse(value: &str) -> Result<Self, StateDbError> {
        match value {
            "todo" => Ok(TransferStatus::Todo),
            "ongoing" => Ok(TransferStatus::Ongoing),
            "done" => Ok(TransferStatus::Done),
            "paused" => Ok(TransferStatus::Paused),
            "cancelled" => Ok(TransferStatus::Cancelled),
            other => Err(StateDbError::InvalidTransfer(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub id: i64,
    pub doc_pair_id: i64,
    pub direction: TransferDirection,
    pub batch_id: Option<String>,
    pub file_index: u32,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub uploaded: ChunkBitmap,
    pub status: TransferStatus,
    pub engine_id: String,
    pub tmp_path: Option<String>,
    pub digest: Option<String>,
    pub expires_at: Option<i64>,
}

impl TransferRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, StateDbError> {
        let direction: String = row.try_get("direction")?;
        let status: String = row.try_get("status")?;
        let bitmap: Option<Vec<u8>> = row.try_get("uploaded_bitmap")?;
        let file_index: i64 = row.try_get("file_index")?;
        let chunk_size: i64 = row.try_get("chunk_size")?;
        let chunk_count: i64 = row.try_get("chunk_count")?;
        let chunk_count = u64::try_from(chunk_count)
            .map_err(|_| StateDbError::InvalidTransfer("chunk_count".into()))?;
        Ok(Self {
            id: row.try_get("id")?,
            doc_pair_id: row.try_get("doc_pair_id")?,
            direction: TransferDirection::parse(&direction)?,
            batch_id: row.try_get("batch_id")?,
            file_index: u32::try_from(file_index)
                .map_err(|_| StateDbError::InvalidTransfer("file_index".into()))?,
            chunk_size: u64::try_from(chunk_size)
                .map_err(|_| StateDbError::InvalidTransfer("chunk_size".into()))?,
            chunk_count,
            uploaded: ChunkBitmap::from_bytes(bitmap.unwrap_or_default(), chunk_count),
            status: TransferStatus::parse(&status)?,
            engine_id: row.try_get("engine_id")?,
            tmp_path: row.try_get("tmp_path")?,
            digest: row.try_get("digest")?,
            expires_at: row.try_get("expires_at")?,
        })
    }
}

/// Rows per pair state plus the errored total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub by_state: HashMap<String, i64>,
    pub errored: i64,
    pub syncing: i64,
    pub total: i64,
}

impl StateCounts {
    pub fn get(&self, state: PairState) -> i64 {
        self.by_state.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// Per-engine store. Reads go through the pool; every write holds the
/// writer lock for the lifetime of its transaction.
#[derive(Clone)]
pub struct StateDb {
    pool: SqlitePool,
    path: Option<PathBuf>,
    writer: std::sync::Arc<Mutex<()>>,
}

impl StateDb {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            path: None,
            writer: std::sync::Arc::new(Mutex::new(())),
        }
    }

    pub async fn init(&self) -> Result<(), StateDbError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Opens (creating if needed) the store at `path`. A store that fails its
    /// integrity check is replaced by the newest backup when one exists.
    pub async fn open(path: &Path) -> Result<Self, StateDbError> {
        match Self::open_checked(path).await {
            Ok(db) => Ok(db),
            Err(StateDbError::Corrupt(reason)) => {
                let Some(backup) = latest_backup(path)? else {
                    return Err(StateDbError::Corrupt(reason));
                };
                warn!(db = %path.display(), backup = %backup.display(), %reason, "restoring state db from backup");
                for suffix in ["-wal", "-shm"] {
                    let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
                    if sidecar.exists() {
                        std::fs::remove_file(sidecar)?;
                    }
                }
                std::fs::copy(&backup, path)?;
                Self::open_checked(path).await
            }
            Err(err) => Err(err),
        }
    }

    async fn open_checked(path: &Path) -> Result<Self, StateDbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(classify_open_error)?;
        let verdict: String = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_one(&pool)
            .await
            .map_err(classify_open_error)?;
        if verdict != "ok" {
            pool.close().await;
            return Err(StateDbError::Corrupt(verdict));
        }
        let db = Self {
            pool,
            path: Some(path.to_path_buf()),
            writer: std::sync::Arc::new(Mutex::new(())),
        };
        db.init().await?;
        Ok(db)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Starts the single write transaction. Dropping it without `commit` rolls back.
    pub async fn write(&self) -> Result<WriteTxn<'_>, StateDbError> {
        let guard = self.writer.lock().await;
        let tx = self.pool.begin().await?;
        Ok(WriteTxn { _guard: guard, tx })
    }

    /// Copies the live database to a dated sidecar file.
    pub async fn backup(&self) -> Result<Option<PathBuf>, StateDbError> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let _guard = self.writer.lock().await;
        let stamp = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year][month][day]-[hour][minute][second]"
            ))
            .unwrap_or_else(|_| now_ms().to_string());
        let target = PathBuf::from(format!("{}.{stamp}.bak", path.display()));
        if target.exists() {
            std::fs::remove_file(&target)?;
        }
        sqlx::query("VACUUM INTO ?1")
            .bind(target.to_string_lossy().to_string())
            .execute(&self.pool)
            .await?;
        let mut backups = list_backups(path)?;
        while backups.len() > BACKUPS_KEPT {
            let oldest = backups.remove(0);
            let _ = std::fs::remove_file(oldest);
        }
        info!(backup = %target.display(), "state db backed up");
        Ok(Some(target))
    }

    pub async fn get(&self, id: i64) -> Result<Option<DocPair>, StateDbError> {
        let row = sqlx::query("SELECT * FROM states WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(DocPair::from_row).transpose()
    }

    pub async fn get_by_path(&self, local_path: &str) -> Result<Option<DocPair>, StateDbError> {
        let row = sqlx::query("SELECT * FROM states WHERE local_path = ?1")
            .bind(local_path)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(DocPair::from_row).transpose()
    }

    pub async fn get_by_ref(&self, remote_ref: &str) -> Result<Option<DocPair>, StateDbError> {
        let row = sqlx::query("SELECT * FROM states WHERE remote_ref = ?1")
            .bind(remote_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(DocPair::from_row).transpose()
    }

    pub async fn root(&self) -> Result<Option<DocPair>, StateDbError> {
        self.get_by_path(paths::ROOT).await
    }

    pub async fn children(&self, local_path: &str) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query("SELECT * FROM states WHERE local_parent_path = ?1 ORDER BY local_name")
            .bind(local_path)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn descendants(&self, local_path: &str) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query(
            "SELECT * FROM states WHERE local_path LIKE ?1 ESCAPE '\\' ORDER BY local_path",
        )
        .bind(paths::descendants_pattern(local_path))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn all(&self) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query("SELECT * FROM states ORDER BY local_path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn count(&self) -> Result<i64, StateDbError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM states")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Next rows needing work, in processing order: parents before children
    /// for creations, children before parents for deletions.
    pub async fn dirty_rows(
        &self,
        max_errors: u32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query(
            "SELECT * FROM states
             WHERE pair_state NOT IN ('synchronized', 'unknown', 'unsynchronized', 'direct_transfer')
               AND NOT (pair_state = 'conflicted' AND checked_version = version)
               AND error_count < ?1
               AND processor = 0
               AND (retry_after IS NULL OR retry_after <= ?2)
             ORDER BY
               CASE WHEN pair_state IN ('locally_deleted', 'remotely_deleted', 'deleted')
                    THEN 1 ELSE 0 END,
               CASE WHEN pair_state IN ('locally_deleted', 'remotely_deleted', 'deleted')
                    THEN folderish ELSE -folderish END,
               CASE WHEN pair_state IN ('locally_deleted', 'remotely_deleted', 'deleted')
                    THEN -depth ELSE depth END,
               id
             LIMIT ?3",
        )
        .bind(i64::from(max_errors))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    /// Rows that exhausted their immediate retries and wait in the error queue.
    pub async fn errored_rows(&self, max_errors: u32) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query(
            "SELECT * FROM states
             WHERE error_count >= ?1
               AND pair_state NOT IN ('synchronized', 'unknown', 'unsynchronized', 'direct_transfer')
             ORDER BY id",
        )
        .bind(i64::from(max_errors))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn rows_in_state(&self, state: PairState) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query("SELECT * FROM states WHERE pair_state = ?1 ORDER BY local_path")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn rows_with_errors(&self) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query("SELECT * FROM states WHERE error_count > 0 ORDER BY local_path")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn counts(&self) -> Result<StateCounts, StateDbError> {
        let rows = sqlx::query("SELECT pair_state, COUNT(*) AS n FROM states GROUP BY pair_state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = StateCounts::default();
        for row in rows {
            let state: String = row.try_get("pair_state")?;
            let n: i64 = row.try_get("n")?;
            counts.total += n;
            counts.by_state.insert(state, n);
        }
        counts.errored = sqlx::query_scalar("SELECT COUNT(*) FROM states WHERE error_count > 0")
            .fetch_one(&self.pool)
            .await?;
        counts.syncing = sqlx::query_scalar("SELECT COUNT(*) FROM states WHERE processor != 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(counts)
    }

    /// Sets `processor` on an unowned row. Returns false when another worker owns it.
    pub async fn claim(&self, id: i64, processor: i64) -> Result<bool, StateDbError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("UPDATE states SET processor = ?1 WHERE id = ?2 AND processor = 0")
            .bind(processor)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self, id: i64, processor: i64) -> Result<(), StateDbError> {
        let _guard = self.writer.lock().await;
        sqlx::query("UPDATE states SET processor = 0 WHERE id = ?1 AND processor = ?2")
            .bind(id)
            .bind(processor)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears every claim, used at engine start after an unclean stop.
    pub async fn release_all(&self) -> Result<u64, StateDbError> {
        let _guard = self.writer.lock().await;
        let result = sqlx::query("UPDATE states SET processor = 0 WHERE processor != 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn filters(&self) -> Result<Vec<String>, StateDbError> {
        let rows = sqlx::query("SELECT path FROM filters ORDER BY path")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| row.try_get::<String, _>("path").map_err(StateDbError::from))
            .collect()
    }

    pub async fn get_config(&self, name: &str) -> Result<Option<String>, StateDbError> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM config WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.flatten())
    }

    pub async fn set_config(&self, name: &str, value: Option<&str>) -> Result<(), StateDbError> {
        let mut txn = self.write().await?;
        txn.set_config(name, value).await?;
        txn.commit().await
    }

    pub async fn remote_token(&self) -> Result<Option<String>, StateDbError> {
        self.get_config(REMOTE_TOKEN_KEY).await
    }

    pub async fn transfer(
        &self,
        doc_pair_id: i64,
        direction: TransferDirection,
    ) -> Result<Option<TransferRecord>, StateDbError> {
        let row = sqlx::query("SELECT * FROM transfers WHERE doc_pair_id = ?1 AND direction = ?2")
            .bind(doc_pair_id)
            .bind(direction.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(TransferRecord::from_row).transpose()
    }

    pub async fn transfers(&self) -> Result<Vec<TransferRecord>, StateDbError> {
        let rows = sqlx::query("SELECT * FROM transfers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(TransferRecord::from_row).collect()
    }

    /// Convenience wrapper running `f` inside its own write transaction.
    pub async fn update_pair<F>(&self, id: i64, f: F) -> Result<Option<SaveOutcome>, StateDbError>
    where
        F: FnOnce(&mut DocPair),
    {
        let mut txn = self.write().await?;
        let Some(mut pair) = txn.get(id).await? else {
            return Ok(None);
        };
        f(&mut pair);
        let outcome = txn.save(&mut pair).await?;
        txn.commit().await?;
        Ok(Some(outcome))
    }
}

/// The single open write transaction of a store.
pub struct WriteTxn<'a> {
    _guard: MutexGuard<'a, ()>,
    tx: Transaction<'static, Sqlite>,
}

impl WriteTxn<'_> {
    pub async fn commit(self) -> Result<(), StateDbError> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn get(&mut self, id: i64) -> Result<Option<DocPair>, StateDbError> {
        let row = sqlx::query("SELECT * FROM states WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(DocPair::from_row).transpose()
    }

    pub async fn get_by_path(&mut self, local_path: &str) -> Result<Option<DocPair>, StateDbError> {
        let row = sqlx::query("SELECT * FROM states WHERE local_path = ?1")
            .bind(local_path)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(DocPair::from_row).transpose()
    }

    pub async fn get_by_ref(&mut self, remote_ref: &str) -> Result<Option<DocPair>, StateDbError> {
        let row = sqlx::query("SELECT * FROM states WHERE remote_ref = ?1")
            .bind(remote_ref)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.as_ref().map(DocPair::from_row).transpose()
    }

    pub async fn descendants(&mut self, local_path: &str) -> Result<Vec<DocPair>, StateDbError> {
        let rows = sqlx::query(
            "SELECT * FROM states WHERE local_path LIKE ?1 ESCAPE '\\' ORDER BY local_path",
        )
        .bind(paths::descendants_pattern(local_path))
        .fetch_all(&mut *self.tx)
        .await?;
        rows.iter().map(DocPair::from_row).collect()
    }

    pub async fn insert(&mut self, new: NewPair) -> Result<DocPair, StateDbError> {
        let local_state = new.local_state.unwrap_or(SideState::Unknown);
        let remote_state = new.remote_state.unwrap_or(SideState::Unknown);
        let pair_state = derive_pair_state(local_state, remote_state, new.folderish);
        let parent = paths::parent(&new.local_path).map(str::to_string);
        let name = if new.local_path == paths::ROOT {
            String::new()
        } else {
            paths::name(&new.local_path).to_string()
        };
        let (local_digest, remote_digest) = if new.folderish {
            (None, None)
        } else {
            (new.local_digest, new.remote_digest)
        };
        let result = sqlx::query(
            "INSERT INTO states (
                local_path, local_parent_path, local_name, remote_ref, remote_parent_ref,
                remote_name, folderish, local_digest, remote_digest, size,
                last_local_updated, last_remote_updated, local_state, remote_state,
                pair_state, depth, version
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, 1)",
        )
        .bind(&new.local_path)
        .bind(&parent)
        .bind(&name)
        .bind(&new.remote_ref)
        .bind(&new.remote_parent_ref)
        .bind(&new.remote_name)
        .bind(if new.folderish { 1 } else { 0 })
        .bind(&local_digest)
        .bind(&remote_digest)
        .bind(new.size)
        .bind(new.last_local_updated)
        .bind(new.last_remote_updated)
        .bind(local_state.as_str())
        .bind(remote_state.as_str())
        .bind(pair_state.as_str())
        .bind(paths::depth(&new.local_path))
        .execute(&mut *self.tx)
        .await?;
        let id = result.last_insert_rowid();
        debug!(id, path = %new.local_path, state = pair_state.as_str(), "pair inserted");
        self.get(id).await?.ok_or(StateDbError::MissingRow(id))
    }

    /// Writes back every mutable column, re-deriving `pair_state` and bumping
    /// `version`. A row whose sides are both gone is purged instead.
    pub async fn save(&mut self, pair: &mut DocPair) -> Result<SaveOutcome, StateDbError> {
        pair.pair_state = pair.derived_state();
        if pair.pair_state == PairState::Deleted {
            self.purge(pair.id).await?;
            return Ok(SaveOutcome::Purged);
        }
        if pair.folderish {
            pair.local_digest = None;
            pair.remote_digest = None;
        }
        pair.local_parent_path = paths::parent(&pair.local_path).map(str::to_string);
        pair.local_name = if pair.is_root() {
            String::new()
        } else {
            paths::name(&pair.local_path).to_string()
        };
        let result = sqlx::query(
            "UPDATE states SET
                local_path = ?1, local_parent_path = ?2, local_name = ?3, remote_ref = ?4,
                remote_parent_ref = ?5, remote_name = ?6, folderish = ?7, local_digest = ?8,
                remote_digest = ?9, size = ?10, last_local_updated = ?11,
                last_remote_updated = ?12, local_state = ?13, remote_state = ?14,
                pair_state = ?15, suspended_local_state = ?16, depth = ?17,
                checked_version = ?18, error_count = ?19, last_error = ?20,
                last_error_details = ?21, last_sync_error_date = ?22, retry_after = ?23,
                processor = ?24, version = version + 1
             WHERE id = ?25",
        )
        .bind(&pair.local_path)
        .bind(&pair.local_parent_path)
        .bind(&pair.local_name)
        .bind(&pair.remote_ref)
        .bind(&pair.remote_parent_ref)
        .bind(&pair.remote_name)
        .bind(if pair.folderish { 1 } else { 0 })
        .bind(&pair.local_digest)
        .bind(&pair.remote_digest)
        .bind(pair.size)
        .bind(pair.last_local_updated)
        .bind(pair.last_remote_updated)
        .bind(pair.local_state.as_str())
        .bind(pair.remote_state.as_str())
        .bind(pair.pair_state.as_str())
        .bind(pair.suspended_local_state.map(|s| s.as_str()))
        .bind(pair.depth())
        .bind(pair.checked_version)
        .bind(i64::from(pair.error_count))
        .bind(&pair.last_error)
        .bind(&pair.last_error_details)
        .bind(pair.last_sync_error_date)
        .bind(pair.retry_after)
        .bind(pair.processor)
        .bind(pair.id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StateDbError::MissingRow(pair.id));
        }
        pair.version += 1;
        Ok(SaveOutcome::Saved)
    }

    /// Marks a conflicted row as examined so it is not queued again until it changes.
    pub async fn mark_checked(&mut self, id: i64) -> Result<(), StateDbError> {
        sqlx::query(
            "UPDATE states SET checked_version = version + 1, version = version + 1 WHERE id = ?1",
        )
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn purge(&mut self, id: i64) -> Result<(), StateDbError> {
        sqlx::query("DELETE FROM transfers WHERE doc_pair_id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        sqlx::query("DELETE FROM states WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        debug!(id, "pair purged");
        Ok(())
    }

    /// Removes `local_path` and every row below it.
    pub async fn purge_tree(&mut self, local_path: &str) -> Result<u64, StateDbError> {
        let pattern = paths::descendants_pattern(local_path);
        sqlx::query(
            "DELETE FROM transfers WHERE doc_pair_id IN (
                SELECT id FROM states WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\\')",
        )
        .bind(local_path)
        .bind(&pattern)
        .execute(&mut *self.tx)
        .await?;
        let result =
            sqlx::query("DELETE FROM states WHERE local_path = ?1 OR local_path LIKE ?2 ESCAPE '\\'")
                .bind(local_path)
                .bind(&pattern)
                .execute(&mut *self.tx)
                .await?;
        Ok(result.rows_affected())
    }

    /// Moves the row at `from` and all its descendants under `to`.
    pub async fn rebase_tree(&mut self, from: &str, to: &str) -> Result<usize, StateDbError> {
        let mut moved = 0;
        for mut child in self.descendants(from).await? {
            if let Some(next) = paths::rebase(&child.local_path, from, to) {
                child.local_path = next;
                self.save(&mut child).await?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    pub async fn add_filter(&mut self, remote_path: &str) -> Result<(), StateDbError> {
        sqlx::query("INSERT OR IGNORE INTO filters (path) VALUES (?1)")
            .bind(remote_path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn remove_filter(&mut self, remote_path: &str) -> Result<(), StateDbError> {
        sqlx::query("DELETE FROM filters WHERE path = ?1")
            .bind(remote_path)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    pub async fn set_config(&mut self, name: &str, value: Option<&str>) -> Result<(), StateDbError> {
        sqlx::query(
            "INSERT INTO config (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn set_remote_token(&mut self, token: &str) -> Result<(), StateDbError> {
        self.set_config(REMOTE_TOKEN_KEY, Some(token)).await
    }

    /// Forgets the audit cursor; the next remote poll walks the whole tree.
    pub async fn clear_remote_token(&mut self) -> Result<(), StateDbError> {
        self.set_config(REMOTE_TOKEN_KEY, None).await
    }

    pub async fn upsert_transfer(&mut self, record: &TransferRecord) -> Result<i64, StateDbError> {
        let now = now_ms();
        let result = sqlx::query(
            "INSERT INTO transfers (
                doc_pair_id, direction, batch_id, file_index, chunk_size, chunk_count,
                uploaded_bitmap, status, engine_id, tmp_path, digest, expires_at,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
            ON CONFLICT(doc_pair_id, direction) DO UPDATE SET
                batch_id = excluded.batch_id,
                file_index = excluded.file_index,
                chunk_size = excluded.chunk_size,
                chunk_count = excluded.chunk_count,
                uploaded_bitmap = excluded.uploaded_bitmap,
                status = excluded.status,
                tmp_path = excluded.tmp_path,
                digest = excluded.digest,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            RETURNING id",
        )
        .bind(record.doc_pair_id)
        .bind(record.direction.as_str())
        .bind(&record.batch_id)
        .bind(i64::from(record.file_index))
        .bind(record.chunk_size as i64)
        .bind(record.chunk_count as i64)
        .bind(record.uploaded.as_bytes())
        .bind(record.status.as_str())
        .bind(&record.engine_id)
        .bind(&record.tmp_path)
        .bind(&record.digest)
        .bind(record.expires_at)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(result.try_get("id")?)
    }

    pub async fn delete_transfer(&mut self, id: i64) -> Result<(), StateDbError> {
        sqlx::query("DELETE FROM transfers WHERE id = ?1")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }
}

pub fn now_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}

fn classify_open_error(err: sqlx::Error) -> StateDbError {
    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
        let message = db_err.message().to_ascii_lowercase();
        if matches!(code.as_str(), "11" | "26")
            || message.contains("malformed")
            || message.contains("not a database")
        {
            return StateDbError::Corrupt(db_err.message().to_string());
        }
    }
    StateDbError::Sqlx(err)
}

fn list_backups(path: &Path) -> Result<Vec<PathBuf>, StateDbError> {
    let Some(dir) = path.parent() else {
        return Ok(Vec::new());
    };
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(Vec::new());
    };
    let prefix = format!("{file_name}.");
    let mut backups = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with(&prefix) && name.ends_with(".bak") {
            backups.push(entry.path());
        }
    }
    // Stamps sort lexicographically in time order.
    backups.sort();
    Ok(backups)
}

fn latest_backup(path: &Path) -> Result<Option<PathBuf>, StateDbError> {
    Ok(list_backups(path)?.pop())
}

impl FromStr for TransferDirection {
    type Err = StateDbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
#[path = "state_db_tests.rs"]
mod tests;
