use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use crate::sync::engine::EngineBinding;
use crate::sync::state_db::now_ms;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations/manager");

pub const DEVICE_ID_KEY: &str = "device_id";
pub const DEVICE_SECRET_KEY: &str = "device_secret";

#[derive(Debug, Error)]
pub enum ManagerDbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A remote lock taken because a local process had the file open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoLocked {
    pub path: PathBuf,
    pub engine_uid: String,
    pub remote_ref: String,
    pub process_id: Option<u32>,
    pub locked_at: i64,
}

/// Process-wide state: bound engines, persisted config overrides and
/// auto-locked files.
#[derive(Clone)]
pub struct ManagerDb {
    pool: SqlitePool,
}

impl ManagerDb {
    pub async fn open(path: &Path) -> Result<Self, ManagerDbError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn engines(&self) -> Result<Vec<EngineBinding>, ManagerDbError> {
        let rows = sqlx::query("SELECT * FROM engines ORDER BY created_at, uid")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| binding_from_row(row).map_err(ManagerDbError::from))
            .collect()
    }

    pub async fn insert_engine(&self, binding: &EngineBinding) -> Result<(), ManagerDbError> {
        sqlx::query(
            "INSERT INTO engines (uid, kind, name, local_folder, server_url, remote_user, remote_root, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&binding.uid)
        .bind(&binding.kind)
        .bind(&binding.name)
        .bind(binding.local_folder.to_string_lossy().to_string())
        .bind(&binding.server_url)
        .bind(&binding.remote_user)
        .bind(&binding.remote_root)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_engine(&self, uid: &str) -> Result<bool, ManagerDbError> {
        let result = sqlx::query("DELETE FROM engines WHERE uid = ?1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM autolocked WHERE engine_uid = ?1")
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_config(&self, name: &str) -> Result<Option<String>, ManagerDbError> {
        Ok(
            sqlx::query_scalar::<_, Option<String>>("SELECT value FROM config WHERE name = ?1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
                .flatten(),
        )
    }

    pub async fn set_config(&self, name: &str, value: Option<&str>) -> Result<(), ManagerDbError> {
        sqlx::query(
            "INSERT INTO config (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every stored key with a value, device identity included.
    pub async fn config_map(&self) -> Result<HashMap<String, String>, ManagerDbError> {
        let rows = sqlx::query("SELECT name, value FROM config WHERE value IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.try_get("name")?, row.try_get("value")?);
        }
        Ok(map)
    }

    /// Returns the stored value for `name`, storing `make()` first when absent.
    pub async fn get_or_init(
        &self,
        name: &str,
        make: impl FnOnce() -> String,
    ) -> Result<String, ManagerDbError> {
        if let Some(value) = self.get_config(name).await? {
            return Ok(value);
        }
        let value = make();
        self.set_config(name, Some(&value)).await?;
        Ok(value)
    }

    pub async fn autolocked(&self) -> Result<Vec<AutoLocked>, ManagerDbError> {
        let rows = sqlx::query("SELECT * FROM autolocked ORDER BY locked_at")
            .fetch_all(&self.pool)
            .await?;
        let mut locks = Vec::with_capacity(rows.len());
        for row in rows {
            let path: String = row.try_get("path")?;
            let pid: Option<i64> = row.try_get("process_id")?;
            locks.push(AutoLocked {
                path: PathBuf::from(path),
                engine_uid: row.try_get("engine_uid")?,
                remote_ref: row.try_get("remote_ref")?,
                process_id: pid.and_then(|p| u32::try_from(p).ok()),
                locked_at: row.try_get("locked_at")?,
            });
        }
        Ok(locks)
    }

    pub async fn insert_autolocked(&self, lock: &AutoLocked) -> Result<(), ManagerDbError> {
        sqlx::query(
            "INSERT OR REPLACE INTO autolocked (path, engine_uid, remote_ref, process_id, locked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(lock.path.to_string_lossy().to_string())
        .bind(&lock.engine_uid)
        .bind(&lock.remote_ref)
        .bind(lock.process_id.map(i64::from))
        .bind(lock.locked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_autolocked(&self, path: &Path) -> Result<(), ManagerDbError> {
        sqlx::query("DELETE FROM autolocked WHERE path = ?1")
            .bind(path.to_string_lossy().to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn binding_from_row(row: &SqliteRow) -> Result<EngineBinding, sqlx::Error> {
    let folder: String = row.try_get("local_folder")?;
    let remote_root: Option<String> = row.try_get("remote_root")?;
    Ok(EngineBinding {
        uid: row.try_get("uid")?,
        kind: row.try_get("kind")?,
        name: row.try_get("name")?,
        local_folder: PathBuf::from(folder),
        server_url: row.try_get("server_url")?,
        remote_user: row.try_get("remote_user")?,
        remote_root: remote_root.unwrap_or_else(|| crate::manager::DEFAULT_REMOTE_ROOT.to_string()),
    })
}
