use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ndrive_core::{ProxyError, ProxySpec};
use thiserror::Error;
use tokio::sync::{Mutex, watch};

const HOME_DIR_NAME: &str = ".ndrive";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory is unavailable")]
    MissingHome,
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("invalid proxy: {0}")]
    Proxy(#[from] ProxyError),
}

/// What happens to the server copy when a synchronized file is deleted locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    DeleteServer,
    Unsync,
}

impl DeletePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletePolicy::DeleteServer => "delete_server",
            DeletePolicy::Unsync => "unsync",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "delete_server" => Some(DeletePolicy::DeleteServer),
            "unsync" => Some(DeletePolicy::Unsync),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub home: PathBuf,
    pub quarantine: Duration,
    pub move_window: Duration,
    pub remote_poll_interval: Duration,
    pub full_scan_min_interval: Duration,
    pub max_errors: u32,
    pub max_concurrent_transfers: usize,
    pub file_workers: usize,
    pub queue_capacity: usize,
    pub storm_threshold: u64,
    pub storm_seconds: u64,
    pub autolock_interval: Duration,
    pub direct_edit_auto_lock: bool,
    pub delete_policy: DeletePolicy,
    pub ignored_prefixes: Vec<String>,
    pub ignored_suffixes: Vec<String>,
    pub ignored_files: Vec<String>,
    pub excluded_folders: Vec<String>,
    /// `system`, `none`, `manual:<url>` or `pac:<url>`. Resolver scripts
    /// are read as guarded `return` statements; see `PacScript` for the
    /// host conditions understood.
    pub proxy: ProxySpec,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub channel: String,
    pub log_level: String,
    pub log_files_kept: usize,
}

impl Config {
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            quarantine: Duration::from_secs(2),
            move_window: Duration::from_secs(5),
            remote_poll_interval: Duration::from_secs(30),
            full_scan_min_interval: Duration::from_secs(300),
            max_errors: 3,
            max_concurrent_transfers: 3,
            file_workers: 4,
            queue_capacity: 1000,
            storm_threshold: 1000,
            storm_seconds: 3,
            autolock_interval: Duration::from_secs(30),
            direct_edit_auto_lock: true,
            delete_policy: DeletePolicy::DeleteServer,
            ignored_prefixes: vec![".".into(), "~$".into(), "icon\r".into()],
            ignored_suffixes: vec![
                ".bak".into(),
                ".crdownload".into(),
                ".lock".into(),
                ".part".into(),
                ".partial".into(),
                ".swp".into(),
                ".tmp".into(),
                "~".into(),
                ".dwl".into(),
                ".dwl2".into(),
            ],
            ignored_files: vec![
                r"^atmp\d+$".into(),
                r"^desktop\.ini$".into(),
                r"^thumbs\.db$".into(),
                r"^\.ds_store$".into(),
            ],
            excluded_folders: vec![
                "$RECYCLE.BIN".into(),
                "System Volume Information".into(),
                ".Trash-*".into(),
                "lost+found".into(),
            ],
            proxy: ProxySpec::System,
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            chunk_timeout: Duration::from_secs(300),
            channel: "release".into(),
            log_level: "info".into(),
            log_files_kept: 5,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from `NDRIVE_*` variables resolved through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let user_home = dirs::home_dir().ok_or(ConfigError::MissingHome)?;
        let home = lookup("NDRIVE_HOME")
            .map(|value| expand_with_home(&value, &user_home))
            .unwrap_or_else(|| user_home.join(HOME_DIR_NAME));
        let mut config = Self::with_home(home);
        for key in KEYS {
            let env_name = format!("NDRIVE_{}", key.to_ascii_uppercase());
            if let Some(value) = lookup(&env_name) {
                config.set(key, &value)?;
            }
        }
        Ok(config)
    }

    /// Applies persisted overrides, skipping keys this version does not know.
    pub fn apply_overrides(&mut self, values: &HashMap<String, String>) -> Vec<ConfigError> {
        let mut rejected = Vec::new();
        for (key, value) in values {
            if let Err(err) = self.set(key, value) {
                rejected.push(err);
            }
        }
        rejected
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        let secs = |value: &str| parse_positive(value).map(Duration::from_secs).ok_or_else(invalid);
        match key {
            "quarantine" => self.quarantine = secs(value)?,
            "move_window" => self.move_window = secs(value)?,
            "remote_poll_interval" => self.remote_poll_interval = secs(value)?,
            "full_scan_min_interval" => self.full_scan_min_interval = secs(value)?,
            "autolock_interval" => self.autolock_interval = secs(value)?,
            "handshake_timeout" => self.handshake_timeout = secs(value)?,
            "request_timeout" => self.request_timeout = secs(value)?,
            "chunk_timeout" => self.chunk_timeout = secs(value)?,
            "max_errors" => {
                self.max_errors = parse_positive(value)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(invalid)?
            }
            "max_concurrent_transfers" => {
                self.max_concurrent_transfers = parse_usize(value).ok_or_else(invalid)?
            }
            "file_workers" => self.file_workers = parse_usize(value).ok_or_else(invalid)?,
            "queue_capacity" => self.queue_capacity = parse_usize(value).ok_or_else(invalid)?,
            "log_files_kept" => self.log_files_kept = parse_usize(value).ok_or_else(invalid)?,
            "storm_threshold" => self.storm_threshold = parse_positive(value).ok_or_else(invalid)?,
            "storm_seconds" => self.storm_seconds = parse_positive(value).ok_or_else(invalid)?,
            "direct_edit_auto_lock" => {
                self.direct_edit_auto_lock = parse_bool(value).ok_or_else(invalid)?
            }
            "delete_policy" => self.delete_policy = DeletePolicy::parse(value).ok_or_else(invalid)?,
            "ignored_prefixes" => self.ignored_prefixes = parse_list(value),
            "ignored_suffixes" => self.ignored_suffixes = parse_list(value),
            "ignored_files" => self.ignored_files = parse_list(value),
            "excluded_folders" => self.excluded_folders = parse_list(value),
            "proxy" => self.proxy = ProxySpec::parse(value)?,
            "channel" => self.channel = value.trim().to_string(),
            "log_level" => self.log_level = value.trim().to_string(),
            other => return Err(ConfigError::UnknownKey(other.to_string())),
        }
        Ok(())
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn edit_dir(&self) -> PathBuf {
        self.home.join("edit")
    }

    pub fn manager_db_path(&self) -> PathBuf {
        self.home.join("manager.db")
    }

    pub fn engine_db_path(&self, engine_uid: &str) -> PathBuf {
        self.home.join(format!("ndrive_{engine_uid}.db"))
    }
}

const KEYS: &[&str] = &[
    "quarantine",
    "move_window",
    "remote_poll_interval",
    "full_scan_min_interval",
    "max_errors",
    "max_concurrent_transfers",
    "file_workers",
    "queue_capacity",
    "storm_threshold",
    "storm_seconds",
    "autolock_interval",
    "direct_edit_auto_lock",
    "delete_policy",
    "ignored_prefixes",
    "ignored_suffixes",
    "ignored_files",
    "excluded_folders",
    "proxy",
    "handshake_timeout",
    "request_timeout",
    "chunk_timeout",
    "channel",
    "log_level",
    "log_files_kept",
];

/// Copy-on-write config shared with every worker.
#[derive(Clone)]
pub struct ConfigHandle {
    tx: Arc<watch::Sender<Arc<Config>>>,
    write_lock: Arc<Mutex<()>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self {
            tx: Arc::new(tx),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Clones the current config, applies `mutate`, then runs `persist`
    /// before publishing. Nothing is published when either step fails.
    pub async fn update<M, P, E>(&self, mutate: M, persist: P) -> Result<Arc<Config>, E>
    where
        M: FnOnce(&mut Config) -> Result<(), E>,
        P: AsyncFnOnce(&Config) -> Result<(), E>,
    {
        let _guard = self.write_lock.lock().await;
        let mut next = (*self.snapshot()).clone();
        mutate(&mut next)?;
        persist(&next).await?;
        let next = Arc::new(next);
        self.tx.send_replace(Arc::clone(&next));
        Ok(next)
    }
}

pub(crate) fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn parse_positive(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().filter(|value| *value > 0)
}

fn parse_usize(value: &str) -> Option<usize> {
    parse_positive(value).and_then(|v| usize::try_from(v).ok())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::from_lookup(lookup(&[("NDRIVE_HOME", "/tmp/ndrive-home")])).unwrap();
        assert_eq!(config.home, PathBuf::from("/tmp/ndrive-home"));
        assert_eq!(config.quarantine, Duration::from_secs(2));
        assert_eq!(config.remote_poll_interval, Duration::from_secs(30));
        assert_eq!(config.max_errors, 3);
        assert_eq!(config.max_concurrent_transfers, 3);
        assert_eq!(config.file_workers, 4);
        assert!(config.direct_edit_auto_lock);
        assert_eq!(config.delete_policy, DeletePolicy::DeleteServer);
        assert_eq!(config.engine_db_path("abc"), PathBuf::from("/tmp/ndrive-home/ndrive_abc.db"));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("NDRIVE_HOME", "/tmp/h"),
            ("NDRIVE_QUARANTINE", "5"),
            ("NDRIVE_DELETE_POLICY", "unsync"),
            ("NDRIVE_IGNORED_SUFFIXES", ".tmp, .bak"),
            ("NDRIVE_PROXY", "none"),
        ]))
        .unwrap();
        assert_eq!(config.quarantine, Duration::from_secs(5));
        assert_eq!(config.delete_policy, DeletePolicy::Unsync);
        assert_eq!(config.ignored_suffixes, vec![".tmp", ".bak"]);
        assert_eq!(config.proxy, ProxySpec::Direct);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::with_home(PathBuf::from("/tmp/h"));
        assert!(matches!(
            config.set("max_errors", "0"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config.set("nope", "1"),
            Err(ConfigError::UnknownKey(_))
        ));
        let mut overrides = HashMap::new();
        overrides.insert("file_workers".to_string(), "8".to_string());
        overrides.insert("bogus".to_string(), "1".to_string());
        let rejected = config.apply_overrides(&overrides);
        assert_eq!(rejected.len(), 1);
        assert_eq!(config.file_workers, 8);
    }

    #[tokio::test]
    async fn update_publishes_new_snapshot() {
        let handle = ConfigHandle::new(Config::with_home(PathBuf::from("/tmp/h")));
        let mut rx = handle.subscribe();
        let before = handle.snapshot();

        handle
            .update(
                |config| config.set("file_workers", "2"),
                async |_config: &Config| Ok::<(), ConfigError>(()),
            )
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().file_workers, 2);
        assert_eq!(before.file_workers, 4);
    }

    #[tokio::test]
    async fn failed_persist_keeps_old_snapshot() {
        let handle = ConfigHandle::new(Config::with_home(PathBuf::from("/tmp/h")));
        let result = handle
            .update(
                |config| config.set("file_workers", "2"),
                async |_config: &Config| Err(ConfigError::MissingHome),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(handle.snapshot().file_workers, 4);
    }
}
