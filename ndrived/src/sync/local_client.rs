use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use super::digest::{DigestAlgorithm, file_digest};
use super::paths::{self, PathError};
use super::transfer::is_partial_name;
use crate::config::Config;

#[cfg(target_os = "macos")]
const REMOTE_ID_TAG: &str = "ndrive";
#[cfg(not(target_os = "macos"))]
const REMOTE_ID_TAG: &str = "user.ndrive";
#[cfg(target_os = "macos")]
const ROOT_TAG: &str = "ndriveroot";
#[cfg(not(target_os = "macos"))]
const ROOT_TAG: &str = "user.ndriveroot";

const FORBIDDEN_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

#[derive(Debug, Error)]
pub enum LocalClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl LocalClientError {
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            LocalClientError::Io(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub local_path: String,
    pub name: String,
    pub folderish: bool,
    pub size: u64,
    /// Unix milliseconds.
    pub mtime: i64,
    pub remote_ref: Option<String>,
}

/// Names the engine never synchronizes.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    files: Vec<Regex>,
    folders: Vec<String>,
}

impl IgnoreRules {
    pub fn new(
        prefixes: &[String],
        suffixes: &[String],
        patterns: &[String],
    ) -> Result<Self, LocalClientError> {
        let files = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            prefixes: prefixes.iter().map(|p| p.to_lowercase()).collect(),
            suffixes: suffixes.iter().map(|s| s.to_lowercase()).collect(),
            files,
            folders: Vec::new(),
        })
    }

    /// Folder names skipped along with everything below them. A trailing `*`
    /// matches any suffix.
    pub fn with_excluded_folders(mut self, folders: &[String]) -> Self {
        self.folders = folders.iter().map(|f| f.to_lowercase()).collect();
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, LocalClientError> {
        Ok(Self::new(
            &config.ignored_prefixes,
            &config.ignored_suffixes,
            &config.ignored_files,
        )?
        .with_excluded_folders(&config.excluded_folders))
    }

    pub fn is_excluded_folder(&self, name: &str) -> bool {
        let lower = name.to_lowercase();
        self.folders.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => lower.starts_with(prefix),
            None => lower == *pattern,
        })
    }

    pub fn is_ignored_name(&self, name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || is_partial_name(name) {
            return true;
        }
        let lower = name.to_lowercase();
        self.prefixes.iter().any(|p| lower.starts_with(p.as_str()))
            || self.suffixes.iter().any(|s| lower.ends_with(s.as_str()))
            || self.files.iter().any(|re| re.is_match(&lower))
    }
}

/// The `ndriveroot` tuple binding a folder to one engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootTag {
    pub engine_type: String,
    pub server_url: String,
    pub user: String,
    pub engine_uid: String,
}

impl RootTag {
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.engine_type, self.server_url, self.user, self.engine_uid
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(4, '|');
        let engine_type = parts.next()?.to_string();
        let server_url = parts.next()?.to_string();
        let user = parts.next()?.to_string();
        let engine_uid = parts.next()?.to_string();
        if engine_uid.is_empty() {
            return None;
        }
        Some(Self {
            engine_type,
            server_url,
            user,
            engine_uid,
        })
    }
}

/// Filesystem access for one engine root. Paths in and out are engine-relative.
#[derive(Debug, Clone)]
pub struct LocalClient {
    root: PathBuf,
    ignore: Arc<IgnoreRules>,
    use_trash: bool,
    digests: Arc<AtomicU64>,
}

impl LocalClient {
    pub fn new(root: impl Into<PathBuf>, ignore: IgnoreRules) -> Self {
        Self {
            root: root.into(),
            ignore: Arc::new(ignore),
            use_trash: true,
            digests: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_trash(mut self, use_trash: bool) -> Self {
        self.use_trash = use_trash;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn abspath(&self, local_path: &str) -> Result<PathBuf, LocalClientError> {
        Ok(paths::to_absolute(&self.root, local_path)?)
    }

    pub fn local_path(&self, absolute: &Path) -> Result<String, LocalClientError> {
        Ok(paths::to_local(&self.root, absolute)?)
    }

    pub async fn exists(&self, local_path: &str) -> bool {
        match self.abspath(local_path) {
            Ok(path) => tokio::fs::symlink_metadata(path).await.is_ok(),
            Err(_) => false,
        }
    }

    pub async fn get_info(&self, local_path: &str) -> Result<Option<FileInfo>, LocalClientError> {
        let path = self.abspath(local_path)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let folderish = metadata.is_dir();
        Ok(Some(FileInfo {
            local_path: local_path.to_string(),
            name: paths::name(local_path).to_string(),
            folderish,
            size: if folderish { 0 } else { metadata.len() },
            mtime,
            remote_ref: read_tag(&path, REMOTE_ID_TAG),
        }))
    }

    /// Children that are not ignored, sorted by name.
    pub async fn get_children(&self, local_path: &str) -> Result<Vec<FileInfo>, LocalClientError> {
        let path = self.abspath(local_path)?;
        let mut entries = tokio::fs::read_dir(&path).await?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %entry.path().display(), "skipping non-unicode name");
                continue;
            };
            if self.is_ignored(&name) {
                continue;
            }
            let child = paths::join(local_path, &name);
            if self.ignore.is_excluded_folder(&name) {
                debug!(path = %child, "skipping excluded folder");
                continue;
            }
            if let Some(info) = self.get_info(&child).await? {
                children.push(info);
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignore.is_ignored_name(name)
    }

    /// True when any component of `local_path` is ignored or when the path
    /// is, or lies below, an excluded folder.
    pub fn is_ignored_path(&self, local_path: &str) -> bool {
        local_path
            .split('/')
            .filter(|part| !part.is_empty())
            .any(|part| self.is_ignored(part) || self.ignore.is_excluded_folder(part))
    }

    pub async fn mkdir(&self, parent: &str, name: &str) -> Result<String, LocalClientError> {
        let local_path = paths::join(parent, &safe_filename(name));
        let path = self.abspath(&local_path)?;
        match tokio::fs::create_dir(&path).await {
            Ok(()) => Ok(local_path),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {
                Ok(local_path)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Writes through a hidden sibling then renames it into place.
    pub async fn write_file(&self, local_path: &str, content: &[u8]) -> Result<(), LocalClientError> {
        let path = self.abspath(local_path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = super::transfer::partial_path(&path);
        tokio::fs::write(&temp, content).await?;
        if let Err(err) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn update_content(
        &self,
        local_path: &str,
        content: &[u8],
    ) -> Result<(), LocalClientError> {
        if !self.exists(local_path).await {
            return Err(LocalClientError::NotFound(local_path.to_string()));
        }
        let remote_ref = self.get_remote_id(local_path)?;
        self.write_file(local_path, content).await?;
        if let Some(remote_ref) = remote_ref {
            self.set_remote_id(local_path, &remote_ref)?;
        }
        Ok(())
    }

    pub async fn digest(
        &self,
        local_path: &str,
        algorithm: DigestAlgorithm,
    ) -> Result<String, LocalClientError> {
        let digest = file_digest(&self.abspath(local_path)?, algorithm).await?;
        self.digests.fetch_add(1, Ordering::Relaxed);
        Ok(digest)
    }

    /// Number of file digests computed through this client and its clones.
    pub fn digests_computed(&self) -> u64 {
        self.digests.load(Ordering::Relaxed)
    }

    /// Sends the object to the trash when possible, deleting it otherwise.
    pub async fn delete(&self, local_path: &str) -> Result<(), LocalClientError> {
        let path = self.abspath(local_path)?;
        if tokio::fs::symlink_metadata(&path).await.is_err() {
            return Ok(());
        }
        if self.use_trash {
            let target = path.clone();
            let trashed = tokio::task::spawn_blocking(move || trash::delete(&target))
                .await
                .map_err(io::Error::other)?;
            match trashed {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "trash unavailable, deleting");
                }
            }
        }
        self.delete_final(local_path).await
    }

    pub async fn delete_final(&self, local_path: &str) -> Result<(), LocalClientError> {
        let path = self.abspath(local_path)?;
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        if metadata.is_dir() {
            make_writable_tree(&path)?;
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            set_readonly(&path, false)?;
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Renames in place, returning the new engine-relative path.
    pub async fn rename(&self, local_path: &str, new_name: &str) -> Result<String, LocalClientError> {
        let parent = paths::parent(local_path).unwrap_or(paths::ROOT);
        let target = paths::join(parent, &safe_filename(new_name));
        self.move_path(local_path, &target).await?;
        Ok(target)
    }

    pub async fn move_to(
        &self,
        local_path: &str,
        new_parent: &str,
        new_name: Option<&str>,
    ) -> Result<String, LocalClientError> {
        let name = new_name.unwrap_or_else(|| paths::name(local_path));
        let target = paths::join(new_parent, &safe_filename(name));
        self.move_path(local_path, &target).await?;
        Ok(target)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<(), LocalClientError> {
        if from == to {
            return Ok(());
        }
        let source = self.abspath(from)?;
        let target = self.abspath(to)?;
        if tokio::fs::symlink_metadata(&source).await.is_err() {
            return Err(LocalClientError::NotFound(from.to_string()));
        }
        // Case-only renames resolve to the same file on case-insensitive filesystems.
        if tokio::fs::symlink_metadata(&target).await.is_ok()
            && !from.eq_ignore_ascii_case(to)
        {
            return Err(LocalClientError::AlreadyExists(to.to_string()));
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }

    pub fn set_remote_id(&self, local_path: &str, remote_ref: &str) -> Result<(), LocalClientError> {
        let path = self.abspath(local_path)?;
        write_tag(&path, REMOTE_ID_TAG, remote_ref)?;
        Ok(())
    }

    pub fn get_remote_id(&self, local_path: &str) -> Result<Option<String>, LocalClientError> {
        let path = self.abspath(local_path)?;
        Ok(read_tag(&path, REMOTE_ID_TAG))
    }

    pub fn remove_remote_id(&self, local_path: &str) -> Result<(), LocalClientError> {
        let path = self.abspath(local_path)?;
        remove_tag(&path, REMOTE_ID_TAG)?;
        Ok(())
    }

    pub fn set_root_tag(&self, tag: &RootTag) -> Result<(), LocalClientError> {
        write_tag(&self.root, ROOT_TAG, &tag.encode())?;
        Ok(())
    }

    pub fn get_root_tag(&self) -> Option<RootTag> {
        read_tag(&self.root, ROOT_TAG).and_then(|value| RootTag::parse(&value))
    }

    pub fn remove_root_tag(&self) -> Result<(), LocalClientError> {
        remove_tag(&self.root, ROOT_TAG)?;
        Ok(())
    }

    /// Makes the object read-only while a transfer owns it.
    pub fn lock_ref(&self, local_path: &str) -> Result<bool, LocalClientError> {
        let path = self.abspath(local_path)?;
        let was_readonly = std::fs::metadata(&path)?.permissions().readonly();
        if !was_readonly {
            set_readonly(&path, true)?;
        }
        Ok(was_readonly)
    }

    /// Restores write access unless the object was read-only before `lock_ref`.
    pub fn unlock_ref(&self, local_path: &str, was_readonly: bool) -> Result<(), LocalClientError> {
        if was_readonly {
            return Ok(());
        }
        let path = self.abspath(local_path)?;
        match set_readonly(&path, false) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Normalizes a name before it is created on disk.
pub fn safe_filename(name: &str) -> String {
    let normalized: String = name.nfc().collect();
    let replaced: String = normalized
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
                '-'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim_end_matches(|c: char| c.is_whitespace() || c == '.');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let (stem, ext) = match trimmed.split_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (trimmed, None),
    };
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        return match ext {
            Some(ext) => format!("{stem}_.{ext}"),
            None => format!("{stem}_"),
        };
    }
    trimmed.to_string()
}

/// Classifies editor and downloader scratch files. Returns
/// `(is_temporary, may_become_final)`: the second flag marks files that are
/// usually renamed into a real document once complete.
pub fn is_generated_tmp_file(name: &str) -> (bool, bool) {
    let lower = name.to_lowercase();
    if lower.starts_with("~$") || lower.starts_with(".~lock.") || is_partial_name(name) {
        return (true, false);
    }
    for suffix in [".tmp", ".swp", ".swx", ".swpx", "~", ".lock"] {
        if lower.ends_with(suffix) {
            return (true, false);
        }
    }
    for suffix in [".part", ".partial", ".crdownload", ".download"] {
        if lower.ends_with(suffix) {
            return (true, true);
        }
    }
    if lower == "4913" {
        return (true, false);
    }
    if let Some(rest) = lower.strip_prefix("atmp")
        && !rest.is_empty()
        && rest.chars().all(|c| c.is_ascii_digit())
    {
        return (true, false);
    }
    // Office saves through 8-hex-digit extensionless files.
    if lower.len() == 8 && lower.chars().all(|c| c.is_ascii_hexdigit()) {
        return (true, true);
    }
    (false, false)
}

fn set_readonly(path: &Path, readonly: bool) -> io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.readonly() == readonly {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = perms.mode();
        let mode = if readonly { mode & !0o222 } else { mode | 0o200 };
        perms.set_mode(mode);
    }
    #[cfg(not(unix))]
    perms.set_readonly(readonly);
    std::fs::set_permissions(path, perms)
}

fn make_writable_tree(path: &Path) -> io::Result<()> {
    set_readonly(path, false)?;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            make_writable_tree(&entry.path())?;
        } else if !file_type.is_symlink() {
            set_readonly(&entry.path(), false)?;
        }
    }
    Ok(())
}

fn tag_unsupported(err: &io::Error) -> bool {
    // ENOTSUP / EOPNOTSUPP on Linux and macOS.
    err.kind() == io::ErrorKind::Unsupported || matches!(err.raw_os_error(), Some(95 | 45 | 102))
}

#[cfg(unix)]
fn read_tag(path: &Path, name: &str) -> Option<String> {
    match xattr::get(path, name) {
        Ok(Some(value)) => String::from_utf8(value).ok().filter(|v| !v.is_empty()),
        Ok(None) => None,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "cannot read tag");
            None
        }
    }
}

#[cfg(unix)]
fn write_tag(path: &Path, name: &str, value: &str) -> io::Result<()> {
    let readonly = std::fs::metadata(path)?.permissions().readonly();
    if readonly {
        set_readonly(path, false)?;
    }
    let result = match xattr::set(path, name, value.as_bytes()) {
        Err(err) if tag_unsupported(&err) => {
            debug!(path = %path.display(), "filesystem has no extended attributes");
            Ok(())
        }
        other => other,
    };
    if readonly {
        set_readonly(path, true)?;
    }
    result
}

#[cfg(unix)]
fn remove_tag(path: &Path, name: &str) -> io::Result<()> {
    match xattr::remove(path, name) {
        Ok(()) => Ok(()),
        Err(err) if tag_unsupported(&err) || err.raw_os_error() == Some(61) => Ok(()),
        Err(err) if err.raw_os_error() == Some(93) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(windows)]
fn stream_path(path: &Path, name: &str) -> PathBuf {
    PathBuf::from(format!("{}:{name}", path.display()))
}

#[cfg(windows)]
fn read_tag(path: &Path, name: &str) -> Option<String> {
    std::fs::read_to_string(stream_path(path, name))
        .ok()
        .filter(|v| !v.is_empty())
}

#[cfg(windows)]
fn write_tag(path: &Path, name: &str, value: &str) -> io::Result<()> {
    std::fs::write(stream_path(path, name), value)
}

#[cfg(windows)]
fn remove_tag(path: &Path, name: &str) -> io::Result<()> {
    match std::fs::remove_file(stream_path(path, name)) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

#[cfg(not(any(unix, windows)))]
fn read_tag(_path: &Path, _name: &str) -> Option<String> {
    None
}

#[cfg(not(any(unix, windows)))]
fn write_tag(_path: &Path, _name: &str, _value: &str) -> io::Result<()> {
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn remove_tag(_path: &Path, _name: &str) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
#[path = "local_client_tests.rs"]
mod tests;
