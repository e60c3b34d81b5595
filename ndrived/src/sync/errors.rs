use std::io;

use ndrive_core::RemoteError;

/// Stable error kinds persisted in `states.last_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    Transient,
    AuthExpired,
    Forbidden,
    NotFound,
    ConflictDetected,
    Corrupt,
    LocalIo,
    NoSpaceLeft,
    Unsupported,
    Internal,
}

impl SyncErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            SyncErrorKind::Transient => "TRANSIENT",
            SyncErrorKind::AuthExpired => "AUTH_EXPIRED",
            SyncErrorKind::Forbidden => "FORBIDDEN",
            SyncErrorKind::NotFound => "NOT_FOUND",
            SyncErrorKind::ConflictDetected => "CONFLICT",
            SyncErrorKind::Corrupt => "CORRUPT",
            SyncErrorKind::LocalIo => "LOCAL_IO",
            SyncErrorKind::NoSpaceLeft => "NO_SPACE_LEFT",
            SyncErrorKind::Unsupported => "UNSUPPORTED",
            SyncErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "TRANSIENT" => SyncErrorKind::Transient,
            "AUTH_EXPIRED" => SyncErrorKind::AuthExpired,
            "FORBIDDEN" => SyncErrorKind::Forbidden,
            "NOT_FOUND" => SyncErrorKind::NotFound,
            "CONFLICT" => SyncErrorKind::ConflictDetected,
            "CORRUPT" => SyncErrorKind::Corrupt,
            "LOCAL_IO" => SyncErrorKind::LocalIo,
            "NO_SPACE_LEFT" => SyncErrorKind::NoSpaceLeft,
            "UNSUPPORTED" => SyncErrorKind::Unsupported,
            "INTERNAL" => SyncErrorKind::Internal,
            _ => return None,
        })
    }

    /// Row is detached instead of retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SyncErrorKind::Forbidden | SyncErrorKind::NotFound | SyncErrorKind::Unsupported
        )
    }

    pub fn from_remote(err: &RemoteError) -> Self {
        match err {
            RemoteError::Transient(_) | RemoteError::ServerBusy { .. } => SyncErrorKind::Transient,
            RemoteError::AuthExpired => SyncErrorKind::AuthExpired,
            RemoteError::Forbidden(_) => SyncErrorKind::Forbidden,
            RemoteError::NotFound(_) => SyncErrorKind::NotFound,
            RemoteError::Conflict { .. } => SyncErrorKind::ConflictDetected,
            RemoteError::Corrupt { .. } => SyncErrorKind::Corrupt,
            RemoteError::Unsupported(_) => SyncErrorKind::Unsupported,
            RemoteError::TokenInvalid => SyncErrorKind::Transient,
            RemoteError::Protocol(_) | RemoteError::Url(_) | RemoteError::Request(_) => {
                SyncErrorKind::Internal
            }
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        if is_disk_full(err) {
            SyncErrorKind::NoSpaceLeft
        } else {
            SyncErrorKind::LocalIo
        }
    }
}

pub fn is_disk_full(err: &io::Error) -> bool {
    // ENOSPC on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on Windows.
    #[cfg(unix)]
    const CODES: &[i32] = &[28];
    #[cfg(windows)]
    const CODES: &[i32] = &[39, 112];
    #[cfg(not(any(unix, windows)))]
    const CODES: &[i32] = &[];
    err.kind() == io::ErrorKind::StorageFull
        || err.raw_os_error().is_some_and(|code| CODES.contains(&code))
}
