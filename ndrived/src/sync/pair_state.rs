use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid {what}: {value}")]
pub struct StateParseError {
    what: &'static str,
    value: String,
}

/// Per-side status of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SideState {
    Unknown,
    Synchronized,
    Created,
    Modified,
    Moved,
    Deleted,
    Resolved,
    /// Local side only: the user detached the row.
    Unsynchronized,
    /// Local side only: the row belongs to a direct transfer.
    Direct,
}

impl SideState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideState::Unknown => "unknown",
            SideState::Synchronized => "synchronized",
            SideState::Created => "created",
            SideState::Modified => "modified",
            SideState::Moved => "moved",
            SideState::Deleted => "deleted",
            SideState::Resolved => "resolved",
            SideState::Unsynchronized => "unsynchronized",
            SideState::Direct => "direct",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StateParseError> {
        Ok(match value {
            "unknown" => SideState::Unknown,
            "synchronized" => SideState::Synchronized,
            "created" => SideState::Created,
            "modified" => SideState::Modified,
            "moved" => SideState::Moved,
            "deleted" => SideState::Deleted,
            "resolved" => SideState::Resolved,
            "unsynchronized" => SideState::Unsynchronized,
            "direct" => SideState::Direct,
            other => {
                return Err(StateParseError {
                    what: "side state",
                    value: other.to_string(),
                });
            }
        })
    }

    fn is_quiet(&self) -> bool {
        matches!(self, SideState::Synchronized | SideState::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    Unknown,
    Synchronized,
    LocallyCreated,
    LocallyModified,
    LocallyMoved,
    LocallyDeleted,
    LocallyResolved,
    RemotelyCreated,
    RemotelyModified,
    RemotelyMoved,
    RemotelyDeleted,
    Conflicted,
    Unsynchronized,
    DirectTransfer,
    /// Both sides gone: the row must be purged.
    Deleted,
}

impl PairState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairState::Unknown => "unknown",
            PairState::Synchronized => "synchronized",
            PairState::LocallyCreated => "locally_created",
            PairState::LocallyModified => "locally_modified",
            PairState::LocallyMoved => "locally_moved",
            PairState::LocallyDeleted => "locally_deleted",
            PairState::LocallyResolved => "locally_resolved",
            PairState::RemotelyCreated => "remotely_created",
            PairState::RemotelyModified => "remotely_modified",
            PairState::RemotelyMoved => "remotely_moved",
            PairState::RemotelyDeleted => "remotely_deleted",
            PairState::Conflicted => "conflicted",
            PairState::Unsynchronized => "unsynchronized",
            PairState::DirectTransfer => "direct_transfer",
            PairState::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StateParseError> {
        Ok(match value {
            "unknown" => PairState::Unknown,
            "synchronized" => PairState::Synchronized,
            "locally_created" => PairState::LocallyCreated,
            "locally_modified" => PairState::LocallyModified,
            "locally_moved" => PairState::LocallyMoved,
            "locally_deleted" => PairState::LocallyDeleted,
            "locally_resolved" => PairState::LocallyResolved,
            "remotely_created" => PairState::RemotelyCreated,
            "remotely_modified" => PairState::RemotelyModified,
            "remotely_moved" => PairState::RemotelyMoved,
            "remotely_deleted" => PairState::RemotelyDeleted,
            "conflicted" => PairState::Conflicted,
            "unsynchronized" => PairState::Unsynchronized,
            "direct_transfer" => PairState::DirectTransfer,
            "deleted" => PairState::Deleted,
            other => {
                return Err(StateParseError {
                    what: "pair state",
                    value: other.to_string(),
                });
            }
        })
    }

    /// Work that originates on disk and is pushed to the server.
    pub fn is_local_side(&self) -> bool {
        matches!(
            self,
            PairState::LocallyCreated
                | PairState::LocallyModified
                | PairState::LocallyMoved
                | PairState::LocallyDeleted
                | PairState::LocallyResolved
                | PairState::Conflicted
        )
    }

    pub fn is_delete(&self) -> bool {
        matches!(
            self,
            PairState::LocallyDeleted | PairState::RemotelyDeleted | PairState::Deleted
        )
    }

    /// States the processor never picks up on its own.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            PairState::Synchronized
                | PairState::Unknown
                | PairState::Unsynchronized
                | PairState::DirectTransfer
        )
    }
}

/// Derives the reconciled pair state. Pure: the same inputs always give the
/// same tag, and the stored `pair_state` column is always this function's
/// output for the row's current side states.
pub fn derive_pair_state(local: SideState, remote: SideState, folderish: bool) -> PairState {
    use SideState as S;

    match (local, remote) {
        (S::Unsynchronized, _) => PairState::Unsynchronized,
        (S::Direct, _) => PairState::DirectTransfer,
        (S::Deleted, S::Deleted) | (S::Deleted, S::Unknown) | (S::Unknown, S::Deleted) => {
            PairState::Deleted
        }
        (S::Synchronized, S::Synchronized) => PairState::Synchronized,
        (S::Unknown, S::Unknown) => PairState::Unknown,
        (S::Resolved, _) => PairState::LocallyResolved,

        // Local edits on an object that vanished remotely are re-created.
        (S::Created | S::Modified | S::Moved, S::Deleted) => PairState::LocallyCreated,
        // Remote edits on an object deleted locally are re-downloaded.
        (S::Deleted, S::Created | S::Modified | S::Moved | S::Resolved) => {
            PairState::RemotelyCreated
        }

        // Moves run before content changes on the same row.
        (S::Moved, S::Created | S::Modified) => PairState::LocallyMoved,
        (S::Created | S::Modified, S::Moved) => PairState::RemotelyMoved,
        (S::Moved, S::Moved) => PairState::RemotelyMoved,

        (local, remote) if remote.is_quiet() => match local {
            S::Created => PairState::LocallyCreated,
            S::Modified => PairState::LocallyModified,
            S::Moved => PairState::LocallyMoved,
            S::Deleted => PairState::LocallyDeleted,
            _ => PairState::Synchronized,
        },
        (local, remote) if local.is_quiet() => match remote {
            S::Created => PairState::RemotelyCreated,
            S::Modified | S::Resolved => PairState::RemotelyModified,
            S::Moved => PairState::RemotelyMoved,
            S::Deleted => PairState::RemotelyDeleted,
            _ => PairState::Synchronized,
        },

        // Both sides changed content.
        _ if folderish => PairState::Synchronized,
        _ => PairState::Conflicted,
    }
}
