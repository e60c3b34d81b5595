use serde::Serialize;

/// Remaining work per queue, published whenever the queues change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueProgress {
    pub local_folder: usize,
    pub local_file: usize,
    pub remote_folder: usize,
    pub remote_file: usize,
    pub errors: usize,
}

impl QueueProgress {
    pub fn remaining(&self) -> usize {
        self.local_folder + self.local_file + self.remote_folder + self.remote_file
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Stopped,
    Running,
    Paused,
    Suspended,
}

/// Messages the core emits for the UI collaborator. Nothing in the core
/// requires a subscriber to exist.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    Status {
        engine: String,
        status: EngineStatus,
    },
    QueueProgress {
        engine: String,
        progress: QueueProgress,
    },
    Synced {
        engine: String,
        row_id: i64,
        path: String,
    },
    Conflict {
        engine: String,
        row_id: i64,
        path: String,
    },
    RowError {
        engine: String,
        row_id: i64,
        path: String,
        kind: String,
        message: String,
    },
    RemotePoll {
        engine: String,
        changes: usize,
        full_scan: bool,
    },
    AuthExpired {
        engine: String,
    },
    NoSpaceLeft {
        engine: String,
    },
    DirectEditStarted {
        doc_id: String,
        path: String,
    },
    DirectEditUploaded {
        doc_id: String,
    },
    DirectEditConflict {
        doc_id: String,
        path: String,
    },
    DirectEditFinished {
        doc_id: String,
    },
    DirectTransferRequested {
        paths: Vec<String>,
    },
    AuthorizeRequested {
        code: String,
        state: Option<String>,
    },
    Locked {
        engine: String,
        path: String,
    },
    Unlocked {
        engine: String,
        path: String,
    },
}

pub type EventSender = tokio::sync::broadcast::Sender<EngineEvent>;

pub fn channel() -> EventSender {
    let (tx, _rx) = tokio::sync::broadcast::channel(256);
    tx
}
