use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Document {
    #[serde(rename = "ref")]
    pub uid: String,
    #[serde(default)]
    pub parent_ref: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub name: String,
    #[serde(default)]
    pub folderish: bool,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub digest_algorithm: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<i64>,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChildrenPage {
    pub entries: Vec<Document>,
    #[serde(default)]
    pub is_next_page_available: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuditChange {
    #[serde(rename = "ref")]
    pub uid: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub parent_ref: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub folderish: bool,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditPage {
    #[serde(default)]
    pub changes: Vec<AuditChange>,
    pub new_token: String,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BatchInfo {
    pub batch_id: String,
    pub chunk_size: u64,
    /// Server-side expiry, unix milliseconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
pub struct ChunkAck {
    #[serde(default)]
    pub received_chunks: Vec<u64>,
}

/// Description of one chunk PUT to an upload batch.
#[derive(Debug, Clone)]
pub struct ChunkUpload<'a> {
    pub batch_id: &'a str,
    pub file_index: u32,
    pub chunk_index: u64,
    pub chunk_count: u64,
    pub file_name: &'a str,
    pub file_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOperation {
    CreateDocument,
    UpdateDocument,
}

impl CommitOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitOperation::CreateDocument => "create",
            CommitOperation::UpdateDocument => "update",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitRequest {
    #[serde(skip)]
    pub operation: CommitOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommitResult {
    pub new_ref: String,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct LockInfo {
    pub owner: String,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerConfiguration {
    #[serde(default = "default_digest_algorithm")]
    pub digest_algorithm: String,
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub audit_poll_interval: Option<u64>,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            digest_algorithm: default_digest_algorithm(),
            chunk_size: None,
            audit_poll_interval: None,
        }
    }
}

fn default_digest_algorithm() -> String {
    "md5".to_string()
}
