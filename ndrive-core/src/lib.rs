mod client;
mod error;
mod model;
mod proxy;
mod retry;

pub use client::{Auth, ClientIdentity, ClientOptions, ContentStream, RemoteClient};
pub use error::{ApiErrorClass, RemoteError};
pub use model::{
    AuditChange, AuditPage, BatchInfo, ChangeKind, ChildrenPage, ChunkAck, ChunkUpload,
    CommitOperation, CommitRequest, CommitResult, Document, LockInfo, ServerConfiguration,
};
pub use proxy::{PacScript, ProxyError, ProxySettings, ProxySpec};
pub use retry::RetryPolicy;
