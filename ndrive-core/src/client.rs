use std::sync::{Arc, RwLock};
use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::retry::RetryPolicy;
use crate::error::RemoteError;
use crate::model::{
    AuditPage, BatchInfo, ChildrenPage, ChunkAck, ChunkUpload, CommitRequest, CommitResult,
    Document, LockInfo, ServerConfiguration,
};
use crate::proxy::{ProxyError, ProxySettings};

const CHILDREN_PAGE_SIZE: u32 = 200;

/// Credentials attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    Token(String),
    Basic { user: String, password: String },
}

/// Identification headers required by the server.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub application_name: String,
    pub device_id: String,
    pub client_version: String,
}

impl ClientIdentity {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            application_name: "ndrive".to_string(),
            device_id: device_id.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn user_agent(&self) -> String {
        format!("{}/{}", self.application_name, self.client_version)
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub proxy: ProxySettings,
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub chunk_timeout: Duration,
    pub audit_timeout: Duration,
    pub pool_size: usize,
    pub retry: RetryPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            proxy: ProxySettings::System,
            handshake_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            chunk_timeout: Duration::from_secs(300),
            audit_timeout: Duration::from_secs(30),
            pool_size: 10,
            retry: RetryPolicy::default(),
        }
    }
}

/// Streaming body of a document's content.
pub struct ContentStream {
    pub response: Response,
    pub content_length: Option<u64>,
    pub digest: Option<String>,
    pub digest_algorithm: Option<String>,
}

#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    base_url: Url,
    auth: Arc<RwLock<Auth>>,
    identity: Arc<ClientIdentity>,
    options: Arc<ClientOptions>,
}

impl RemoteClient {
    pub fn new(base_url: &str, auth: Auth, identity: ClientIdentity) -> Result<Self, RemoteError> {
        Self::with_options(base_url, auth, identity, ClientOptions::default())
            .map_err(|err| RemoteError::Protocol(err.to_string()))
    }

    pub fn with_options(
        base_url: &str,
        auth: Auth,
        identity: ClientIdentity,
        options: ClientOptions,
    ) -> Result<Self, ProxyError> {
        let mut base_url = Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let builder = Client::builder()
            .connect_timeout(options.handshake_timeout)
            .pool_max_idle_per_host(options.pool_size)
            .user_agent(identity.user_agent());
        let http = options.proxy.apply(builder)?.build()?;
        Ok(Self {
            http,
            base_url,
            auth: Arc::new(RwLock::new(auth)),
            identity: Arc::new(identity),
            options: Arc::new(options),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    /// Swaps the credentials used by every clone of this client.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut guard = match self.auth.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Auth::Token(token.into());
    }

    /// Exchanges a user/password pair for a long-lived token.
    pub async fn request_token(
        &self,
        user: &str,
        password: &str,
        device_description: &str,
        permission: &str,
    ) -> Result<String, RemoteError> {
        let mut url = self.endpoint("authentication/token")?;
        url.query_pairs_mut()
            .append_pair("application_name", &self.identity.application_name)
            .append_pair("device_id", &self.identity.device_id)
            .append_pair("device_description", device_description)
            .append_pair("permission", permission);
        let request = self
            .http
            .get(url)
            .timeout(self.options.request_timeout)
            .basic_auth(user, Some(password));
        let request = self.with_identity(request).build().map_err(RemoteError::Request)?;
        let response = self.execute(request, true).await?;
        let token = response.text().await?.trim().to_string();
        if token.is_empty() {
            return Err(RemoteError::Protocol("empty token in response".into()));
        }
        Ok(token)
    }

    pub async fn server_configuration(&self) -> Result<ServerConfiguration, RemoteError> {
        let url = self.endpoint("api/v1/drive/configuration")?;
        match self.get_json(url).await {
            Ok(config) => Ok(config),
            Err(RemoteError::NotFound(_)) => Ok(ServerConfiguration::default()),
            Err(err) => Err(err),
        }
    }

    /// Returns changes under `root_ref` since `since`. Without a token the
    /// server only hands out its current cursor.
    pub async fn audit_changes(
        &self,
        since: Option<&str>,
        root_ref: &str,
    ) -> Result<AuditPage, RemoteError> {
        let mut url = self.endpoint("api/v1/drive/changes")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("root", root_ref);
            if let Some(since) = since {
                query.append_pair("since", since);
            }
        }
        let request = self
            .request(Method::GET, url)
            .timeout(self.options.audit_timeout)
            .build()
            .map_err(RemoteError::Request)?;
        let response = self.execute(request, true).await?;
        Self::decode(response).await
    }

    pub async fn document(&self, uid: &str) -> Result<Document, RemoteError> {
        let url = self.document_endpoint(uid, None)?;
        self.get_json(url).await
    }

    pub async fn children_page(
        &self,
        uid: &str,
        page_size: u32,
        page: u32,
    ) -> Result<ChildrenPage, RemoteError> {
        let mut url = self.document_endpoint(uid, Some("@children"))?;
        url.query_pairs_mut()
            .append_pair("page_size", &page_size.max(1).to_string())
            .append_pair("page", &page.to_string());
        self.get_json(url).await
    }

    pub async fn children(&self, uid: &str) -> Result<Vec<Document>, RemoteError> {
        let mut page = 0u32;
        let mut items = Vec::new();
        loop {
            let chunk = self.children_page(uid, CHILDREN_PAGE_SIZE, page).await?;
            let more = chunk.is_next_page_available && !chunk.entries.is_empty();
            items.extend(chunk.entries);
            if !more {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(items)
    }

    /// Non-folder child of `parent` called `name`, if any.
    pub async fn child_named(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<Option<Document>, RemoteError> {
        Ok(self
            .children(parent)
            .await?
            .into_iter()
            .find(|doc| !doc.folderish && doc.name == name))
    }

    pub async fn content(&self, uid: &str) -> Result<ContentStream, RemoteError> {
        let url = self.document_endpoint(uid, Some("@blob"))?;
        let request = self
            .request(Method::GET, url)
            .build()
            .map_err(RemoteError::Request)?;
        let response = self.execute(request, true).await?;
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };
        let digest = header("x-digest");
        let digest_algorithm = header("x-digest-algorithm");
        Ok(ContentStream {
            content_length: response.content_length(),
            digest,
            digest_algorithm,
            response,
        })
    }

    pub async fn open_batch(&self) -> Result<BatchInfo, RemoteError> {
        let url = self.endpoint("api/v1/upload/")?;
        let request = self
            .request(Method::POST, url)
            .build()
            .map_err(RemoteError::Request)?;
        let response = self.execute(request, false).await?;
        Self::decode(response).await
    }

    /// Uploads one chunk. Chunk PUTs carry an explicit index, so replays are safe.
    pub async fn put_chunk(
        &self,
        chunk: &ChunkUpload<'_>,
        bytes: Vec<u8>,
    ) -> Result<ChunkAck, RemoteError> {
        let url = self.endpoint(&format!(
            "api/v1/upload/{}/{}",
            chunk.batch_id, chunk.file_index
        ))?;
        let request = self
            .request(Method::PUT, url)
            .timeout(self.options.chunk_timeout)
            .header("X-Upload-Type", "chunked")
            .header("X-Upload-Chunk-Index", chunk.chunk_index.to_string())
            .header("X-Upload-Chunk-Count", chunk.chunk_count.to_string())
            .header("X-File-Name", encode_header(chunk.file_name))
            .header("X-File-Size", chunk.file_size.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .build()
            .map_err(RemoteError::Request)?;
        let response = self.execute(request, true).await?;
        Self::decode(response).await
    }

    pub async fn batch_status(
        &self,
        batch_id: &str,
        file_index: u32,
    ) -> Result<ChunkAck, RemoteError> {
        let url = self.endpoint(&format!("api/v1/upload/{batch_id}/{file_index}"))?;
        self.get_json(url).await
    }

    /// Applies an uploaded batch. Never retried here: a create whose response
    /// is lost may still have happened, so callers look the document up with
    /// [`RemoteClient::child_named`] before committing the batch again.
    pub async fn commit_batch(
        &self,
        batch_id: &str,
        file_index: u32,
        commit: &CommitRequest,
    ) -> Result<CommitResult, RemoteError> {
        let url = self.endpoint(&format!(
            "api/v1/upload/{batch_id}/{file_index}/execute/{}",
            commit.operation.as_str()
        ))?;
        self.send_json(Method::POST, url, Some(commit), false).await
    }

    pub async fn drop_batch(&self, batch_id: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&format!("api/v1/upload/{batch_id}"))?;
        let request = self
            .request(Method::DELETE, url)
            .build()
            .map_err(RemoteError::Request)?;
        match self.execute(request, true).await {
            Ok(_) | Err(RemoteError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn lock(&self, uid: &str) -> Result<LockInfo, RemoteError> {
        let url = self.document_endpoint(uid, Some("@lock"))?;
        self.send_json::<LockInfo, ()>(Method::POST, url, None, true)
            .await
    }

    pub async fn unlock(&self, uid: &str) -> Result<(), RemoteError> {
        let url = self.document_endpoint(uid, Some("@lock"))?;
        let request = self
            .request(Method::DELETE, url)
            .build()
            .map_err(RemoteError::Request)?;
        self.execute(request, true).await?;
        Ok(())
    }

    pub async fn move_document(
        &self,
        uid: &str,
        parent: &str,
        name: &str,
    ) -> Result<Document, RemoteError> {
        #[derive(Serialize)]
        struct MoveBody<'a> {
            parent: &'a str,
            name: &'a str,
        }
        let url = self.document_endpoint(uid, Some("@move"))?;
        self.send_json(Method::POST, url, Some(&MoveBody { parent, name }), false)
            .await
    }

    pub async fn delete(&self, uid: &str) -> Result<(), RemoteError> {
        let url = self.document_endpoint(uid, None)?;
        let request = self
            .request(Method::DELETE, url)
            .build()
            .map_err(RemoteError::Request)?;
        self.execute(request, true).await?;
        Ok(())
    }

    pub async fn mkdir(&self, parent: &str, name: &str) -> Result<Document, RemoteError> {
        #[derive(Serialize)]
        struct MkdirBody<'a> {
            name: &'a str,
        }
        let url = self.document_endpoint(parent, Some("@mkdir"))?;
        self.send_json(Method::POST, url, Some(&MkdirBody { name }), false)
            .await
    }

    fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
        Ok(self.base_url.join(path)?)
    }

    fn document_endpoint(&self, uid: &str, adapter: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = self.endpoint("api/v1/id/")?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| RemoteError::Protocol("base url cannot carry a path".into()))?;
            segments.pop_if_empty().push(uid);
            if let Some(adapter) = adapter {
                segments.push(adapter);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .timeout(self.options.request_timeout);
        let auth = match self.auth.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let builder = match auth {
            Auth::Token(token) => builder.header("X-Authentication-Token", token),
            Auth::Basic { user, password } => builder.basic_auth(user, Some(password)),
        };
        self.with_identity(builder)
    }

    fn with_identity(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("X-Application-Name", &self.identity.application_name)
            .header("X-Device-Id", &self.identity.device_id)
            .header("X-Client-Version", &self.identity.client_version)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
        let request = self
            .request(Method::GET, url)
            .build()
            .map_err(RemoteError::Request)?;
        let response = self.execute(request, true).await?;
        Self::decode(response).await
    }

    async fn send_json<T, B>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
        replay_safe: bool,
    ) -> Result<T, RemoteError>
    where
        T: serde::de::DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let request = builder.build().map_err(RemoteError::Request)?;
        let response = self.execute(request, replay_safe).await?;
        Self::decode(response).await
    }

    /// Sends `request`, retrying with backoff when it is replay-safe and the
    /// failure is transient. `Retry-After` overrides the computed delay.
    async fn execute(
        &self,
        request: reqwest::Request,
        replay_safe: bool,
    ) -> Result<Response, RemoteError> {
        let policy = if replay_safe {
            self.options.retry
        } else {
            RetryPolicy::none()
        };
        let mut attempt = 0u32;
        loop {
            let Some(current) = request.try_clone() else {
                return self.send_once(request).await;
            };
            let method = current.method().clone();
            let url = current.url().clone();
            match self.send_once(current).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && policy.allows_retry(attempt) => {
                    let delay = err
                        .retry_after()
                        .unwrap_or_else(|| policy.delay(attempt));
                    warn!(%method, %url, attempt, ?delay, error = %err, "retrying request");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn send_once(&self, request: reqwest::Request) -> Result<Response, RemoteError> {
        debug!(method = %request.method(), url = %request.url(), "http request");
        let response = self.http.execute(request).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(RemoteError::from_response(response).await)
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        let status = response.status();
        let bytes = response.bytes().await?;
        if status == StatusCode::NO_CONTENT || bytes.is_empty() {
            return serde_json::from_slice(b"null")
                .map_err(|err| RemoteError::Protocol(format!("empty body: {err}")));
        }
        serde_json::from_slice(&bytes).map_err(|err| RemoteError::Protocol(err.to_string()))
    }
}

/// Percent-encodes non-ASCII file names so they survive as a header value.
fn encode_header(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
