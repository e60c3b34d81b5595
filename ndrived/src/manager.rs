use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use ndrive_core::{Auth, ClientIdentity, ClientOptions, ProxyError, RemoteClient, RemoteError};
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::autolock::{AutoLockError, AutoLocker, OpenFileSource, ProcOpenFiles};
use crate::config::{Config, ConfigError, ConfigHandle};
use crate::deeplink::{DeepLink, DocumentPage};
use crate::direct_edit::{DirectEdit, DirectEditError, FileOpener, SystemOpener};
use crate::events::{self, EngineEvent, EngineStatus, EventSender};
use crate::manager_db::{DEVICE_ID_KEY, DEVICE_SECRET_KEY, ManagerDb, ManagerDbError};
use crate::storage::{TokenBackend, TokenStore, TokenStoreError};
use crate::sync::engine::{
    DEFAULT_ENGINE_KIND, Engine, EngineBinding, EngineError, EngineMetrics, EngineRegistry,
    split_server_url,
};
use crate::sync::local_client::{IgnoreRules, LocalClient, LocalClientError};

pub const DEFAULT_REMOTE_ROOT: &str = "root";
const TOKEN_PERMISSION: &str = "ReadWrite";
const DIRECT_EDIT_POLL: Duration = Duration::from_secs(5);
const JOIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("manager store error: {0}")]
    Store(#[from] ManagerDbError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("token store error: {0}")]
    Tokens(#[from] TokenStoreError),
    #[error("local error: {0}")]
    Local(#[from] LocalClientError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
    #[error(transparent)]
    DirectEdit(#[from] DirectEditError),
    #[error(transparent)]
    AutoLock(#[from] AutoLockError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no engine is bound to {0}")]
    NoEngineForPath(PathBuf),
    #[error("no engine is bound for user {0}")]
    NoEngineForAccount(String),
    #[error("unknown engine {0}")]
    UnknownEngine(String),
    #[error("{0} is already bound")]
    FolderAlreadyBound(PathBuf),
    #[error("{path} overlaps the folder of engine {other}")]
    NestedFolder { path: PathBuf, other: String },
    #[error("{0} is bound to an engine, unbind it first")]
    FolderInUse(PathBuf),
    #[error("a password or a token is required for {0}")]
    MissingCredentials(String),
    #[error("{0} is not synchronized")]
    NotSynchronized(PathBuf),
}

impl ManagerError {
    /// Errors caused by the request rather than by the system.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            ManagerError::NoEngineForPath(_)
                | ManagerError::NoEngineForAccount(_)
                | ManagerError::UnknownEngine(_)
                | ManagerError::FolderAlreadyBound(_)
                | ManagerError::NestedFolder { .. }
                | ManagerError::FolderInUse(_)
                | ManagerError::MissingCredentials(_)
                | ManagerError::NotSynchronized(_)
                | ManagerError::Config(_)
                | ManagerError::Engine(EngineError::UnknownKind(_))
                | ManagerError::Engine(EngineError::RootTagMismatch { .. })
                | ManagerError::Remote(RemoteError::AuthExpired)
                | ManagerError::Remote(RemoteError::Forbidden(_))
                | ManagerError::Remote(RemoteError::NotFound(_))
                | ManagerError::DirectEdit(
                    DirectEditError::NoBoundAccount { .. }
                        | DirectEditError::LockedByOther { .. }
                        | DirectEditError::UnknownEdit(_)
                        | DirectEditError::ConflictPending(_)
                )
        )
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ManagerError + '_ {
    move |source| ManagerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Collaborators swapped out in tests.
pub struct ManagerOptions {
    pub open_files: Arc<dyn OpenFileSource>,
    pub opener: Arc<dyn FileOpener>,
    /// `None` tries the OS keyring first.
    pub token_backend: Option<TokenBackend>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            open_files: Arc::new(ProcOpenFiles),
            opener: Arc::new(SystemOpener),
            token_backend: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub local_folder: PathBuf,
    pub server_url: String,
    pub user: String,
    pub password: Option<String>,
    pub token: Option<String>,
    pub name: Option<String>,
    pub remote_root: Option<String>,
    pub start: bool,
}

/// What a deep link turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    EditStarted(PathBuf),
    TokenStored { engines: usize },
    Url(String),
    Forwarded,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineSummary {
    pub binding: EngineBinding,
    pub status: EngineStatus,
    pub metrics: EngineMetrics,
}

struct Background {
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Owns every engine and the process-wide services around them.
pub struct Manager {
    config: ConfigHandle,
    db: ManagerDb,
    registry: EngineRegistry,
    engines: RwLock<BTreeMap<String, Arc<Engine>>>,
    events: EventSender,
    tokens: TokenStore,
    device_id: String,
    direct_edit: DirectEdit,
    autolock: AutoLocker,
    background: tokio::sync::Mutex<Option<Background>>,
}

impl Manager {
    pub async fn open(config: Config) -> Result<Arc<Self>, ManagerError> {
        Self::open_with(config, ManagerOptions::default()).await
    }

    /// Loads persisted config and bindings. Engines are opened but not started.
    pub async fn open_with(
        mut config: Config,
        options: ManagerOptions,
    ) -> Result<Arc<Self>, ManagerError> {
        let db = ManagerDb::open(&config.manager_db_path()).await?;
        let mut overrides = db.config_map().await?;
        overrides.remove(DEVICE_ID_KEY);
        overrides.remove(DEVICE_SECRET_KEY);
        for rejected in config.apply_overrides(&overrides) {
            warn!(error = %rejected, "ignoring persisted config value");
        }
        let device_id = db.get_or_init(DEVICE_ID_KEY, || random_hex(16)).await?;
        let device_secret = db.get_or_init(DEVICE_SECRET_KEY, || random_hex(32)).await?;
        let tokens = match options.token_backend {
            Some(backend) => TokenStore::with_backend(&config.home, device_secret.as_bytes(), backend),
            None => TokenStore::new(&config.home, device_secret.as_bytes()),
        };

        let config = ConfigHandle::new(config);
        let events = events::channel();
        let direct_edit = DirectEdit::open(
            config.clone(),
            options.opener,
            options.open_files.clone(),
            events.clone(),
        )
        .await?;
        let autolock = AutoLocker::new(db.clone(), options.open_files, events.clone());

        let manager = Self {
            config,
            db,
            registry: EngineRegistry::default(),
            engines: RwLock::new(BTreeMap::new()),
            events,
            tokens,
            device_id,
            direct_edit,
            autolock,
            background: tokio::sync::Mutex::new(None),
        };
        for binding in manager.db.engines().await? {
            let uid = binding.uid.clone();
            if let Err(err) = manager.load_engine(binding).await {
                warn!(engine = %uid, error = %err, "engine could not be loaded");
            }
        }
        info!(
            device = %manager.device_id,
            engines = manager.engines().len(),
            "manager ready"
        );
        Ok(Arc::new(manager))
    }

    async fn load_engine(&self, binding: EngineBinding) -> Result<Arc<Engine>, ManagerError> {
        let kind = self.registry.get(&binding.kind)?;
        let token = match self.tokens.get(&binding.server_url, &binding.remote_user)? {
            Some(token) => token,
            None => {
                warn!(engine = %binding.uid, user = %binding.remote_user, "no token stored, engine will need a new one");
                String::new()
            }
        };
        let remote = self.remote_for(&binding.server_url, Auth::Token(token)).await?;
        self.direct_edit
            .register_account(&binding.server_url, &binding.remote_user, remote.clone());
        let engine = Arc::new(
            Engine::open(binding, kind, remote, self.config.clone(), self.events.clone()).await?,
        );
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(engine.uid().to_string(), engine.clone());
        Ok(engine)
    }

    /// A client configured from the current proxy and timeout settings.
    pub async fn remote_for(&self, server_url: &str, auth: Auth) -> Result<RemoteClient, ManagerError> {
        let config = self.config.snapshot();
        let options = ClientOptions {
            proxy: config.proxy.clone().resolve().await?,
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
            chunk_timeout: config.chunk_timeout,
            ..ClientOptions::default()
        };
        Ok(RemoteClient::with_options(
            server_url,
            auth,
            ClientIdentity::new(self.device_id.clone()),
            options,
        )?)
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn direct_edit(&self) -> &DirectEdit {
        &self.direct_edit
    }

    pub fn autolock(&self) -> &AutoLocker {
        &self.autolock
    }

    pub fn engine(&self, uid: &str) -> Option<Arc<Engine>> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(uid)
            .cloned()
    }

    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// The engine whose folder contains `path`, the innermost one first.
    pub fn engine_for_path(&self, path: &Path) -> Option<Arc<Engine>> {
        let path = canonical_or_same(path);
        self.engines()
            .into_iter()
            .filter(|engine| path.starts_with(&engine.binding().local_folder))
            .max_by_key(|engine| engine.binding().local_folder.components().count())
    }

    pub fn engines_for_account(&self, server_url: &str, user: &str) -> Vec<Arc<Engine>> {
        let server_url = server_url.trim_end_matches('/');
        self.engines()
            .into_iter()
            .filter(|engine| {
                let binding = engine.binding();
                binding.remote_user == user && binding.server_url.trim_end_matches('/') == server_url
            })
            .collect()
    }

    pub async fn summary(&self) -> Result<Vec<EngineSummary>, ManagerError> {
        let mut out = Vec::new();
        for engine in self.engines() {
            out.push(EngineSummary {
                binding: engine.binding().clone(),
                status: engine.status(),
                metrics: engine.metrics().await?,
            });
        }
        Ok(out)
    }

    /// Binds a local folder to a remote root and stores the account token.
    pub async fn bind_server(&self, request: BindRequest) -> Result<Arc<Engine>, ManagerError> {
        let (server_url, kind_name) = split_server_url(&request.server_url);
        let kind_name = kind_name.unwrap_or_else(|| DEFAULT_ENGINE_KIND.to_string());
        let kind = self.registry.get(&kind_name)?;

        tokio::fs::create_dir_all(&request.local_folder)
            .await
            .map_err(io_error(&request.local_folder))?;
        let folder = tokio::fs::canonicalize(&request.local_folder)
            .await
            .map_err(io_error(&request.local_folder))?;
        for engine in self.engines() {
            let other = &engine.binding().local_folder;
            if *other == folder {
                return Err(ManagerError::FolderAlreadyBound(folder));
            }
            if folder.starts_with(other) || other.starts_with(&folder) {
                return Err(ManagerError::NestedFolder {
                    path: folder,
                    other: engine.uid().to_string(),
                });
            }
        }

        let token = match (&request.token, &request.password) {
            (Some(token), _) => token.clone(),
            (None, Some(password)) => {
                let basic = Auth::Basic {
                    user: request.user.clone(),
                    password: password.clone(),
                };
                self.remote_for(&server_url, basic)
                    .await?
                    .request_token(&request.user, password, &device_description(), TOKEN_PERMISSION)
                    .await?
            }
            (None, None) => self
                .tokens
                .get(&server_url, &request.user)?
                .ok_or_else(|| ManagerError::MissingCredentials(server_url.clone()))?,
        };
        let remote = self.remote_for(&server_url, Auth::Token(token.clone())).await?;
        let remote_root = request
            .remote_root
            .clone()
            .unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string());
        remote.document(&remote_root).await?;
        self.tokens.save(&server_url, &request.user, &token)?;

        let binding = EngineBinding {
            uid: random_hex(8),
            kind: kind_name,
            name: request.name.clone().unwrap_or_else(|| {
                folder
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| server_url.clone())
            }),
            local_folder: folder,
            server_url,
            remote_user: request.user.clone(),
            remote_root,
        };
        self.db.insert_engine(&binding).await?;
        self.direct_edit
            .register_account(&binding.server_url, &binding.remote_user, remote.clone());
        let engine = Arc::new(
            Engine::open(
                binding.clone(),
                kind,
                remote,
                self.config.clone(),
                self.events.clone(),
            )
            .await?,
        );
        engine.tag_root()?;
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(binding.uid.clone(), engine.clone());
        info!(
            engine = %binding.uid,
            folder = %binding.local_folder.display(),
            server = %binding.server_url,
            kind = %binding.kind,
            "folder bound"
        );
        if request.start {
            engine.start().await?;
        }
        Ok(engine)
    }

    /// Unbinds the engine of exactly `folder`. Local files are left in place.
    pub async fn unbind_server(&self, folder: &Path) -> Result<(), ManagerError> {
        let folder = canonical_or_same(folder);
        let engine = self
            .engine_for_path(&folder)
            .filter(|engine| engine.binding().local_folder == folder)
            .ok_or_else(|| ManagerError::NoEngineForPath(folder.clone()))?;
        let binding = engine.binding().clone();
        engine.unbind().await?;
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&binding.uid);
        self.db.delete_engine(&binding.uid).await?;

        let db_path = self.config.snapshot().engine_db_path(&binding.uid);
        for suffix in ["", "-wal", "-shm"] {
            let mut name = db_path.clone().into_os_string();
            name.push(suffix);
            match tokio::fs::remove_file(&name).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(path = ?name, error = %err, "failed to remove engine database"),
            }
        }
        if self
            .engines_for_account(&binding.server_url, &binding.remote_user)
            .is_empty()
        {
            self.tokens.delete(&binding.server_url, &binding.remote_user)?;
            self.direct_edit
                .forget_account(&binding.server_url, &binding.remote_user);
        }
        info!(engine = %binding.uid, folder = %binding.local_folder.display(), "folder unbound");
        Ok(())
    }

    /// Synchronizes `remote_path` again in the engine owning `folder`.
    pub async fn bind_root(&self, folder: &Path, remote_path: &str) -> Result<(), ManagerError> {
        let engine = self
            .engine_for_path(folder)
            .ok_or_else(|| ManagerError::NoEngineForPath(folder.to_path_buf()))?;
        engine.remove_filter(remote_path).await?;
        Ok(())
    }

    /// Stops synchronizing `remote_path`; its local copy is trashed.
    pub async fn unbind_root(&self, folder: &Path, remote_path: &str) -> Result<usize, ManagerError> {
        let engine = self
            .engine_for_path(folder)
            .ok_or_else(|| ManagerError::NoEngineForPath(folder.to_path_buf()))?;
        Ok(engine.add_filter(remote_path).await?)
    }

    /// Strips every sync tag under an unbound folder.
    pub async fn clean_folder(&self, folder: &Path) -> Result<usize, ManagerError> {
        if self.engine_for_path(folder).is_some() {
            return Err(ManagerError::FolderInUse(folder.to_path_buf()));
        }
        let folder = canonical_or_same(folder);
        let local = LocalClient::new(&folder, IgnoreRules::from_config(&self.config.snapshot())?);
        let mut cleaned = 0;
        if local.get_root_tag().is_some() {
            local.remove_root_tag()?;
            cleaned += 1;
        }
        let mut pending = vec![crate::sync::paths::ROOT.to_string()];
        while let Some(dir) = pending.pop() {
            for child in local.get_children(&dir).await? {
                if child.remote_ref.is_some() {
                    local.remove_remote_id(&child.local_path)?;
                    cleaned += 1;
                }
                if child.folderish {
                    pending.push(child.local_path);
                }
            }
        }
        info!(folder = %folder.display(), cleaned, "folder cleaned");
        Ok(cleaned)
    }

    /// Sets a config key, persists it, then publishes the new snapshot.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<(), ManagerError> {
        let db = &self.db;
        self.config
            .update(
                |config| config.set(key, value).map_err(ManagerError::from),
                async |_config: &Config| {
                    db.set_config(key, Some(value))
                        .await
                        .map_err(ManagerError::from)
                },
            )
            .await?;
        info!(key, value, "config updated");
        Ok(())
    }

    /// Starts every engine and the process-wide loops.
    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }
        let engines = self.engines();
        match self.autolock.release_closed(&engines).await {
            Ok(0) => {}
            Ok(released) => info!(released, "orphan locks released"),
            Err(err) => warn!(error = %err, "orphan lock recovery failed"),
        }
        for engine in &engines {
            if let Err(err) = engine.start().await {
                error!(engine = %engine.uid(), error = %err, "engine failed to start");
            }
        }

        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let tasks = vec![
            (
                "supervisor",
                tokio::spawn(supervise(weak.clone(), self.events.subscribe(), cancel.clone())),
            ),
            ("autolock", tokio::spawn(autolock_loop(weak.clone(), cancel.clone()))),
            ("direct-edit", tokio::spawn(direct_edit_loop(weak, cancel.clone()))),
        ];
        *background = Some(Background { cancel, tasks });
        info!(engines = engines.len(), "manager started");
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(background) = self.background.lock().await.take() {
            background.cancel.cancel();
            self.direct_edit.shutdown();
            for (name, handle) in background.tasks {
                let abort = handle.abort_handle();
                if tokio::time::timeout(JOIN_TIMEOUT, handle).await.is_err() {
                    warn!(task = name, "task did not stop in time, abandoning");
                    abort.abort();
                }
            }
        }
        for engine in self.engines() {
            engine.stop().await;
        }
        info!("manager stopped");
    }

    /// Runs a parsed deep link.
    pub async fn dispatch(&self, link: DeepLink) -> Result<DispatchOutcome, ManagerError> {
        debug!(command = link.command(), "dispatching deep link");
        match link {
            DeepLink::Edit(request) => Ok(DispatchOutcome::EditStarted(
                self.direct_edit.start(&request).await?,
            )),
            DeepLink::Token { token, user } => self.store_token(&user, &token).await,
            DeepLink::AccessOnline { path } => self.document_url(&path, DocumentPage::Online).await,
            DeepLink::CopyShareLink { path } => self.document_url(&path, DocumentPage::Share).await,
            DeepLink::EditMetadata { path } => {
                self.document_url(&path, DocumentPage::Metadata).await
            }
            DeepLink::DirectTransfer { paths } => {
                let _ = self.events.send(EngineEvent::DirectTransferRequested {
                    paths: paths
                        .iter()
                        .map(|path| path.to_string_lossy().to_string())
                        .collect(),
                });
                Ok(DispatchOutcome::Forwarded)
            }
            DeepLink::Authorize { code, state } => {
                let _ = self
                    .events
                    .send(EngineEvent::AuthorizeRequested { code, state });
                Ok(DispatchOutcome::Forwarded)
            }
        }
    }

    /// Replaces the token of every engine of `user` and wakes the ones
    /// suspended for expired credentials.
    async fn store_token(&self, user: &str, token: &str) -> Result<DispatchOutcome, ManagerError> {
        let engines: Vec<_> = self
            .engines()
            .into_iter()
            .filter(|engine| engine.binding().remote_user == user)
            .collect();
        if engines.is_empty() {
            return Err(ManagerError::NoEngineForAccount(user.to_string()));
        }
        for engine in &engines {
            let binding = engine.binding();
            self.tokens.save(&binding.server_url, user, token)?;
            engine.context().remote.set_token(token);
            if engine.status() == EngineStatus::Suspended {
                engine.resume().await?;
            }
        }
        info!(user, engines = engines.len(), "token updated");
        Ok(DispatchOutcome::TokenStored {
            engines: engines.len(),
        })
    }

    async fn document_url(
        &self,
        path: &Path,
        page: DocumentPage,
    ) -> Result<DispatchOutcome, ManagerError> {
        let absolute = canonical_or_same(path);
        let engine = self
            .engine_for_path(&absolute)
            .ok_or_else(|| ManagerError::NoEngineForPath(path.to_path_buf()))?;
        let ctx = engine.context();
        let local_path = ctx
            .local
            .local_path(&absolute)
            .map_err(|_| ManagerError::NotSynchronized(path.to_path_buf()))?;
        let remote_ref = ctx
            .db
            .get_by_path(&local_path)
            .await
            .map_err(EngineError::from)?
            .and_then(|row| row.remote_ref)
            .ok_or_else(|| ManagerError::NotSynchronized(path.to_path_buf()))?;
        Ok(DispatchOutcome::Url(
            page.url(&engine.binding().server_url, &remote_ref),
        ))
    }

    pub async fn close(&self) {
        self.stop().await;
        self.direct_edit.close().await;
        self.db.close().await;
    }
}

/// Reacts to engine-level failures: expired credentials suspend that
/// engine, a full disk suspends them all.
async fn supervise(
    manager: Weak<Manager>,
    mut events: tokio::sync::broadcast::Receiver<EngineEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "supervisor missed events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event {
            EngineEvent::AuthExpired { engine } => {
                if let Some(engine) = manager.engine(&engine) {
                    warn!(engine = %engine.uid(), "credentials rejected, suspending engine");
                    engine.suspend().await;
                }
            }
            EngineEvent::NoSpaceLeft { engine } => {
                error!(engine = %engine, "no space left on device, suspending every engine");
                for engine in manager.engines() {
                    engine.suspend().await;
                }
            }
            _ => {}
        }
    }
}

async fn autolock_loop(manager: Weak<Manager>, cancel: CancellationToken) {
    loop {
        let interval = match manager.upgrade() {
            Some(manager) => manager.config.snapshot().autolock_interval,
            None => break,
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match manager.autolock.scan_once(&manager.engines()).await {
            Ok(report) if report.locked + report.unlocked > 0 => {
                debug!(locked = report.locked, unlocked = report.unlocked, "autolock round");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "autolock round failed"),
        }
    }
}

async fn direct_edit_loop(manager: Weak<Manager>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(DIRECT_EDIT_POLL) => {}
        }
        let Some(manager) = manager.upgrade() else {
            break;
        };
        if let Err(err) = manager.direct_edit.poll_once().await {
            warn!(error = %err, "direct edit round failed");
        }
    }
}

fn canonical_or_same(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.r#gen::<u8>())).collect()
}

fn device_description() -> String {
    format!("ndrive on {}", std::env::consts::OS)
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
