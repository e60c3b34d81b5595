use std::time::Instant;

use super::*;
use crate::autolock::OpenFile;
use crate::sync::local_client::RootTag;
use crate::test_support;
use serde_json::json;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NoOpenFiles;

impl OpenFileSource for NoOpenFiles {
    fn open_files(&self) -> Vec<OpenFile> {
        Vec::new()
    }
}

struct NoOpener;

impl FileOpener for NoOpener {
    fn open(&self, _path: &Path) -> std::io::Result<()> {
        Ok(())
    }
}

fn options() -> ManagerOptions {
    ManagerOptions {
        open_files: Arc::new(NoOpenFiles),
        opener: Arc::new(NoOpener),
        token_backend: Some(TokenBackend::SealedFile),
    }
}

fn config(dir: &TempDir) -> Config {
    let mut config = Config::with_home(dir.path().join("home"));
    config.set("proxy", "none").unwrap();
    config
}

async fn open(dir: &TempDir) -> Arc<Manager> {
    Manager::open_with(config(dir), options()).await.unwrap()
}

fn request(folder: PathBuf, server: &MockServer) -> BindRequest {
    BindRequest {
        local_folder: folder,
        server_url: server.uri(),
        user: "alice".into(),
        password: None,
        token: Some("tok-1".into()),
        name: None,
        remote_root: None,
        start: false,
    }
}

async fn mount_root(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ref": "root", "name": "Workspace", "path": "/ws", "folderish": true
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn password_bind_fetches_a_token_and_survives_restart() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/authentication/token"))
        .and(query_param("permission", "ReadWrite"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tok-from-password\n"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root"))
        .and(header("X-Authentication-Token", "tok-from-password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ref": "root", "name": "Workspace", "folderish": true
        })))
        .expect(1)
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let device_id = manager.device_id().to_string();

    let mut bind = request(dir.path().join("Drive"), &server);
    bind.token = None;
    bind.password = Some("secret".into());
    let engine = manager.bind_server(bind).await.unwrap();
    let uid = engine.uid().to_string();
    assert_eq!(engine.binding().name, "Drive");
    assert_eq!(engine.binding().remote_root, DEFAULT_REMOTE_ROOT);
    assert_eq!(
        manager.engine_for_path(&dir.path().join("Drive/sub/file.txt")).map(|e| e.uid().to_string()),
        Some(uid.clone())
    );
    drop(engine);
    manager.close().await;
    drop(manager);

    let manager = open(&dir).await;
    assert_eq!(manager.device_id(), device_id);
    let engines = manager.engines();
    assert_eq!(engines.len(), 1);
    assert_eq!(engines[0].uid(), uid);
    assert_eq!(
        manager.tokens.get(&server.uri(), "alice").unwrap().as_deref(),
        Some("tok-from-password")
    );
}

#[tokio::test]
async fn binding_checks_folders_and_credentials() {
    let server = MockServer::start().await;
    mount_root(&server).await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let folder = dir.path().join("Drive");
    manager.bind_server(request(folder.clone(), &server)).await.unwrap();

    let err = manager.bind_server(request(folder.clone(), &server)).await.unwrap_err();
    assert!(matches!(err, ManagerError::FolderAlreadyBound(_)));
    assert!(err.is_domain());

    let err = manager
        .bind_server(request(folder.join("inner"), &server))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NestedFolder { .. }));

    let mut other = request(dir.path().join("Other"), &server);
    other.token = None;
    other.user = "bob".into();
    let err = manager.bind_server(other).await.unwrap_err();
    assert!(matches!(err, ManagerError::MissingCredentials(_)));

    let mut typed = request(dir.path().join("Typed"), &server);
    typed.server_url = format!("{}#nope", server.uri());
    let err = manager.bind_server(typed).await.unwrap_err();
    assert!(matches!(err, ManagerError::Engine(EngineError::UnknownKind(ref kind)) if kind == "NOPE"));
    assert!(err.is_domain());
}

#[tokio::test]
async fn read_only_fragment_selects_engine_type() {
    let server = MockServer::start().await;
    mount_root(&server).await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let mut bind = request(dir.path().join("Drive"), &server);
    bind.server_url = format!("{}#readonly", server.uri());
    let engine = manager.bind_server(bind).await.unwrap();
    assert_eq!(engine.binding().kind, "READONLY");
    assert_eq!(engine.binding().server_url, server.uri());
}

#[tokio::test]
async fn unbind_forgets_engine_database_and_token() {
    let server = MockServer::start().await;
    mount_root(&server).await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let folder = dir.path().join("Drive");
    let engine = manager.bind_server(request(folder.clone(), &server)).await.unwrap();
    let db_path = manager.config().snapshot().engine_db_path(engine.uid());
    assert!(db_path.exists());
    drop(engine);

    let err = manager.unbind_server(&folder.join("sub")).await.unwrap_err();
    assert!(matches!(err, ManagerError::NoEngineForPath(_)));

    manager.unbind_server(&folder).await.unwrap();
    assert!(manager.engines().is_empty());
    assert!(!db_path.exists());
    assert!(folder.exists());
    assert_eq!(manager.tokens.get(&server.uri(), "alice").unwrap(), None);
    assert!(manager.db.engines().await.unwrap().is_empty());
}

#[tokio::test]
async fn clean_folder_refuses_bound_folders_and_strips_tags() {
    let server = MockServer::start().await;
    mount_root(&server).await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let folder = dir.path().join("Drive");
    manager.bind_server(request(folder.clone(), &server)).await.unwrap();
    let err = manager.clean_folder(&folder).await.unwrap_err();
    assert!(matches!(err, ManagerError::FolderInUse(_)));

    let stale = dir.path().join("Stale");
    std::fs::create_dir_all(stale.join("docs")).unwrap();
    std::fs::write(stale.join("docs/a.txt"), b"a").unwrap();
    let local = LocalClient::new(&stale, IgnoreRules::default());
    local
        .set_root_tag(&RootTag {
            engine_type: "NXDRIVE".into(),
            server_url: server.uri(),
            user: "alice".into(),
            engine_uid: "old".into(),
        })
        .unwrap();
    local.set_remote_id("/docs", "f1").unwrap();
    local.set_remote_id("/docs/a.txt", "d1").unwrap();
    let tagged = if local.get_root_tag().is_some() { 3 } else { 0 };

    assert_eq!(manager.clean_folder(&stale).await.unwrap(), tagged);
    assert!(local.get_root_tag().is_none());
    assert_eq!(local.get_remote_id("/docs/a.txt").unwrap(), None);
}

#[tokio::test]
async fn config_changes_are_persisted() {
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let mut rx = manager.config().subscribe();
    manager.set_config("file_workers", "7").await.unwrap();
    rx.changed().await.unwrap();
    assert_eq!(manager.config().snapshot().file_workers, 7);

    let err = manager.set_config("no_such_key", "1").await.unwrap_err();
    assert!(err.is_domain());
    manager.close().await;
    drop(manager);

    let manager = open(&dir).await;
    assert_eq!(manager.config().snapshot().file_workers, 7);
}

#[tokio::test]
async fn deep_links_are_dispatched() {
    let server = MockServer::start().await;
    mount_root(&server).await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let folder = dir.path().join("Drive");
    let engine = manager.bind_server(request(folder.clone(), &server)).await.unwrap();
    test_support::insert(&engine, test_support::synced_file("/a.txt", "d1")).await;
    std::fs::write(folder.join("a.txt"), b"a").unwrap();
    let mut events = manager.events().subscribe();

    let outcome = manager
        .dispatch("nxdrive://token/tok-2/user/alice".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::TokenStored { engines: 1 });
    assert_eq!(
        manager.tokens.get(&server.uri(), "alice").unwrap().as_deref(),
        Some("tok-2")
    );
    let err = manager
        .dispatch("nxdrive://token/tok-3/user/bob".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::NoEngineForAccount(_)));

    let link = format!("nxdrive://access-online{}", folder.join("a.txt").display());
    let outcome = manager.dispatch(link.parse().unwrap()).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Url(format!("{}/ui/#!/doc/d1", server.uri()))
    );
    let link = format!("nxdrive://copy-share-link{}", folder.join("missing.txt").display());
    let err = manager.dispatch(link.parse().unwrap()).await.unwrap_err();
    assert!(matches!(err, ManagerError::NotSynchronized(_)));

    let outcome = manager
        .dispatch("nxdrive://authorize?code=c1".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Forwarded);
    assert!(matches!(
        events.try_recv().unwrap(),
        EngineEvent::AuthorizeRequested { ref code, state: None } if code == "c1"
    ));
}

#[tokio::test]
async fn expired_credentials_suspend_the_engine() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"digest_algorithm": "md5"})))
        .mount(&server)
        .await;
    mount_root(&server).await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [], "new_token": "t1", "has_more": false
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [], "is_next_page_available": false
        })))
        .mount(&server)
        .await;
    let dir = tempdir().unwrap();
    let manager = open(&dir).await;
    let engine = manager
        .bind_server(request(dir.path().join("Drive"), &server))
        .await
        .unwrap();
    manager.start().await.unwrap();
    assert_eq!(engine.status(), EngineStatus::Running);

    manager
        .events()
        .send(EngineEvent::AuthExpired {
            engine: engine.uid().to_string(),
        })
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while engine.status() != EngineStatus::Suspended && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(engine.status(), EngineStatus::Suspended);

    manager
        .dispatch("nxdrive://token/tok-2/user/alice".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(engine.status(), EngineStatus::Running);
    manager.stop().await;
    assert_eq!(engine.status(), EngineStatus::Stopped);
}
