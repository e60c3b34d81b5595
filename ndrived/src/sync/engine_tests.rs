use super::*;
use crate::config::Config;
use ndrive_core::{Auth, ClientIdentity, ClientOptions, RetryPolicy};
use serde_json::json;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    engine: Engine,
}

impl Fixture {
    async fn insert(&self, new: NewPair) -> DocPair {
        let db = &self.engine.context().db;
        let mut txn = db.write().await.unwrap();
        let pair = txn.insert(new).await.unwrap();
        txn.commit().await.unwrap();
        pair
    }

    async fn row(&self, id: i64) -> Option<DocPair> {
        self.engine.context().db.get(id).await.unwrap()
    }
}

fn binding(root: PathBuf) -> EngineBinding {
    EngineBinding {
        uid: "engine-1".into(),
        kind: DEFAULT_ENGINE_KIND.into(),
        name: "Drive".into(),
        local_folder: root,
        server_url: "https://drive.example.com/ctx".into(),
        remote_user: "alice".into(),
        remote_root: "root".into(),
    }
}

async fn fixture(server: &MockServer) -> Fixture {
    let dir = tempdir().unwrap();
    let root = dir.path().join("Drive");
    std::fs::create_dir_all(&root).unwrap();
    let config = Config::with_home(dir.path().join("home"));
    let db = StateDb::open(&config.engine_db_path("engine-1")).await.unwrap();
    let options = ClientOptions {
        retry: RetryPolicy::none(),
        ..ClientOptions::default()
    };
    let remote = RemoteClient::with_options(
        &server.uri(),
        Auth::Token("secret".into()),
        ClientIdentity::new("device-1"),
        options,
    )
    .unwrap();
    let local = LocalClient::new(&root, IgnoreRules::from_config(&config).unwrap()).with_trash(false);
    let ctx = EngineContext::new(
        "engine-1",
        Arc::new(StandardEngine),
        db,
        local,
        remote,
        "root",
        ConfigHandle::new(config),
        crate::events::channel(),
    );
    Fixture {
        engine: Engine::with_context(binding(root.clone()), ctx),
        root,
        _dir: dir,
    }
}

async fn mount_idle_server(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/configuration"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"digest_algorithm": "sha256", "chunk_size": 4096})),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ref": "root", "name": "Workspace", "path": "/ws", "folderish": true
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "changes": [], "new_token": "t1", "has_more": false
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [], "is_next_page_available": false
        })))
        .mount(server)
        .await;
}

fn conflicted_file(local_path: &str) -> NewPair {
    NewPair {
        local_path: local_path.into(),
        local_state: Some(SideState::Modified),
        remote_state: Some(SideState::Modified),
        remote_ref: Some("d1".into()),
        ..NewPair::default()
    }
}

#[test]
fn server_url_fragment_selects_engine_type() {
    assert_eq!(
        split_server_url("https://host/ctx#readonly"),
        ("https://host/ctx".to_string(), Some("READONLY".to_string()))
    );
    assert_eq!(split_server_url("https://host/ctx#"), ("https://host/ctx".to_string(), None));
    assert_eq!(split_server_url("https://host/ctx"), ("https://host/ctx".to_string(), None));
}

#[test]
fn registry_knows_both_engine_types() {
    let registry = EngineRegistry::default();
    assert_eq!(registry.names(), vec![DEFAULT_ENGINE_KIND, READONLY_ENGINE_KIND]);
    let readonly = registry.get(READONLY_ENGINE_KIND).unwrap();
    assert!(readonly.handles(PairState::RemotelyCreated));
    assert!(!readonly.handles(PairState::LocallyModified));
    assert!(!readonly.handles(PairState::Synchronized));
    assert!(matches!(registry.get("FTP"), Err(EngineError::UnknownKind(_))));
}

#[tokio::test]
async fn start_prepares_the_store_and_stop_joins_tasks() {
    let server = MockServer::start().await;
    mount_idle_server(&server).await;
    let fx = fixture(&server).await;

    fx.engine.start().await.unwrap();
    assert_eq!(fx.engine.status(), EngineStatus::Running);
    let ctx = fx.engine.context();
    let root = ctx.db.root().await.unwrap().unwrap();
    assert_eq!(root.remote_ref.as_deref(), Some("root"));
    assert_eq!(
        ctx.db.get_config(REMOTE_ROOT_PATH_KEY).await.unwrap().as_deref(),
        Some("/ws")
    );
    assert_eq!(ctx.algorithm(), DigestAlgorithm::Sha256);

    // A second start is a no-op.
    fx.engine.start().await.unwrap();

    fx.engine.stop().await;
    assert_eq!(fx.engine.status(), EngineStatus::Stopped);
    assert_eq!(ctx.queues.progress().remaining(), 0);
    assert_eq!(ctx.db.counts().await.unwrap().syncing, 0);
}

#[tokio::test]
async fn corrupted_store_is_restored_from_the_stop_backup() {
    let server = MockServer::start().await;
    mount_idle_server(&server).await;
    let fx = fixture(&server).await;
    let kept = fx
        .insert(NewPair {
            local_path: "/kept.txt".into(),
            local_state: Some(SideState::Unsynchronized),
            remote_state: Some(SideState::Synchronized),
            remote_ref: Some("d9".into()),
            ..NewPair::default()
        })
        .await;

    fx.engine.start().await.unwrap();
    fx.engine.stop().await;
    let ctx = fx.engine.context();
    let db_path = ctx.config.snapshot().engine_db_path("engine-1");
    ctx.db.close().await;

    std::fs::write(&db_path, b"definitely not a sqlite database file, just garbage bytes").unwrap();
    for sidecar in ["-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{sidecar}", db_path.display()));
    }

    let remote = RemoteClient::with_options(
        &server.uri(),
        Auth::Token("secret".into()),
        ClientIdentity::new("device-1"),
        ClientOptions {
            retry: RetryPolicy::none(),
            ..ClientOptions::default()
        },
    )
    .unwrap();
    let reopened = Engine::open(
        binding(fx.root.clone()),
        Arc::new(StandardEngine),
        remote,
        ctx.config.clone(),
        crate::events::channel(),
    )
    .await
    .unwrap();
    let restored = reopened.context().db.get(kept.id).await.unwrap().unwrap();
    assert_eq!(restored.local_path, "/kept.txt");
    assert_eq!(restored.remote_ref.as_deref(), Some("d9"));

    reopened.start().await.unwrap();
    reopened.stop().await;
}

#[tokio::test]
async fn missing_root_folder_refuses_to_start() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    std::fs::remove_dir(&fx.root).unwrap();

    let err = fx.engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::RootMissing(_)));
    assert_eq!(fx.engine.status(), EngineStatus::Stopped);
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn folder_tagged_by_another_engine_refuses_to_start() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    let mut foreign = fx.engine.binding().root_tag();
    foreign.engine_uid = "engine-2".into();
    fx.engine.context().local.set_root_tag(&foreign).unwrap();
    if fx.engine.context().local.get_root_tag().is_none() {
        // Extended attributes are unavailable on this filesystem.
        return;
    }

    let err = fx.engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::RootTagMismatch { owner, .. } if owner == "engine-2"));
}

#[tokio::test]
async fn expired_credentials_stop_startup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/configuration"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let fx = fixture(&server).await;

    let err = fx.engine.start().await.unwrap_err();
    assert!(matches!(err, EngineError::Remote(RemoteError::AuthExpired)));
    assert_eq!(fx.engine.status(), EngineStatus::Stopped);
}

#[tokio::test]
async fn conflict_resolution_commands_update_the_row() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    let local = fx.insert(conflicted_file("/a.txt")).await;
    let remote = fx.insert(conflicted_file("/b.txt")).await;
    {
        let mut txn = fx.engine.context().db.write().await.unwrap();
        txn.mark_checked(local.id).await.unwrap();
        txn.commit().await.unwrap();
    }
    assert_eq!(fx.engine.conflicts().await.unwrap().len(), 2);

    fx.engine.resolve_with_local(local.id).await.unwrap();
    let row = fx.row(local.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::LocallyResolved);
    assert_eq!(row.checked_version, None);

    fx.engine.resolve_with_remote(remote.id).await.unwrap();
    let row = fx.row(remote.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::RemotelyModified);

    assert!(matches!(
        fx.engine.retry(999).await,
        Err(EngineError::MissingRow(999))
    ));
}

#[tokio::test]
async fn unsynchronize_and_resynchronize_round_trip() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    let row = fx
        .insert(NewPair {
            local_path: "/a.txt".into(),
            local_state: Some(SideState::Modified),
            remote_state: Some(SideState::Synchronized),
            remote_ref: Some("d1".into()),
            ..NewPair::default()
        })
        .await;

    fx.engine.unsynchronize(row.id).await.unwrap();
    assert_eq!(fx.engine.unsynchronized().await.unwrap().len(), 1);
    let detached = fx.row(row.id).await.unwrap();
    assert_eq!(detached.suspended_local_state, Some(SideState::Modified));

    fx.engine.resynchronize(row.id).await.unwrap();
    let restored = fx.row(row.id).await.unwrap();
    assert_eq!(restored.pair_state, PairState::LocallyModified);
    assert_eq!(restored.suspended_local_state, None);
}

#[tokio::test]
async fn retry_clears_recorded_errors() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    let row = fx.insert(conflicted_file("/a.txt")).await;
    fx.engine
        .context()
        .db
        .update_pair(row.id, |pair| {
            pair.error_count = 5;
            pair.last_error = Some("TRANSIENT".into());
            pair.retry_after = Some(i64::MAX);
        })
        .await
        .unwrap();
    assert_eq!(fx.engine.errors().await.unwrap().len(), 1);

    fx.engine.retry(row.id).await.unwrap();
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.error_count, 0);
    assert_eq!(row.retry_after, None);
    assert!(fx.engine.errors().await.unwrap().is_empty());
}

#[tokio::test]
async fn filters_drop_rows_and_local_copies() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    let ctx = fx.engine.context();
    ctx.db.set_config(REMOTE_ROOT_PATH_KEY, Some("/ws")).await.unwrap();
    std::fs::create_dir_all(fx.root.join("Private")).unwrap();
    std::fs::write(fx.root.join("Private/x.txt"), b"secret").unwrap();
    fx.insert(NewPair {
        local_path: "/Private".into(),
        folderish: true,
        local_state: Some(SideState::Synchronized),
        remote_state: Some(SideState::Synchronized),
        remote_ref: Some("p1".into()),
        ..NewPair::default()
    })
    .await;
    fx.insert(NewPair {
        local_path: "/Private/x.txt".into(),
        local_state: Some(SideState::Synchronized),
        remote_state: Some(SideState::Synchronized),
        remote_ref: Some("x1".into()),
        ..NewPair::default()
    })
    .await;
    let kept = fx.insert(conflicted_file("/kept.txt")).await;
    {
        let mut txn = ctx.db.write().await.unwrap();
        txn.set_remote_token("t9").await.unwrap();
        txn.commit().await.unwrap();
    }

    assert_eq!(
        fx.engine.local_path_for("/ws/Private").await.unwrap().as_deref(),
        Some("/Private")
    );
    assert_eq!(fx.engine.local_path_for("/elsewhere").await.unwrap(), None);

    let purged = fx.engine.add_filter("/ws/Private").await.unwrap();
    assert_eq!(purged, 2);
    assert!(!fx.root.join("Private").exists());
    assert!(ctx.db.get_by_ref("x1").await.unwrap().is_none());
    assert!(fx.row(kept.id).await.is_some());
    assert_eq!(fx.engine.filters().await.unwrap(), vec!["/ws/Private".to_string()]);

    fx.engine.remove_filter("/ws/Private").await.unwrap();
    assert!(fx.engine.filters().await.unwrap().is_empty());
    assert_eq!(ctx.db.remote_token().await.unwrap(), None);
}

#[tokio::test]
async fn metrics_count_rows_by_state() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    fx.insert(conflicted_file("/a.txt")).await;
    let row = fx
        .insert(NewPair {
            local_path: "/b.txt".into(),
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;
    fx.engine.unsynchronize(row.id).await.unwrap();

    let metrics = fx.engine.metrics().await.unwrap();
    assert_eq!(metrics.conflicted, 1);
    assert_eq!(metrics.unsynchronized, 1);
    assert_eq!(metrics.total, 2);
    assert_eq!(metrics.last_remote_poll, None);
}
