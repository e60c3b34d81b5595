use super::*;
use crate::config::Config;
use crate::sync::pair_state::PairState;
use ndrive_core::{Auth, ClientIdentity, ClientOptions, RetryPolicy};
use serde_json::json;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    _dir: TempDir,
    db: StateDb,
    watcher: RemoteWatcher,
}

async fn fixture(server: &MockServer, token: Option<&str>) -> Fixture {
    let dir = tempdir().unwrap();
    let db = StateDb::open(&dir.path().join("engine.db")).await.unwrap();
    let mut txn = db.write().await.unwrap();
    txn.insert(NewPair {
        local_path: "/".into(),
        folderish: true,
        local_state: Some(SideState::Synchronized),
        remote_state: Some(SideState::Synchronized),
        remote_ref: Some("root".into()),
        ..NewPair::default()
    })
    .await
    .unwrap();
    if let Some(token) = token {
        txn.set_remote_token(token).await.unwrap();
    }
    txn.commit().await.unwrap();

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
    let watcher = RemoteWatcher::new(
        "engine-1",
        db.clone(),
        remote,
        "root",
        ConfigHandle::new(Config::with_home(dir.path().join("home"))),
        Arc::new(Notify::new()),
        crate::events::channel(),
        Arc::new(AtomicI64::new(0)),
    );
    Fixture {
        _dir: dir,
        db,
        watcher,
    }
}

fn page(changes: serde_json::Value, token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "changes": changes,
        "new_token": token,
        "has_more": false,
    }))
}

fn created_tree() -> serde_json::Value {
    json!([
        {"ref": "f1", "kind": "created", "parent_ref": "root", "path": "/ws/Docs",
         "name": "Docs", "folderish": true, "timestamp": 1000},
        {"ref": "d1", "kind": "created", "parent_ref": "f1", "path": "/ws/Docs/a.txt",
         "name": "a.txt", "digest": "aaa", "size": 3, "timestamp": 1001},
    ])
}

#[test]
fn filters_match_remote_subtrees() {
    let filters = vec!["/ws/Private".to_string()];
    assert!(is_filtered(Some("/ws/Private"), &filters));
    assert!(is_filtered(Some("/ws/Private/x.txt"), &filters));
    assert!(!is_filtered(Some("/ws/PrivateNotes"), &filters));
    assert!(!is_filtered(None, &filters));
}

#[tokio::test]
async fn audit_changes_create_rows_and_replay_is_idempotent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param("since", "t1"))
        .respond_with(page(created_tree(), "t2"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param("since", "t2"))
        .respond_with(page(created_tree(), "t3"))
        .expect(1)
        .mount(&server)
        .await;
    let mut fx = fixture(&server, Some("t1")).await;

    let outcome = fx.watcher.poll_once().await.unwrap();
    assert_eq!(outcome.changes, 2);
    let folder = fx.db.get_by_ref("f1").await.unwrap().unwrap();
    assert_eq!(folder.local_path, "/Docs");
    assert_eq!(folder.pair_state, PairState::RemotelyCreated);
    let file = fx.db.get_by_ref("d1").await.unwrap().unwrap();
    assert_eq!(file.local_path, "/Docs/a.txt");
    assert_eq!(file.remote_digest.as_deref(), Some("aaa"));
    assert_eq!(fx.db.remote_token().await.unwrap().as_deref(), Some("t2"));

    let replay = fx.watcher.poll_once().await.unwrap();
    assert_eq!(replay.changes, 0);
    assert_eq!(fx.db.get_by_ref("d1").await.unwrap().unwrap().version, file.version);
    assert_eq!(fx.db.remote_token().await.unwrap().as_deref(), Some("t3"));
}

#[tokio::test]
async fn modifications_moves_and_deletions_are_recorded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param("since", "t1"))
        .respond_with(page(created_tree(), "t2"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param("since", "t2"))
        .respond_with(page(
            json!([
                {"ref": "d1", "kind": "modified", "parent_ref": "f1", "name": "a.txt",
                 "digest": "bbb", "timestamp": 2000},
                {"ref": "f1", "kind": "moved", "parent_ref": "root", "name": "Papers",
                 "folderish": true, "timestamp": 2001},
            ]),
            "t3",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param("since", "t3"))
        .respond_with(page(
            json!([{"ref": "f1", "kind": "deleted", "folderish": true, "timestamp": 3000}]),
            "t4",
        ))
        .mount(&server)
        .await;
    let mut fx = fixture(&server, Some("t1")).await;
    fx.watcher.poll_once().await.unwrap();
    for uid in ["f1", "d1"] {
        let row = fx.db.get_by_ref(uid).await.unwrap().unwrap();
        fx.db
            .update_pair(row.id, |pair| pair.set_synchronized())
            .await
            .unwrap();
    }

    fx.watcher.poll_once().await.unwrap();
    let file = fx.db.get_by_ref("d1").await.unwrap().unwrap();
    assert_eq!(file.pair_state, PairState::RemotelyModified);
    assert_eq!(file.remote_digest.as_deref(), Some("bbb"));
    let folder = fx.db.get_by_ref("f1").await.unwrap().unwrap();
    assert_eq!(folder.pair_state, PairState::RemotelyMoved);
    assert_eq!(folder.remote_name.as_deref(), Some("Papers"));
    assert_eq!(folder.local_path, "/Docs", "local path changes when the move is applied");

    fx.watcher.poll_once().await.unwrap();
    let folder = fx.db.get_by_ref("f1").await.unwrap().unwrap();
    assert_eq!(folder.pair_state, PairState::RemotelyDeleted);
    let file = fx.db.get_by_ref("d1").await.unwrap().unwrap();
    assert_eq!(file.remote_state, SideState::Deleted);
}

#[tokio::test]
async fn same_name_on_both_sides_is_paired() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .respond_with(page(
            json!([{"ref": "d9", "kind": "created", "parent_ref": "root",
                    "name": "notes.txt", "digest": "ccc", "timestamp": 10}]),
            "t2",
        ))
        .mount(&server)
        .await;
    let mut fx = fixture(&server, Some("t1")).await;
    let mut txn = fx.db.write().await.unwrap();
    txn.insert(NewPair {
        local_path: "/notes.txt".into(),
        local_state: Some(SideState::Created),
        ..NewPair::default()
    })
    .await
    .unwrap();
    txn.commit().await.unwrap();

    fx.watcher.poll_once().await.unwrap();
    let row = fx.db.get_by_path("/notes.txt").await.unwrap().unwrap();
    assert_eq!(row.remote_ref.as_deref(), Some("d9"));
    assert_eq!(row.pair_state, PairState::Conflicted);
    assert_eq!(fx.db.count().await.unwrap(), 2);
}

#[tokio::test]
async fn invalid_token_triggers_full_scan() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param("since", "stale"))
        .respond_with(ResponseTemplate::new(410))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/drive/changes"))
        .and(query_param_is_missing("since"))
        .respond_with(page(json!([]), "fresh"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                {"ref": "f1", "name": "Docs", "path": "/ws/Docs", "folderish": true},
                {"ref": "p1", "name": "Private", "path": "/ws/Private", "folderish": true},
            ],
            "is_next_page_available": false,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/f1/@children"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [{"ref": "d1", "name": "a.txt", "path": "/ws/Docs/a.txt", "digest": "aaa"}],
            "is_next_page_available": false,
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/p1/@children"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut fx = fixture(&server, Some("stale")).await;
    let mut txn = fx.db.write().await.unwrap();
    txn.add_filter("/ws/Private").await.unwrap();
    txn.insert(NewPair {
        local_path: "/gone.txt".into(),
        local_state: Some(SideState::Synchronized),
        remote_state: Some(SideState::Synchronized),
        remote_ref: Some("x1".into()),
        ..NewPair::default()
    })
    .await
    .unwrap();
    txn.commit().await.unwrap();

    let outcome = fx.watcher.poll_once().await.unwrap();
    assert!(outcome.full_scan);
    assert!(fx.db.get_by_ref("d1").await.unwrap().is_some());
    assert!(fx.db.get_by_ref("p1").await.unwrap().is_none());
    let gone = fx.db.get_by_ref("x1").await.unwrap().unwrap();
    assert_eq!(gone.pair_state, PairState::RemotelyDeleted);
    assert_eq!(fx.db.remote_token().await.unwrap().as_deref(), Some("fresh"));

    // A second rejection inside the minimum interval is postponed.
    let mut txn = fx.db.write().await.unwrap();
    txn.set_remote_token("stale").await.unwrap();
    txn.commit().await.unwrap();
    assert!(matches!(
        fx.watcher.poll_once().await,
        Err(RemoteWatcherError::FullScanTooSoon)
    ));
}
