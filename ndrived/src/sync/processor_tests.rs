use super::*;
use crate::config::{Config, ConfigHandle};
use crate::sync::digest::DigestAlgorithm;
use crate::sync::engine::{EngineKind, ReadOnlyEngine, StandardEngine};
use crate::sync::local_client::{IgnoreRules, LocalClient};
use crate::sync::state_db::{NewPair, StateDb};
use ndrive_core::{Auth, ClientIdentity, ClientOptions, RemoteClient, RetryPolicy};
use serde_json::json;
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};
use tokio::sync::broadcast;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    ctx: Arc<EngineContext>,
    events: broadcast::Receiver<EngineEvent>,
}

impl Fixture {
    async fn insert(&self, new: NewPair) -> DocPair {
        let mut txn = self.ctx.db.write().await.unwrap();
        let pair = txn.insert(new).await.unwrap();
        txn.commit().await.unwrap();
        pair
    }

    async fn row(&self, id: i64) -> Option<DocPair> {
        self.ctx.db.get(id).await.unwrap()
    }

    async fn process(&self, id: i64) {
        let processor = Processor::new(Arc::downgrade(&self.ctx), 7);
        assert!(processor.process_one(id, &CancellationToken::new()).await);
    }

    fn write(&self, name: &str, content: &[u8]) {
        std::fs::write(self.root.join(name), content).unwrap();
    }

    fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.try_recv().ok()
    }
}

async fn fixture(server: &MockServer) -> Fixture {
    fixture_with(server, Arc::new(StandardEngine), |_| {}).await
}

async fn fixture_with(
    server: &MockServer,
    kind: Arc<dyn EngineKind>,
    tune: impl FnOnce(&mut Config),
) -> Fixture {
    let dir = tempdir().unwrap();
    let root = dir.path().join("Drive");
    std::fs::create_dir_all(&root).unwrap();
    let mut config = Config::with_home(dir.path().join("home"));
    tune(&mut config);

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
    let local = LocalClient::new(&root, IgnoreRules::from_config(&config).unwrap()).with_trash(false);
    let events = crate::events::channel();
    let receiver = events.subscribe();
    let ctx = EngineContext::new(
        "engine-1",
        kind,
        db,
        local,
        remote,
        "root",
        ConfigHandle::new(config),
        events,
    );
    Fixture {
        _dir: dir,
        root,
        ctx: Arc::new(ctx),
        events: receiver,
    }
}

fn children(entries: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "entries": entries,
        "is_next_page_available": false,
    }))
}

fn synced_file(local_path: &str, remote_ref: &str, digest: &str) -> NewPair {
    NewPair {
        local_path: local_path.into(),
        local_state: Some(SideState::Synchronized),
        remote_state: Some(SideState::Synchronized),
        remote_ref: Some(remote_ref.into()),
        remote_parent_ref: Some("root".into()),
        remote_name: Some(paths::name(local_path).into()),
        local_digest: Some(digest.into()),
        remote_digest: Some(digest.into()),
        ..NewPair::default()
    }
}

async fn mount_upload(server: &MockServer, batch: &str, new_ref: &str) {
    Mock::given(method("POST"))
        .and(path("/api/v1/upload/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"batch_id": batch, "chunk_size": 1024})),
        )
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("/api/v1/upload/{batch}/0")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"received_chunks": [0]})))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/api/v1/upload/{batch}/0/execute/create")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"new_ref": new_ref})))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_blob(server: &MockServer, uid: &str, body: &[u8], digest: &str, times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/api/v1/id/{uid}/@blob")))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("X-Digest", digest)
                .insert_header("X-Digest-Algorithm", "md5")
                .set_body_bytes(body.to_vec()),
        )
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn local_folder_and_file_are_created_remotely() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(children(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/id/root/@mkdir"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ref": "f1", "name": "Docs", "folderish": true})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/f1/@children"))
        .respond_with(children(json!([])))
        .mount(&server)
        .await;
    mount_upload(&server, "b1", "d1").await;

    let mut fx = fixture(&server).await;
    std::fs::create_dir(fx.root.join("Docs")).unwrap();
    fx.write("Docs/a.txt", b"hello");
    let folder = fx
        .insert(NewPair {
            local_path: "/Docs".into(),
            folderish: true,
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;
    let file = fx
        .insert(NewPair {
            local_path: "/Docs/a.txt".into(),
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;

    fx.process(folder.id).await;
    let folder = fx.row(folder.id).await.unwrap();
    assert_eq!(folder.remote_ref.as_deref(), Some("f1"));
    assert_eq!(folder.pair_state, PairState::Synchronized);
    assert_eq!(folder.processor, 0);

    fx.process(file.id).await;
    let file = fx.row(file.id).await.unwrap();
    assert_eq!(file.remote_ref.as_deref(), Some("d1"));
    assert_eq!(file.remote_parent_ref.as_deref(), Some("f1"));
    assert_eq!(file.remote_digest.as_deref(), Some(HELLO_MD5));
    assert_eq!(file.size, Some(5));
    assert_eq!(file.pair_state, PairState::Synchronized);

    let mut synced = 0;
    while let Some(event) = fx.next_event() {
        if matches!(event, EngineEvent::Synced { .. }) {
            synced += 1;
        }
    }
    assert_eq!(synced, 2);
}

#[tokio::test]
async fn new_local_file_binds_to_identical_remote_one() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(children(json!([
            {"ref": "d5", "name": "a.txt", "digest": HELLO_MD5}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/upload/"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_path: "/a.txt".into(),
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.remote_ref.as_deref(), Some("d5"));
    assert_eq!(row.pair_state, PairState::Synchronized);
}

#[tokio::test]
async fn same_remote_content_skips_download() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 0).await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Modified),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::Synchronized);
    assert_eq!(row.size, Some(5));
}

#[tokio::test]
async fn remote_modification_is_downloaded() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 1).await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"old");
    let mtime = fx.ctx.local.get_info("/a.txt").await.unwrap().unwrap().mtime;
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Modified),
            size: Some(3),
            last_local_updated: Some(mtime),
            local_digest: Some(DigestAlgorithm::Md5.of_bytes(b"old")),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    assert_eq!(std::fs::read(fx.root.join("a.txt")).unwrap(), b"hello");
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::Synchronized);
    assert_eq!(row.local_digest.as_deref(), Some(HELLO_MD5));
    assert_eq!(row.size, Some(5));
}

#[tokio::test]
async fn unrecorded_local_edit_turns_into_checked_conflict() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 0).await;

    let mut fx = fixture(&server).await;
    fx.write("a.txt", b"edited locally");
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Modified),
            size: Some(3),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    let conflicted = fx.row(row.id).await.unwrap();
    assert_eq!(conflicted.pair_state, PairState::Conflicted);
    assert_eq!(std::fs::read(fx.root.join("a.txt")).unwrap(), b"edited locally");

    fx.process(row.id).await;
    let checked = fx.row(row.id).await.unwrap();
    assert_eq!(checked.pair_state, PairState::Conflicted);
    assert_eq!(checked.checked_version, Some(checked.version));
    assert_eq!(checked.processor, 0);
    let mut conflict_events = 0;
    while let Some(event) = fx.next_event() {
        if matches!(event, EngineEvent::Conflict { .. }) {
            conflict_events += 1;
        }
    }
    assert_eq!(conflict_events, 1);
}

#[tokio::test]
async fn unchanged_file_is_hashed_once_across_passes() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 0).await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"edited locally");
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Modified),
            size: Some(3),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    assert_eq!(fx.ctx.local.digests_computed(), 1);
    let conflicted = fx.row(row.id).await.unwrap();
    assert_eq!(
        conflicted.local_digest,
        Some(DigestAlgorithm::Md5.of_bytes(b"edited locally"))
    );

    fx.process(row.id).await;
    fx.process(row.id).await;
    assert_eq!(fx.ctx.local.digests_computed(), 1);

    // A different mtime on record means the cached digest is stale.
    fx.ctx
        .db
        .update_pair(row.id, |pair| {
            pair.last_local_updated = pair.last_local_updated.map(|mtime| mtime - 1000)
        })
        .await
        .unwrap();
    fx.process(row.id).await;
    assert_eq!(fx.ctx.local.digests_computed(), 2);
}

/// Polls the read-only bit of `path` until `busy` completes and reports
/// whether it was ever seen set.
async fn read_only_while(
    path: &std::path::Path,
    busy: impl std::future::Future<Output = ()>,
) -> bool {
    let watch = async {
        let mut seen = false;
        for _ in 0..40 {
            if std::fs::metadata(path).is_ok_and(|m| m.permissions().readonly()) {
                seen = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        seen
    };
    let ((), seen) = tokio::join!(busy, watch);
    seen
}

#[tokio::test]
async fn uploaded_file_is_read_only_during_the_transfer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(children(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/upload/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"batch_id": "b9", "chunk_size": 1024})),
        )
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/v1/upload/b9/0"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"received_chunks": [0]}))
                .set_delay(std::time::Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/upload/b9/0/execute/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"new_ref": "d9"})))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_path: "/a.txt".into(),
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;

    let file = fx.root.join("a.txt");
    assert!(read_only_while(&file, fx.process(row.id)).await);
    assert!(!std::fs::metadata(&file).unwrap().permissions().readonly());
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.remote_ref.as_deref(), Some("d9"));
    assert_eq!(row.pair_state, PairState::Synchronized);
}

#[tokio::test]
async fn failed_download_releases_the_read_only_lock() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/d1/@blob"))
        .respond_with(
            ResponseTemplate::new(500).set_delay(std::time::Duration::from_millis(300)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"old");
    let mtime = fx.ctx.local.get_info("/a.txt").await.unwrap().unwrap().mtime;
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Modified),
            size: Some(3),
            last_local_updated: Some(mtime),
            local_digest: Some(DigestAlgorithm::Md5.of_bytes(b"old")),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    let file = fx.root.join("a.txt");
    assert!(read_only_while(&file, fx.process(row.id)).await);
    assert!(!std::fs::metadata(&file).unwrap().permissions().readonly());
    assert_eq!(std::fs::read(&file).unwrap(), b"old");
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.error_count, 1);
}

#[tokio::test]
async fn deleted_folder_is_removed_remotely_once() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/id/f1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/id/d1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let fx = fixture(&server).await;
    let folder = fx
        .insert(NewPair {
            local_path: "/Docs".into(),
            folderish: true,
            local_state: Some(SideState::Deleted),
            remote_state: Some(SideState::Synchronized),
            remote_ref: Some("f1".into()),
            ..NewPair::default()
        })
        .await;
    let child = fx
        .insert(NewPair {
            local_state: Some(SideState::Deleted),
            remote_parent_ref: Some("f1".into()),
            ..synced_file("/Docs/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(child.id).await;
    assert!(fx.row(child.id).await.is_none());
    fx.process(folder.id).await;
    assert!(fx.row(folder.id).await.is_none());
    assert_eq!(fx.ctx.db.count().await.unwrap(), 1);
}

#[tokio::test]
async fn unsync_policy_keeps_the_server_copy() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let fx = fixture_with(&server, Arc::new(StandardEngine), |config| {
        config.delete_policy = DeletePolicy::Unsync;
    })
    .await;
    let row = fx
        .insert(NewPair {
            local_state: Some(SideState::Deleted),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::Unsynchronized);
    assert_eq!(row.suspended_local_state, Some(SideState::Deleted));
}

#[tokio::test]
async fn remote_file_is_downloaded_under_its_parent() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 1).await;

    let fx = fixture(&server).await;
    let row = fx
        .insert(NewPair {
            local_path: "/a.txt".into(),
            remote_state: Some(SideState::Created),
            remote_ref: Some("d1".into()),
            remote_parent_ref: Some("root".into()),
            remote_name: Some("a.txt".into()),
            remote_digest: Some(HELLO_MD5.into()),
            ..NewPair::default()
        })
        .await;

    fx.process(row.id).await;
    assert_eq!(std::fs::read(fx.root.join("a.txt")).unwrap(), b"hello");
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::Synchronized);
    assert_eq!(row.local_digest.as_deref(), Some(HELLO_MD5));
}

#[tokio::test]
async fn remote_child_waits_for_its_parent() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 0).await;

    let fx = fixture(&server).await;
    let row = fx
        .insert(NewPair {
            local_path: "/Docs/a.txt".into(),
            remote_state: Some(SideState::Created),
            remote_ref: Some("d1".into()),
            remote_parent_ref: Some("f1".into()),
            remote_name: Some("a.txt".into()),
            ..NewPair::default()
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::RemotelyCreated);
    assert_eq!(row.error_count, 0);
    assert_eq!(row.processor, 0);
    assert!(row.retry_after.is_some_and(|at| at > now_ms()));
}

#[tokio::test]
async fn orphan_row_is_backed_off_then_detached() {
    let server = MockServer::start().await;
    mount_blob(&server, "d1", b"hello", HELLO_MD5, 0).await;

    let fx = fixture_with(&server, Arc::new(StandardEngine), |config| config.max_errors = 1).await;
    // Moved remotely into a folder this engine never tracked.
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Moved),
            remote_parent_ref: Some("filtered-folder".into()),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;
    fx.write("a.txt", b"hello");

    for _ in 0..PARENT_WAITS {
        fx.process(row.id).await;
    }
    let waiting = fx.row(row.id).await.unwrap();
    assert_eq!(waiting.error_count, 0);
    assert_eq!(waiting.pair_state, PairState::RemotelyMoved);

    fx.process(row.id).await;
    let counted = fx.row(row.id).await.unwrap();
    assert_eq!(counted.error_count, 1);
    assert_eq!(counted.last_error.as_deref(), Some("TRANSIENT"));
    assert!(counted.retry_after.is_some_and(|at| at > now_ms()));

    let mut passes = 0;
    loop {
        fx.process(row.id).await;
        passes += 1;
        let current = fx.row(row.id).await.unwrap();
        if current.pair_state == PairState::Unsynchronized {
            assert_eq!(current.suspended_local_state, Some(SideState::Synchronized));
            break;
        }
        assert!(passes < 10, "orphan row was never detached");
    }
    assert_eq!(passes, 4);
}

#[tokio::test]
async fn local_rename_is_numbered_when_the_name_is_taken() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/root/@children"))
        .respond_with(children(json!([
            {"ref": "d1", "name": "a.txt", "digest": HELLO_MD5},
            {"ref": "d2", "name": "c.txt"},
        ])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/id/d1/@move"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ref": "d1", "name": "c (1).txt", "parent_ref": "root", "digest": HELLO_MD5
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fx = fixture(&server).await;
    fx.write("c.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_path: "/c.txt".into(),
            local_state: Some(SideState::Moved),
            remote_name: Some("a.txt".into()),
            ..synced_file("/c.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    assert!(fx.root.join("c (1).txt").exists());
    assert!(!fx.root.join("c.txt").exists());
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.local_path, "/c (1).txt");
    assert_eq!(row.remote_name.as_deref(), Some("c (1).txt"));
    assert_eq!(row.pair_state, PairState::Synchronized);
}

#[tokio::test]
async fn server_errors_are_counted_for_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/d1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_state: Some(SideState::Modified),
            remote_digest: Some("0ld".into()),
            ..synced_file("/a.txt", "d1", "0ld")
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::LocallyModified);
    assert_eq!(row.error_count, 1);
    assert_eq!(row.last_error.as_deref(), Some("TRANSIENT"));
    assert_eq!(row.processor, 0);
    assert!(matches!(
        fx.next_event(),
        Some(EngineEvent::RowError { kind, .. }) if kind == "TRANSIENT"
    ));
}

#[tokio::test]
async fn forbidden_rows_are_detached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/id/d1"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_state: Some(SideState::Modified),
            ..synced_file("/a.txt", "d1", "0ld")
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::Unsynchronized);
    assert_eq!(row.suspended_local_state, Some(SideState::Modified));
    assert_eq!(row.last_error.as_deref(), Some("FORBIDDEN"));
}

#[tokio::test]
async fn remote_deletion_removes_the_local_file() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            remote_state: Some(SideState::Deleted),
            ..synced_file("/a.txt", "d1", HELLO_MD5)
        })
        .await;

    fx.process(row.id).await;
    assert!(!fx.root.join("a.txt").exists());
    assert!(fx.row(row.id).await.is_none());
}

#[tokio::test]
async fn read_only_engine_detaches_local_changes() {
    let server = MockServer::start().await;
    let fx = fixture_with(&server, Arc::new(ReadOnlyEngine), |_| {}).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_path: "/a.txt".into(),
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;

    fx.process(row.id).await;
    let row = fx.row(row.id).await.unwrap();
    assert_eq!(row.pair_state, PairState::Unsynchronized);
    assert_eq!(row.suspended_local_state, Some(SideState::Created));
    assert_eq!(server.received_requests().await.unwrap().len(), 0);
}

#[tokio::test]
async fn rows_claimed_elsewhere_are_left_alone() {
    let server = MockServer::start().await;
    let fx = fixture(&server).await;
    fx.write("a.txt", b"hello");
    let row = fx
        .insert(NewPair {
            local_path: "/a.txt".into(),
            local_state: Some(SideState::Created),
            ..NewPair::default()
        })
        .await;
    assert!(fx.ctx.db.claim(row.id, 99).await.unwrap());

    fx.process(row.id).await;
    let after = fx.row(row.id).await.unwrap();
    assert_eq!(after.processor, 99);
    assert_eq!(after.version, row.version);
}
