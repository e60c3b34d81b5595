use super::*;

async fn make_db() -> (tempfile::TempDir, StateDb) {
    let dir = tempfile::tempdir().unwrap();
    let db = StateDb::open(&dir.path().join("ndrive_test.db")).await.unwrap();
    (dir, db)
}

fn local_file(path: &str) -> NewPair {
    NewPair {
        local_path: path.into(),
        local_state: Some(SideState::Created),
        size: Some(5),
        ..NewPair::default()
    }
}

fn local_folder(path: &str) -> NewPair {
    NewPair {
        local_path: path.into(),
        folderish: true,
        local_state: Some(SideState::Created),
        ..NewPair::default()
    }
}

#[tokio::test]
async fn insert_derives_pair_state_and_location() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let pair = txn.insert(local_file("/a/b/c.txt")).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(pair.pair_state, PairState::LocallyCreated);
    assert_eq!(pair.local_parent_path.as_deref(), Some("/a/b"));
    assert_eq!(pair.local_name, "c.txt");
    assert_eq!(pair.depth(), 3);
    assert_eq!(pair.version, 1);
    assert_eq!(db.get_by_path("/a/b/c.txt").await.unwrap(), Some(pair));
}

#[tokio::test]
async fn save_bumps_version_and_keeps_state_derived() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let mut pair = txn.insert(local_file("/c.txt")).await.unwrap();
    pair.remote_state = SideState::Modified;
    txn.save(&mut pair).await.unwrap();
    txn.commit().await.unwrap();

    let stored = db.get(pair.id).await.unwrap().unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(stored.pair_state, PairState::Conflicted);
    assert_eq!(stored.pair_state, stored.derived_state());
}

#[tokio::test]
async fn folder_rows_never_keep_digests() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let mut folder = txn.insert(local_folder("/docs")).await.unwrap();
    folder.local_digest = Some("abc".into());
    txn.save(&mut folder).await.unwrap();
    txn.commit().await.unwrap();

    let stored = db.get(folder.id).await.unwrap().unwrap();
    assert!(stored.local_digest.is_none());
}

#[tokio::test]
async fn rows_deleted_on_both_sides_are_purged() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let mut pair = txn.insert(local_file("/gone.txt")).await.unwrap();
    pair.local_state = SideState::Deleted;
    pair.remote_state = SideState::Deleted;
    let outcome = txn.save(&mut pair).await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(outcome, SaveOutcome::Purged);
    assert!(db.get(pair.id).await.unwrap().is_none());
}

#[tokio::test]
async fn dropped_transaction_rolls_back() {
    let (_dir, db) = make_db().await;
    {
        let mut txn = db.write().await.unwrap();
        txn.insert(local_file("/tmp.txt")).await.unwrap();
    }
    assert_eq!(db.count().await.unwrap(), 0);
}

#[tokio::test]
async fn claim_is_exclusive() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let pair = txn.insert(local_file("/c.txt")).await.unwrap();
    txn.commit().await.unwrap();

    assert!(db.claim(pair.id, 7).await.unwrap());
    assert!(!db.claim(pair.id, 8).await.unwrap());
    db.release(pair.id, 8).await.unwrap();
    assert_eq!(db.get(pair.id).await.unwrap().unwrap().processor, 7);
    db.release(pair.id, 7).await.unwrap();
    assert!(db.claim(pair.id, 8).await.unwrap());
}

#[tokio::test]
async fn dirty_rows_put_parents_first_for_creates_and_children_first_for_deletes() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let file = txn.insert(local_file("/a/b/c.txt")).await.unwrap();
    let inner = txn.insert(local_folder("/a/b")).await.unwrap();
    let outer = txn.insert(local_folder("/a")).await.unwrap();
    let mut old_parent = txn
        .insert(NewPair {
            local_path: "/old".into(),
            folderish: true,
            local_state: Some(SideState::Synchronized),
            remote_state: Some(SideState::Synchronized),
            remote_ref: Some("r-old".into()),
            ..NewPair::default()
        })
        .await
        .unwrap();
    let mut old_child = txn
        .insert(NewPair {
            local_path: "/old/x.txt".into(),
            local_state: Some(SideState::Synchronized),
            remote_state: Some(SideState::Synchronized),
            remote_ref: Some("r-x".into()),
            ..NewPair::default()
        })
        .await
        .unwrap();
    old_parent.local_state = SideState::Deleted;
    old_child.local_state = SideState::Deleted;
    txn.save(&mut old_parent).await.unwrap();
    txn.save(&mut old_child).await.unwrap();
    txn.commit().await.unwrap();

    let order: Vec<i64> = db
        .dirty_rows(3, now_ms(), 100)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.id)
        .collect();
    assert_eq!(
        order,
        vec![outer.id, inner.id, file.id, old_child.id, old_parent.id]
    );
}

#[tokio::test]
async fn dirty_rows_skip_claimed_errored_and_checked_conflicts() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let claimed = txn.insert(local_file("/claimed.txt")).await.unwrap();
    let mut errored = txn.insert(local_file("/errored.txt")).await.unwrap();
    errored.error_count = 3;
    txn.save(&mut errored).await.unwrap();
    let mut later = txn.insert(local_file("/later.txt")).await.unwrap();
    later.retry_after = Some(now_ms() + 60_000);
    txn.save(&mut later).await.unwrap();
    let mut conflict = txn.insert(local_file("/conflict.txt")).await.unwrap();
    conflict.remote_state = SideState::Modified;
    txn.save(&mut conflict).await.unwrap();
    txn.mark_checked(conflict.id).await.unwrap();
    let ready = txn.insert(local_file("/ready.txt")).await.unwrap();
    txn.commit().await.unwrap();
    assert!(db.claim(claimed.id, 1).await.unwrap());

    let rows = db.dirty_rows(3, now_ms(), 100).await.unwrap();
    let ids: Vec<i64> = rows.iter().map(|p| p.id).collect();
    assert_eq!(ids, vec![ready.id]);

    let waiting = db.errored_rows(3).await.unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].id, errored.id);
}

#[tokio::test]
async fn changed_conflict_is_requeued() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let mut conflict = txn.insert(local_file("/conflict.txt")).await.unwrap();
    conflict.remote_state = SideState::Modified;
    txn.save(&mut conflict).await.unwrap();
    txn.mark_checked(conflict.id).await.unwrap();
    let mut again = txn.get(conflict.id).await.unwrap().unwrap();
    again.size = Some(99);
    txn.save(&mut again).await.unwrap();
    txn.commit().await.unwrap();

    let rows = db.dirty_rows(3, now_ms(), 100).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn rebase_and_purge_tree_cover_all_descendants() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    txn.insert(local_folder("/a")).await.unwrap();
    txn.insert(local_folder("/a/b")).await.unwrap();
    txn.insert(local_file("/a/b/c.txt")).await.unwrap();
    txn.insert(local_file("/ab.txt")).await.unwrap();
    let moved = txn.rebase_tree("/a", "/z").await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(moved, 2);
    assert!(db.get_by_path("/z/b/c.txt").await.unwrap().is_some());
    assert_eq!(
        db.get_by_path("/z/b").await.unwrap().unwrap().local_parent_path.as_deref(),
        Some("/z")
    );

    let mut txn = db.write().await.unwrap();
    let removed = txn.purge_tree("/a").await.unwrap();
    txn.commit().await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(db.count().await.unwrap(), 3);
    assert!(db.get_by_path("/ab.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn filters_and_config_are_persisted() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    txn.add_filter("/ws/private").await.unwrap();
    txn.add_filter("/ws/private").await.unwrap();
    txn.set_remote_token("tok-1").await.unwrap();
    txn.commit().await.unwrap();

    assert_eq!(db.filters().await.unwrap(), vec!["/ws/private".to_string()]);
    assert_eq!(db.remote_token().await.unwrap().as_deref(), Some("tok-1"));

    db.set_config("remote_last_token", Some("tok-2")).await.unwrap();
    assert_eq!(db.remote_token().await.unwrap().as_deref(), Some("tok-2"));
}

#[tokio::test]
async fn transfer_rows_keep_their_bitmap() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    let pair = txn.insert(local_file("/big.bin")).await.unwrap();
    let mut uploaded = ChunkBitmap::new(10);
    uploaded.set(0);
    uploaded.set(1);
    uploaded.set(9);
    let record = TransferRecord {
        id: 0,
        doc_pair_id: pair.id,
        direction: TransferDirection::Up,
        batch_id: Some("b-1".into()),
        file_index: 0,
        chunk_size: 1024,
        chunk_count: 10,
        uploaded,
        status: TransferStatus::Ongoing,
        engine_id: "e1".into(),
        tmp_path: None,
        digest: Some("abc".into()),
        expires_at: None,
    };
    let id = txn.upsert_transfer(&record).await.unwrap();
    txn.commit().await.unwrap();

    let stored = db.transfer(pair.id, TransferDirection::Up).await.unwrap().unwrap();
    assert_eq!(stored.id, id);
    assert_eq!(stored.uploaded.count(), 3);
    assert_eq!(stored.uploaded.contiguous_prefix(), 2);
    assert_eq!(stored.status, TransferStatus::Ongoing);

    let mut txn = db.write().await.unwrap();
    txn.purge(pair.id).await.unwrap();
    txn.commit().await.unwrap();
    assert!(db.transfers().await.unwrap().is_empty());
}

#[tokio::test]
async fn counts_group_by_pair_state() {
    let (_dir, db) = make_db().await;
    let mut txn = db.write().await.unwrap();
    txn.insert(local_file("/one.txt")).await.unwrap();
    let mut two = txn.insert(local_file("/two.txt")).await.unwrap();
    two.error_count = 1;
    txn.save(&mut two).await.unwrap();
    let mut three = txn.insert(local_file("/three.txt")).await.unwrap();
    three.local_state = SideState::Unsynchronized;
    txn.save(&mut three).await.unwrap();
    txn.commit().await.unwrap();

    let counts = db.counts().await.unwrap();
    assert_eq!(counts.total, 3);
    assert_eq!(counts.get(PairState::LocallyCreated), 2);
    assert_eq!(counts.get(PairState::Unsynchronized), 1);
    assert_eq!(counts.errored, 1);
}

#[tokio::test]
async fn corrupted_file_is_restored_from_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ndrive_e.db");
    let db = StateDb::open(&path).await.unwrap();
    let mut txn = db.write().await.unwrap();
    txn.insert(local_file("/kept.txt")).await.unwrap();
    txn.commit().await.unwrap();
    let backup = db.backup().await.unwrap().unwrap();
    assert!(backup.exists());
    db.close().await;

    std::fs::write(&path, b"definitely not a sqlite database file, just garbage bytes").unwrap();
    let _ = std::fs::remove_file(dir.path().join("ndrive_e.db-wal"));
    let _ = std::fs::remove_file(dir.path().join("ndrive_e.db-shm"));

    let restored = StateDb::open(&path).await.unwrap();
    assert!(restored.get_by_path("/kept.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn corrupted_file_without_backup_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ndrive_e.db");
    std::fs::write(&path, b"definitely not a sqlite database file, just garbage bytes").unwrap();

    let err = StateDb::open(&path).await.err().unwrap();
    assert!(matches!(err, StateDbError::Corrupt(_)));
}
