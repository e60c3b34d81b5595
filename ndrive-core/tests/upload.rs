use ndrive_core::{
    Auth, ChunkUpload, ClientIdentity, CommitOperation, CommitRequest, RemoteClient, RemoteError,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> RemoteClient {
    RemoteClient::new(
        &server.uri(),
        Auth::Token("test-token".into()),
        ClientIdentity::new("device-1"),
    )
    .unwrap()
}

#[tokio::test]
async fn open_batch_returns_chunk_size() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "batch_id": "batch-1",
            "chunk_size": 1048576
        })))
        .mount(&server)
        .await;

    let batch = client(&server).open_batch().await.unwrap();
    assert_eq!(batch.batch_id, "batch-1");
    assert_eq!(batch.chunk_size, 1_048_576);
    assert_eq!(batch.expires_at, None);
}

#[tokio::test]
async fn put_chunk_sends_chunk_headers() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/api/v1/upload/batch-1/0"))
        .and(header("x-upload-type", "chunked"))
        .and(header("x-upload-chunk-index", "2"))
        .and(header("x-upload-chunk-count", "3"))
        .and(header("x-file-name", "notes+v2.txt"))
        .and(header("x-file-size", "10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "received_chunks": [0, 1, 2]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let chunk = ChunkUpload {
        batch_id: "batch-1",
        file_index: 0,
        chunk_index: 2,
        chunk_count: 3,
        file_name: "notes v2.txt",
        file_size: 10,
    };
    let ack = client(&server)
        .put_chunk(&chunk, b"ab".to_vec())
        .await
        .unwrap();
    assert_eq!(ack.received_chunks, vec![0, 1, 2]);
}

#[tokio::test]
async fn batch_status_lists_received_chunks() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/upload/batch-7/0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "received_chunks": [0, 3]
        })))
        .mount(&server)
        .await;

    let ack = client(&server).batch_status("batch-7", 0).await.unwrap();
    assert_eq!(ack.received_chunks, vec![0, 3]);
}

#[tokio::test]
async fn commit_is_never_replayed() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/batch-1/0/execute/create"))
        .and(body_json(json!({"target_parent": "folder-1", "name": "a.txt"})))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let commit = CommitRequest {
        operation: CommitOperation::CreateDocument,
        target_parent: Some("folder-1".into()),
        name: Some("a.txt".into()),
        target_ref: None,
    };
    let err = client(&server)
        .commit_batch("batch-1", 0, &commit)
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::ServerBusy { .. }));
}

#[tokio::test]
async fn commit_update_returns_new_digest() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/upload/batch-2/0/execute/update"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "new_ref": "doc-5",
            "digest": "d41d8cd98f00b204e9800998ecf8427e"
        })))
        .mount(&server)
        .await;

    let commit = CommitRequest {
        operation: CommitOperation::UpdateDocument,
        target_parent: None,
        name: None,
        target_ref: Some("doc-5".into()),
    };
    let result = client(&server)
        .commit_batch("batch-2", 0, &commit)
        .await
        .unwrap();
    assert_eq!(result.new_ref, "doc-5");
    assert_eq!(
        result.digest.as_deref(),
        Some("d41d8cd98f00b204e9800998ecf8427e")
    );
}

#[tokio::test]
async fn dropping_an_unknown_batch_is_ok() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/api/v1/upload/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    client(&server).drop_batch("gone").await.unwrap();
}
