use std::path::Path;
use std::sync::Arc;

use ndrive_core::{Auth, ClientIdentity, ClientOptions, RemoteClient, RetryPolicy};
use wiremock::MockServer;

use crate::config::{Config, ConfigHandle};
use crate::events::EventSender;
use crate::sync::engine::{DEFAULT_ENGINE_KIND, Engine, EngineBinding, EngineContext, StandardEngine};
use crate::sync::local_client::{IgnoreRules, LocalClient};
use crate::sync::pair_state::SideState;
use crate::sync::state_db::{DocPair, NewPair, StateDb};

pub fn remote(server: &MockServer) -> RemoteClient {
    let options = ClientOptions {
        retry: RetryPolicy::none(),
        ..ClientOptions::default()
    };
    RemoteClient::with_options(
        &server.uri(),
        Auth::Token("secret".into()),
        ClientIdentity::new("device-1"),
        options,
    )
    .unwrap()
}

pub fn binding(uid: &str, folder: &Path, server_url: &str) -> EngineBinding {
    EngineBinding {
        uid: uid.into(),
        kind: DEFAULT_ENGINE_KIND.into(),
        name: uid.into(),
        local_folder: folder.to_path_buf(),
        server_url: server_url.into(),
        remote_user: "alice".into(),
        remote_root: "root".into(),
    }
}

/// An engine over `folder` that is never started.
pub async fn engine(
    config: &Config,
    server: &MockServer,
    uid: &str,
    folder: &Path,
    events: EventSender,
) -> Arc<Engine> {
    std::fs::create_dir_all(folder).unwrap();
    let db = StateDb::open(&config.engine_db_path(uid)).await.unwrap();
    let local = LocalClient::new(folder, IgnoreRules::from_config(config).unwrap()).with_trash(false);
    let ctx = EngineContext::new(
        uid,
        Arc::new(StandardEngine),
        db,
        local,
        remote(server),
        "root",
        ConfigHandle::new(config.clone()),
        events,
    );
    Arc::new(Engine::with_context(
        binding(uid, folder, &server.uri()),
        ctx,
    ))
}

pub async fn insert(engine: &Engine, new: NewPair) -> DocPair {
    let mut txn = engine.context().db.write().await.unwrap();
    let pair = txn.insert(new).await.unwrap();
    txn.commit().await.unwrap();
    pair
}

pub fn synced_file(local_path: &str, remote_ref: &str) -> NewPair {
    NewPair {
        local_path: local_path.into(),
        remote_ref: Some(remote_ref.into()),
        remote_parent_ref: Some("root".into()),
        local_state: Some(SideState::Synchronized),
        remote_state: Some(SideState::Synchronized),
        ..NewPair::default()
    }
}
