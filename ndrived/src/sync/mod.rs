pub mod conflict;
pub mod digest;
pub mod engine;
pub mod errors;
pub mod local_client;
pub mod local_watcher;
pub mod pair_state;
pub mod paths;
pub mod processor;
pub mod queue;
pub mod remote_watcher;
pub mod state_db;
pub mod transfer;
