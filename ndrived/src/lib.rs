pub mod autolock;
pub mod commands;
pub mod config;
pub mod deeplink;
pub mod direct_edit;
pub mod events;
pub mod logging;
pub mod manager;
pub mod manager_db;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;
