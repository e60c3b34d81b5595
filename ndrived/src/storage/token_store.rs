use std::path::{Path, PathBuf};

use keyring::Entry;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::sealed_file::{SealedFile, SealedFileError};

const SERVICE_NAME: &str = "ndrive";
const TOKENS_DIR: &str = "tokens";

#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error(transparent)]
    Sealed(#[from] SealedFileError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenBackend {
    Keyring,
    SealedFile,
}

/// Server tokens, one per (server url, user) account.
///
/// The OS keyring is used when it answers; otherwise tokens go to sealed
/// files under `<home>/tokens`. Reads check both so a token saved while the
/// keyring was down is still found once it comes back.
pub struct TokenStore {
    dir: PathBuf,
    device_secret: Vec<u8>,
    backend: TokenBackend,
}

impl TokenStore {
    /// Checks the keyring once and picks the backend.
    pub fn new(home: &Path, device_secret: &[u8]) -> Self {
        let backend = match Entry::new(SERVICE_NAME, "availability-check").and_then(|entry| {
            match entry.get_password() {
                Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(err),
            }
        }) {
            Ok(()) => TokenBackend::Keyring,
            Err(err) => {
                warn!(error = %err, "keyring unavailable, tokens are kept in sealed files");
                TokenBackend::SealedFile
            }
        };
        Self::with_backend(home, device_secret, backend)
    }

    pub fn with_backend(home: &Path, device_secret: &[u8], backend: TokenBackend) -> Self {
        Self {
            dir: home.join(TOKENS_DIR),
            device_secret: device_secret.to_vec(),
            backend,
        }
    }

    pub fn backend(&self) -> TokenBackend {
        self.backend
    }

    pub fn save(&self, server_url: &str, user: &str, token: &str) -> Result<(), TokenStoreError> {
        if self.backend == TokenBackend::Keyring {
            match self.entry(server_url, user).and_then(|e| e.set_password(token)) {
                Ok(()) => {
                    self.sealed(server_url, user).remove()?;
                    return Ok(());
                }
                Err(err) => warn!(error = %err, "keyring write failed, sealing token to disk"),
            }
        }
        self.sealed(server_url, user).store(token)?;
        debug!(server = %server_url, user, "token sealed");
        Ok(())
    }

    pub fn get(&self, server_url: &str, user: &str) -> Result<Option<String>, TokenStoreError> {
        if self.backend == TokenBackend::Keyring {
            match self.entry(server_url, user).and_then(|e| e.get_password()) {
                Ok(token) => return Ok(Some(token)),
                Err(keyring::Error::NoEntry) => {}
                Err(err) => debug!(error = %err, "keyring read failed"),
            }
        }
        Ok(self.sealed(server_url, user).load()?)
    }

    pub fn delete(&self, server_url: &str, user: &str) -> Result<(), TokenStoreError> {
        if self.backend == TokenBackend::Keyring {
            match self
                .entry(server_url, user)
                .and_then(|e| e.delete_credential())
            {
                Ok(()) | Err(keyring::Error::NoEntry) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.sealed(server_url, user).remove()?;
        Ok(())
    }

    fn entry(&self, server_url: &str, user: &str) -> keyring::Result<Entry> {
        Entry::new(SERVICE_NAME, &account(server_url, user))
    }

    fn sealed(&self, server_url: &str, user: &str) -> SealedFile {
        let name = hex(&Sha256::digest(account(server_url, user).as_bytes()));
        SealedFile::new(&self.device_secret, self.dir.join(format!("{name}.sealed")))
    }
}

fn account(server_url: &str, user: &str) -> String {
    format!("{user}@{}", server_url.trim_end_matches('/'))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
