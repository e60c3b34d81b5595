use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"NDRV";
const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = MAGIC.len() + 1 + NONCE_LEN;

#[derive(Debug, Error)]
pub enum SealedFileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to seal secret")]
    Seal,
    #[error("sealed file {0} is damaged or was sealed with another key")]
    Unseal(PathBuf),
}

/// A small secret encrypted at rest with ChaCha20-Poly1305.
///
/// Layout: `NDRV`, format version, 12-byte nonce, ciphertext with tag. The
/// key is the SHA-256 of a per-device secret, so a copied file is useless
/// on another machine.
pub struct SealedFile {
    key: [u8; 32],
    path: PathBuf,
}

impl SealedFile {
    pub fn new(device_secret: &[u8], path: impl Into<PathBuf>) -> Self {
        Self {
            key: Sha256::digest(device_secret).into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn store(&self, secret: &str) -> Result<(), SealedFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), secret.as_bytes())
            .map_err(|_| SealedFileError::Seal)?;

        let mut payload = Vec::with_capacity(HEADER_LEN + sealed.len());
        payload.extend_from_slice(MAGIC);
        payload.push(FORMAT_VERSION);
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        // Written next to the target then renamed, so a crash never leaves half a file.
        let staging = self.path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&staging)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&staging, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    /// Returns `None` when nothing was stored yet.
    pub fn load(&self) -> Result<Option<String>, SealedFileError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let damaged = || SealedFileError::Unseal(self.path.clone());
        if data.len() < HEADER_LEN || &data[..MAGIC.len()] != MAGIC {
            return Err(damaged());
        }
        if data[MAGIC.len()] != FORMAT_VERSION {
            return Err(damaged());
        }
        let nonce = &data[MAGIC.len() + 1..HEADER_LEN];
        let plain = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), &data[HEADER_LEN..])
            .map_err(|_| damaged())?;
        String::from_utf8(plain).map(Some).map_err(|_| damaged())
    }

    pub fn remove(&self) -> Result<(), SealedFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.key))
    }
}
