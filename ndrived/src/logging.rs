use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE_NAME: &str = "ndrive.log";

/// Installs the global subscriber: stderr always, plus `<logs_dir>/ndrive.log`
/// when the directory is usable. `NDRIVE_LOG` wins over `RUST_LOG`, which wins
/// over `default_level`.
pub fn init(logs_dir: Option<&Path>, default_level: &str, keep: usize) -> Option<PathBuf> {
    let filter = std::env::var("NDRIVE_LOG")
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_level));

    let log_file = logs_dir.and_then(|dir| match open_rotated(dir, keep) {
        Ok(file) => Some((dir.join(LOG_FILE_NAME), file)),
        Err(err) => {
            eprintln!("ndrived: file logging disabled: {err}");
            None
        }
    });

    let (path, file_layer) = match log_file {
        Some((path, file)) => (
            Some(path),
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(Mutex::new(file)),
            ),
        ),
        None => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init();
    path
}

fn open_rotated(dir: &Path, keep: usize) -> io::Result<File> {
    fs::create_dir_all(dir)?;
    rotate(dir, keep)?;
    File::create(dir.join(LOG_FILE_NAME))
}

/// Shifts `ndrive.log.N` to `.N+1`, dropping anything beyond `keep`.
pub(crate) fn rotate(dir: &Path, keep: usize) -> io::Result<()> {
    let current = dir.join(LOG_FILE_NAME);
    if keep == 0 {
        if current.exists() {
            fs::remove_file(&current)?;
        }
        return Ok(());
    }
    let numbered = |n: usize| dir.join(format!("{LOG_FILE_NAME}.{n}"));
    let oldest = numbered(keep);
    if oldest.exists() {
        fs::remove_file(&oldest)?;
    }
    for n in (1..keep).rev() {
        let from = numbered(n);
        if from.exists() {
            fs::rename(&from, numbered(n + 1))?;
        }
    }
    if current.exists() {
        fs::rename(&current, numbered(1))?;
    }
    Ok(())
}
