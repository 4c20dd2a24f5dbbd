use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// Errors returned by store persistence helpers.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to encode store file: {0}")]
    Encode(serde_json::Error),
    #[error("failed to decode store file: {0}")]
    Decode(serde_json::Error),
    #[error("failed to read store file: {0}")]
    Read(std::io::Error),
    #[error("failed to write store file: {0}")]
    Write(std::io::Error),
}

/// Writes `value` as pretty JSON via a temp file + rename so a failed write
/// never truncates the previous copy.
pub fn save_json<T: Serialize>(path: impl AsRef<Path>, value: &T) -> Result<(), PersistenceError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(PersistenceError::Write)?;
        }
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(PersistenceError::Encode)?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(PersistenceError::Write)?;
    fs::rename(&tmp, path).map_err(PersistenceError::Write)
}

/// Reads and decodes a JSON file.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, PersistenceError> {
    let bytes = fs::read(path.as_ref()).map_err(PersistenceError::Read)?;
    serde_json::from_slice(&bytes).map_err(PersistenceError::Decode)
}

/// Loads a JSON file, falling back to `T::default()` when the file is missing
/// or malformed. Malformed files are logged, never fatal.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: impl AsRef<Path>) -> T {
    let path = path.as_ref();
    if !path.exists() {
        return T::default();
    }
    match load_json(path) {
        Ok(value) => value,
        Err(err) => {
            warn!("ignoring unreadable store file {}: {err}", path.display());
            T::default()
        }
    }
}
