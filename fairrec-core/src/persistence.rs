//! Atomic persistence helpers for checkpoints and exported artifacts.
//!
//! Every write goes to a `.tmp` sibling first and is renamed over the target,
//! so a reader never observes a half-written checkpoint. Writers are assumed
//! to be single-process; concurrent writers to the same path race on rename.

use crate::error::CoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Atomically write raw bytes, creating parent directories as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Atomically write pretty-printed JSON.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), CoreError> {
    let json = serde_json::to_vec_pretty(data)?;
    atomic_write(path, &json)
}

/// Atomically write compact JSON. Used for tensor-heavy documents.
pub fn atomic_write_json_compact<T: Serialize>(path: &Path, data: &T) -> Result<(), CoreError> {
    let json = serde_json::to_vec(data)?;
    atomic_write(path, &json)
}

/// Load and deserialize JSON. Returns `Ok(None)` when the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&data)?))
}

/// Create `dir` (and parents) if missing.
pub fn ensure_dir(dir: &Path) -> Result<(), CoreError> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}
