//! Write-tmp-then-rename JSON persistence, shared by the ACL, schema,
//! snapshot, and group-commit stores.
//!
//! Grounded on `rust-core/src/storage/manifest.rs`'s `Manifest::save`,
//! upgraded from a plain truncate-write to a temp-then-rename sequence
//! for crash-atomicity.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

/// Atomically (over)writes `path` with the JSON encoding of `value`.
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Reads and decodes `path`, returning `default` if it doesn't exist.
pub fn read_or_default<T: DeserializeOwned>(path: &Path, default: T) -> Result<T> {
    if !path.exists() {
        return Ok(default);
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(default);
    }
    Ok(serde_json::from_str(&content)?)
}
