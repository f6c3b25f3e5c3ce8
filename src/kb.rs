//! Knowledge-base lifecycle, metadata, and locking.
//!
//! Each KB is a directory under the configured base dir holding its
//! incremental hash map, `.kb_info.json` metadata, and the opaque index
//! store files. Metadata writes go through a temporary sibling plus rename,
//! so readers never observe a partial file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

pub const INFO_FILE: &str = ".kb_info.json";
pub const LOCK_FILE: &str = ".kb.lock";

/// Persisted KB identity: which embedder produced the index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbInfo {
    pub embedding_model: String,
    pub embedding_dim: usize,
    /// Unix epoch seconds.
    pub created_at: f64,
}

impl KbInfo {
    pub fn new(embedding_model: &str, embedding_dim: usize) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            embedding_model: embedding_model.to_string(),
            embedding_dim,
            created_at,
        }
    }
}

fn validate_kb_id(kb_id: &str) -> Result<()> {
    if kb_id.is_empty() {
        anyhow::bail!("KB id must not be empty");
    }
    if kb_id.starts_with('.')
        || kb_id
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        anyhow::bail!("Invalid KB id: '{}'", kb_id);
    }
    Ok(())
}

pub fn kb_dir(base_dir: &Path, kb_id: &str) -> Result<PathBuf> {
    validate_kb_id(kb_id)?;
    Ok(base_dir.join(kb_id))
}

pub fn kb_exists(base_dir: &Path, kb_id: &str) -> Result<bool> {
    Ok(kb_dir(base_dir, kb_id)?.is_dir())
}

pub fn create_kb(base_dir: &Path, kb_id: &str) -> Result<PathBuf> {
    let dir = kb_dir(base_dir, kb_id)?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create KB directory {}", dir.display()))?;
    Ok(dir)
}

pub fn delete_kb(base_dir: &Path, kb_id: &str) -> Result<()> {
    let dir = kb_dir(base_dir, kb_id)?;
    if !dir.is_dir() {
        anyhow::bail!("KB '{}' does not exist", kb_id);
    }
    std::fs::remove_dir_all(&dir)
        .with_context(|| format!("Failed to delete KB directory {}", dir.display()))?;
    Ok(())
}

pub fn rename_kb(base_dir: &Path, from: &str, to: &str) -> Result<()> {
    let from_dir = kb_dir(base_dir, from)?;
    let to_dir = kb_dir(base_dir, to)?;
    if !from_dir.is_dir() {
        anyhow::bail!("KB '{}' does not exist", from);
    }
    if to_dir.exists() {
        anyhow::bail!("KB '{}' already exists", to);
    }
    std::fs::rename(&from_dir, &to_dir).with_context(|| {
        format!(
            "Failed to rename KB {} -> {}",
            from_dir.display(),
            to_dir.display()
        )
    })?;
    Ok(())
}

pub fn list_kbs(base_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = match std::fs::read_dir(base_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
    }
    names.sort();
    Ok(names)
}

pub fn read_info(kb_dir: &Path) -> Result<Option<KbInfo>> {
    let path = kb_dir.join(INFO_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let info = serde_json::from_str(&content)
                .with_context(|| format!("Corrupt KB metadata at {}", path.display()))?;
            Ok(Some(info))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write metadata via tmp + fsync + rename.
pub fn write_info(kb_dir: &Path, info: &KbInfo) -> Result<()> {
    std::fs::create_dir_all(kb_dir)?;
    let path = kb_dir.join(INFO_FILE);
    let tmp = kb_dir.join(".kb_info.json.tmp");
    {
        use std::io::Write;
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(serde_json::to_string_pretty(info)?.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, &path)?;
    Ok(())
}

/// Exclusive per-KB lock held for the duration of an ingest run.
///
/// Backed by `O_EXCL` creation of a lock file containing the holder pid;
/// released on drop. Concurrent acquisition fails fast with `KB_BUSY`.
pub struct KbLock {
    path: PathBuf,
}

impl KbLock {
    pub fn acquire(kb_dir: &Path) -> Result<Self, IngestError> {
        std::fs::create_dir_all(kb_dir).map_err(|e| IngestError::Internal(e.to_string()))?;
        let path = kb_dir.join(LOCK_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                use std::io::Write;
                let _ = write!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(IngestError::KbBusy(kb_dir.to_path_buf()))
            }
            Err(e) => Err(IngestError::Internal(e.to_string())),
        }
    }
}

impl Drop for KbLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
