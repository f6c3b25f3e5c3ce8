//! Incremental change detection over input files.
//!
//! Each knowledge base persists a `{absolute path → content hash}` map in
//! `incremental_metadata.json`. Classification compares the stored hash with
//! a freshly computed one, so renames and touch-only modifications do not
//! trigger re-ingestion.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Persisted map file name inside the KB directory.
pub const METADATA_FILE: &str = "incremental_metadata.json";

/// Block size for streaming file hashing.
const HASH_BLOCK_BYTES: usize = 4096;

/// Classification of candidate paths against the persisted map.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub new: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub unchanged: Vec<PathBuf>,
    pub missing: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectorStats {
    pub total_files: usize,
    pub last_update_epoch: Option<i64>,
}

/// Compute the 128-bit content hash of a file: SHA-256 over 4 KiB blocks,
/// truncated to the first 16 bytes and hex-encoded.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_BLOCK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..16]))
}

pub struct ChangeDetector {
    metadata_path: PathBuf,
    records: BTreeMap<String, String>,
}

impl ChangeDetector {
    /// Load the persisted map from the KB directory. A missing or corrupt
    /// metadata file starts the detector empty.
    pub fn load(kb_dir: &Path) -> Self {
        let metadata_path = kb_dir.join(METADATA_FILE);
        let records = std::fs::read_to_string(&metadata_path)
            .ok()
            .and_then(|s| serde_json::from_str::<BTreeMap<String, String>>(&s).ok())
            .unwrap_or_default();
        Self {
            metadata_path,
            records,
        }
    }

    /// Classify candidate paths into NEW / MODIFIED / UNCHANGED, and report
    /// previously known paths that no longer exist as MISSING.
    ///
    /// Unreadable files are returned as `(path, reason)` errors and appear
    /// in no bucket; they never silently match a stored hash.
    pub fn classify(&self, paths: &[PathBuf]) -> (ChangeSet, Vec<(PathBuf, String)>) {
        let mut set = ChangeSet::default();
        let mut errors = Vec::new();

        for path in paths {
            let key = path.to_string_lossy().into_owned();
            if !path.exists() {
                if self.records.contains_key(&key) {
                    set.missing.push(path.clone());
                } else {
                    errors.push((path.clone(), "no such file".to_string()));
                }
                continue;
            }
            let hash = match hash_file(path) {
                Ok(h) => h,
                Err(e) => {
                    errors.push((path.clone(), e.to_string()));
                    continue;
                }
            };
            match self.records.get(&key) {
                None => set.new.push(path.clone()),
                Some(stored) if *stored == hash => set.unchanged.push(path.clone()),
                Some(_) => set.modified.push(path.clone()),
            }
        }

        (set, errors)
    }

    /// Replace the stored hashes for `paths` with freshly computed ones and
    /// persist the map. Unreadable files are skipped and reported.
    pub fn mark_processed(&mut self, paths: &[PathBuf]) -> Result<Vec<(PathBuf, String)>> {
        let mut errors = Vec::new();
        for path in paths {
            match hash_file(path) {
                Ok(hash) => {
                    self.records
                        .insert(path.to_string_lossy().into_owned(), hash);
                }
                Err(e) => errors.push((path.clone(), e.to_string())),
            }
        }
        self.persist()?;
        Ok(errors)
    }

    /// Drop a record and persist.
    pub fn forget(&mut self, path: &Path) -> Result<()> {
        self.records.remove(path.to_string_lossy().as_ref());
        self.persist()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.records.contains_key(path.to_string_lossy().as_ref())
    }

    pub fn stats(&self) -> DetectorStats {
        let last_update_epoch = std::fs::metadata(&self.metadata_path)
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        DetectorStats {
            total_files: self.records.len(),
            last_update_epoch,
        }
    }

    /// Write the map to a temporary sibling, fsync, and rename over the
    /// destination. This is the transactional boundary of an ingest.
    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.metadata_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&self.records)?;
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)
                .with_context(|| format!("Failed to write {}", tmp.display()))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.metadata_path)
            .with_context(|| format!("Failed to replace {}", self.metadata_path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn empty_map_classifies_everything_new() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.pdf", "alpha");
        let b = write_file(tmp.path(), "b.pdf", "beta");

        let detector = ChangeDetector::load(tmp.path());
        let (set, errors) = detector.classify(&[a.clone(), b.clone()]);

        assert!(errors.is_empty());
        assert_eq!(set.new, vec![a, b]);
        assert!(set.modified.is_empty());
        assert!(set.unchanged.is_empty());
        assert!(set.missing.is_empty());
    }

    #[test]
    fn classify_after_mark_processed_is_unchanged() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.pdf", "alpha");
        let b = write_file(tmp.path(), "b.pdf", "beta");
        let paths = vec![a, b];

        let mut detector = ChangeDetector::load(tmp.path());
        detector.mark_processed(&paths).unwrap();
        let (set, _) = detector.classify(&paths);

        assert_eq!(set.unchanged, paths);
        assert!(set.new.is_empty());
        assert!(set.modified.is_empty());
    }

    #[test]
    fn content_change_is_modified_touch_is_not() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.txt", "one");

        let mut detector = ChangeDetector::load(tmp.path());
        detector.mark_processed(std::slice::from_ref(&a)).unwrap();

        // Rewriting identical bytes changes mtime but not the hash.
        std::fs::write(&a, "one").unwrap();
        let (set, _) = detector.classify(std::slice::from_ref(&a));
        assert_eq!(set.unchanged, vec![a.clone()]);

        std::fs::write(&a, "two").unwrap();
        let (set, _) = detector.classify(std::slice::from_ref(&a));
        assert_eq!(set.modified, vec![a]);
    }

    #[test]
    fn known_path_gone_from_disk_is_missing() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.txt", "one");

        let mut detector = ChangeDetector::load(tmp.path());
        detector.mark_processed(std::slice::from_ref(&a)).unwrap();
        std::fs::remove_file(&a).unwrap();

        let (set, errors) = detector.classify(std::slice::from_ref(&a));
        assert_eq!(set.missing, vec![a]);
        assert!(errors.is_empty());
    }

    #[test]
    fn forget_drops_the_record() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.txt", "one");

        let mut detector = ChangeDetector::load(tmp.path());
        detector.mark_processed(std::slice::from_ref(&a)).unwrap();
        detector.forget(&a).unwrap();

        let (set, _) = detector.classify(std::slice::from_ref(&a));
        assert_eq!(set.new, vec![a]);
    }

    #[test]
    fn corrupt_metadata_starts_empty() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join(METADATA_FILE), "{not json").unwrap();

        let detector = ChangeDetector::load(tmp.path());
        assert_eq!(detector.stats().total_files, 0);
    }

    #[test]
    fn map_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.txt", "one");

        let mut detector = ChangeDetector::load(tmp.path());
        detector.mark_processed(std::slice::from_ref(&a)).unwrap();

        let reloaded = ChangeDetector::load(tmp.path());
        let (set, _) = reloaded.classify(std::slice::from_ref(&a));
        assert_eq!(set.unchanged, vec![a]);
        assert_eq!(reloaded.stats().total_files, 1);
    }

    #[test]
    fn hash_is_stable_and_128_bit() {
        let tmp = TempDir::new().unwrap();
        let a = write_file(tmp.path(), "a.bin", "content that spans\nmultiple lines");
        let h1 = hash_file(&a).unwrap();
        let h2 = hash_file(&a).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 32);
    }
}
