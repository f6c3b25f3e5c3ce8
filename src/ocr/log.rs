//! Append-only OCR diagnostics log.
//!
//! One JSON record per completed OCR operation. Logging failures never fail
//! the run; records are best-effort, like stderr progress output.

use std::io::Write;
use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct OcrLogRecord {
    pub timestamp: String,
    pub source: String,
    pub pages: usize,
    pub duration_secs: f64,
    pub pages_per_second: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl OcrLogRecord {
    pub fn new(source: &str, pages: usize, duration_secs: f64) -> Self {
        let pages_per_second = if duration_secs > 0.0 {
            pages as f64 / duration_secs
        } else {
            0.0
        };
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: source.to_string(),
            pages,
            duration_secs,
            pages_per_second,
            success: true,
            reason: None,
        }
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.success = false;
        self.reason = Some(reason.into());
        self
    }
}

pub struct OcrLog {
    path: PathBuf,
}

impl OcrLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn append(&self, record: &OcrLogRecord) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(line) = serde_json::to_string(record) else {
            return;
        };
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            let _ = writeln!(file, "{}", line);
        }
    }
}
