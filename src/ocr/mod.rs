//! Batch OCR: task types, engine capability, shared scheduler.
//!
//! OCR engines are injected capabilities. The scheduler owns one engine
//! handle per worker, initialized lazily on first use and kept alive until
//! worker shutdown; extractors only submit tasks and receive ordered
//! results.

pub mod log;
pub mod resources;
pub mod scheduler;

use std::process::Command;

use anyhow::Result;

/// One page image queued for recognition.
#[derive(Debug)]
pub struct OcrTask {
    /// 1-based page index within the submitting file.
    pub page_index: usize,
    pub image: Vec<u8>,
}

/// A recognized line of text. Confidence and geometry are reported by
/// engines but ignored by the ingestion core.
#[derive(Debug, Clone)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f32,
}

/// Recognition backend held by a single worker.
pub trait OcrEngine: Send {
    fn recognize(&mut self, image: &[u8], languages: &[String]) -> Result<Vec<OcrLine>>;
}

/// Creates one engine per worker. Called at most once per worker thread.
pub trait OcrEngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn OcrEngine>>;
}

/// Join recognized lines with line feeds, trimming each and dropping
/// empty-looking lines (length ≤ 1 after trim).
pub fn assemble_text(lines: &[OcrLine]) -> String {
    lines
        .iter()
        .map(|l| l.text.trim())
        .filter(|t| t.chars().count() > 1)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Engine backed by the `tesseract` command-line tool.
pub struct TesseractEngine;

impl TesseractEngine {
    /// Fails when the tool is not on PATH, so workers surface a clear
    /// initialization error instead of failing per page.
    pub fn detect() -> Result<Self> {
        which::which("tesseract")
            .map_err(|_| anyhow::anyhow!("tesseract not found on PATH"))?;
        Ok(Self)
    }
}

impl OcrEngine for TesseractEngine {
    fn recognize(&mut self, image: &[u8], languages: &[String]) -> Result<Vec<OcrLine>> {
        let dir = tempfile::tempdir()?;
        let img_path = dir.path().join("page.png");
        std::fs::write(&img_path, image)?;

        let lang = if languages.is_empty() {
            "eng".to_string()
        } else {
            languages.join("+")
        };

        let output = Command::new("tesseract")
            .arg(&img_path)
            .arg("stdout")
            .args(["-l", &lang])
            .args(["--oem", "3"])
            .args(["--psm", "1"])
            .output()?;

        // Tesseract writes warnings to stderr while still producing text.
        if !output.status.success() && output.stdout.is_empty() {
            anyhow::bail!(
                "tesseract failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let lines = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(|l| OcrLine {
                text: l.to_string(),
                confidence: 0.0,
            })
            .collect();
        Ok(lines)
    }
}

/// Default factory used by the CLI.
pub struct TesseractFactory;

impl OcrEngineFactory for TesseractFactory {
    fn create(&self) -> Result<Box<dyn OcrEngine>> {
        Ok(Box::new(TesseractEngine::detect()?))
    }
}
