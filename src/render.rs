//! PDF page rasterization for the OCR path.
//!
//! Pages are rendered to PNG via the `pdftoppm` external tool into a
//! temporary directory and read back in ascending page order.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};

pub fn render_pdf_pages(path: &Path, dpi: u32) -> Result<Vec<Vec<u8>>> {
    which::which("pdftoppm")
        .map_err(|_| anyhow::anyhow!("pdftoppm not found on PATH (install poppler-utils)"))?;

    let dir = tempfile::tempdir().context("Failed to create rasterization directory")?;
    let prefix = dir.path().join("page");

    let output = Command::new("pdftoppm")
        .arg("-png")
        .args(["-r", &dpi.to_string()])
        .arg(path)
        .arg(&prefix)
        .output()
        .context("Failed to run pdftoppm")?;

    if !output.status.success() {
        anyhow::bail!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    // pdftoppm names files page-1.png, page-01.png, ... depending on count;
    // sort numerically on the suffix.
    let mut entries: Vec<(u32, std::path::PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir.path())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(number) = name
            .strip_prefix("page-")
            .and_then(|s| s.strip_suffix(".png"))
            .and_then(|s| s.parse::<u32>().ok())
        {
            entries.push((number, entry.path()));
        }
    }
    entries.sort_by_key(|(number, _)| *number);

    if entries.is_empty() {
        anyhow::bail!("pdftoppm produced no pages");
    }

    let mut images = Vec::with_capacity(entries.len());
    for (_, page_path) in entries {
        images.push(std::fs::read(&page_path)?);
    }
    Ok(images)
}
