//! Core data types flowing through the ingestion pipeline.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::ErrorKind;

/// File-type tag derived from the last path segment's extension,
/// case-insensitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileKind {
    Pdf,
    Pptx,
    Ppt,
    Docx,
    Doc,
    Text,
    Markdown,
    Image,
    Other,
}

impl FileKind {
    pub fn from_path(path: &Path) -> FileKind {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "pdf" => FileKind::Pdf,
            "pptx" => FileKind::Pptx,
            "ppt" => FileKind::Ppt,
            "docx" => FileKind::Docx,
            "doc" => FileKind::Doc,
            "txt" | "text" | "log" | "csv" => FileKind::Text,
            "md" | "markdown" => FileKind::Markdown,
            "png" | "jpg" | "jpeg" | "bmp" | "tif" | "tiff" | "webp" => FileKind::Image,
            _ => FileKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Pptx => "pptx",
            FileKind::Ppt => "ppt",
            FileKind::Docx => "docx",
            FileKind::Doc => "doc",
            FileKind::Text => "text",
            FileKind::Markdown => "markdown",
            FileKind::Image => "image",
            FileKind::Other => "other",
        }
    }
}

/// How a document's text was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Origin {
    /// Direct text extraction only.
    Text,
    /// Every retained page came from OCR.
    Ocr,
    /// Some pages direct, some OCR.
    Mixed,
}

/// An ordered page or slide boundary within a document's text.
#[derive(Debug, Clone)]
pub struct PageMarker {
    /// 1-based page or slide number.
    pub number: usize,
    /// Character offset of the marker within the document text.
    pub offset: usize,
}

/// Extracted document, ready for chunking.
#[derive(Debug, Clone)]
pub struct Document {
    pub source: PathBuf,
    pub kind: FileKind,
    pub text: String,
    pub markers: Vec<PageMarker>,
    pub origin: Origin,
    /// Total pages seen during extraction (1 for plain text).
    pub pages: usize,
    /// Pages routed through OCR (counted even when the OCR result was
    /// empty and the page was dropped from the output).
    pub ocr_pages: usize,
}

impl Document {
    pub fn id(&self) -> String {
        self.source.to_string_lossy().into_owned()
    }
}

/// A fixed-window slice of a document's normalized text.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Deterministic id derived from the parent document id and start offset.
    pub id: String,
    pub document_id: String,
    /// Character offset into the normalized document text.
    pub start: usize,
    /// Byte length of the chunk text.
    pub byte_len: usize,
    pub word_count: usize,
    pub text: String,
}

/// Per-file outcome reported in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileStatus {
    Ingested,
    Unchanged,
    Removed,
    Empty,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub path: PathBuf,
    pub status: FileStatus,
    pub chunks: u64,
    pub error: Option<ErrorKind>,
    pub reason: Option<String>,
}

impl FileOutcome {
    pub fn ok(path: PathBuf, status: FileStatus, chunks: u64) -> Self {
        Self {
            path,
            status,
            chunks,
            error: None,
            reason: None,
        }
    }

    pub fn failed(path: PathBuf, kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            path,
            status: FileStatus::Failed,
            chunks: 0,
            error: Some(kind),
            reason: Some(reason.into()),
        }
    }
}
