//! Error types for the ingestion core.
//!
//! Per-file errors are recorded in the run summary and the ingest continues;
//! configuration and infrastructure errors abort the run before any metadata
//! is committed.

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the ingestion pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("file unreadable: {path}: {reason}")]
    FileUnreadable { path: PathBuf, reason: String },

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("extraction produced no text: {0}")]
    ExtractionEmpty(PathBuf),

    #[error("OCR timed out after {0}s")]
    OcrTimeout(u64),

    #[error("OCR engine initialization failed: {0}")]
    OcrEngineInit(String),

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    EmbeddingDimMismatch { expected: usize, actual: usize },

    #[error("index store write failed: {0}")]
    StoreWrite(String),

    #[error("knowledge base is busy: {0}")]
    KbBusy(PathBuf),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Stable error-kind codes carried in run summaries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    FileUnreadable,
    UnsupportedType,
    ExtractionEmpty,
    OcrTimeout,
    OcrEngineInitFailed,
    EmbeddingDimMismatch,
    StoreWriteFailed,
    KbBusy,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FileUnreadable => "FILE_UNREADABLE",
            ErrorKind::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorKind::ExtractionEmpty => "EXTRACTION_EMPTY",
            ErrorKind::OcrTimeout => "OCR_TIMEOUT",
            ErrorKind::OcrEngineInitFailed => "OCR_ENGINE_INIT_FAILED",
            ErrorKind::EmbeddingDimMismatch => "EMBEDDING_DIM_MISMATCH",
            ErrorKind::StoreWriteFailed => "STORE_WRITE_FAILED",
            ErrorKind::KbBusy => "KB_BUSY",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::FileUnreadable { .. } => ErrorKind::FileUnreadable,
            IngestError::UnsupportedType(_) => ErrorKind::UnsupportedType,
            IngestError::ExtractionEmpty(_) => ErrorKind::ExtractionEmpty,
            IngestError::OcrTimeout(_) => ErrorKind::OcrTimeout,
            IngestError::OcrEngineInit(_) => ErrorKind::OcrEngineInitFailed,
            IngestError::EmbeddingDimMismatch { .. } => ErrorKind::EmbeddingDimMismatch,
            IngestError::StoreWrite(_) => ErrorKind::StoreWriteFailed,
            IngestError::KbBusy(_) => ErrorKind::KbBusy,
            IngestError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Per-file errors leave the run alive; everything else aborts it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::EmbeddingDimMismatch
                | ErrorKind::StoreWriteFailed
                | ErrorKind::KbBusy
                | ErrorKind::OcrEngineInitFailed
                | ErrorKind::Internal
        )
    }
}
