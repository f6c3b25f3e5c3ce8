//! End-to-end ingest flow over a temporary knowledge base.
//!
//! Uses stub embedding and OCR capabilities so no external services or
//! binaries are required.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use kb_ingest::change::METADATA_FILE;
use kb_ingest::config::{ChunkingConfig, Config, KbConfig, OcrConfig, PipelineConfig};
use kb_ingest::embedding::Embedder;
use kb_ingest::error::IngestError;
use kb_ingest::ingest::{run_ingest, Capabilities, IngestOptions};
use kb_ingest::kb::KbLock;
use kb_ingest::models::FileStatus;
use kb_ingest::ocr::{OcrEngine, OcrEngineFactory, OcrLine};
use kb_ingest::progress::NoProgress;
use kb_ingest::store::{IndexStore, SqliteStore};
use tempfile::TempDir;

struct StubEmbedder {
    model: String,
    dims: usize,
}

#[async_trait]
impl Embedder for StubEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let seed = t.len() as f32;
                (0..self.dims).map(|i| seed + i as f32).collect()
            })
            .collect())
    }
}

struct EchoEngine;

impl OcrEngine for EchoEngine {
    fn recognize(&mut self, image: &[u8], _languages: &[String]) -> Result<Vec<OcrLine>> {
        Ok(vec![OcrLine {
            text: String::from_utf8_lossy(image).into_owned(),
            confidence: 1.0,
        }])
    }
}

struct EchoFactory;

impl OcrEngineFactory for EchoFactory {
    fn create(&self) -> Result<Box<dyn OcrEngine>> {
        Ok(Box::new(EchoEngine))
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        kb: KbConfig {
            base_dir: root.join("kbs"),
        },
        chunking: ChunkingConfig {
            chunk_size: 64,
            chunk_overlap: 8,
        },
        ocr: OcrConfig {
            serial: true,
            log_path: root.join("app_logs/ocr_processing.log"),
            ..OcrConfig::default()
        },
        pipeline: PipelineConfig::default(),
        embedding: Default::default(),
    }
}

fn caps(dims: usize) -> Capabilities {
    Capabilities {
        embedder: Arc::new(StubEmbedder {
            model: "stub-model".to_string(),
            dims,
        }),
        ocr_factory: Arc::new(EchoFactory),
    }
}

fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

async fn kb_store(config: &Config, kb_id: &str) -> SqliteStore {
    SqliteStore::open(&config.kb.base_dir.join(kb_id)).await.unwrap()
}

#[tokio::test]
async fn ingest_then_reingest_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let a = write_file(
        tmp.path(),
        "a.md",
        "# Alpha\n\nThe alpha document covers deployment runbooks in detail.",
    );
    let b = write_file(
        tmp.path(),
        "b.txt",
        "Beta notes about infrastructure, scaling, and capacity planning.",
    );
    let paths = vec![a, b];

    let summary = run_ingest(
        &config,
        "docs",
        &paths,
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.count(FileStatus::Ingested), 2);
    assert!(summary.pipeline.stored > 0);
    assert_eq!(summary.pipeline.stored, summary.pipeline.embedded);
    assert_eq!(summary.pipeline.stored, summary.pipeline.parsed);

    let stored_before = {
        let store = kb_store(&config, "docs").await;
        let count = store.chunk_count().await.unwrap();
        store.close().await;
        count
    };

    // Second run over the same bytes: no NEW/MODIFIED, no new embeddings.
    let summary2 = run_ingest(
        &config,
        "docs",
        &paths,
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary2.count(FileStatus::Unchanged), 2);
    assert_eq!(summary2.count(FileStatus::Ingested), 0);
    assert_eq!(summary2.pipeline.stored, 0);

    let store = kb_store(&config, "docs").await;
    assert_eq!(store.chunk_count().await.unwrap(), stored_before);
    store.close().await;
}

#[tokio::test]
async fn modified_file_is_replaced_unchanged_file_keeps_chunks() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let stable = write_file(
        tmp.path(),
        "stable.md",
        "Stable content that never changes between the two runs.",
    );
    let volatile = write_file(
        tmp.path(),
        "volatile.md",
        "Initial version of the volatile document.",
    );
    let paths = vec![stable.clone(), volatile.clone()];

    run_ingest(
        &config,
        "docs",
        &paths,
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    let stable_id = stable.to_string_lossy().into_owned();
    let chunks_before = {
        let store = kb_store(&config, "docs").await;
        let rows = store.document_chunks(&stable_id).await.unwrap();
        store.close().await;
        rows
    };
    assert!(!chunks_before.is_empty());

    std::fs::write(
        &volatile,
        "A completely rewritten volatile document with different content entirely.",
    )
    .unwrap();

    let summary = run_ingest(
        &config,
        "docs",
        &paths,
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.count(FileStatus::Ingested), 1);
    assert_eq!(summary.count(FileStatus::Unchanged), 1);

    let store = kb_store(&config, "docs").await;
    let chunks_after = store.document_chunks(&stable_id).await.unwrap();
    let volatile_chunks = store
        .document_chunks(&volatile.to_string_lossy())
        .await
        .unwrap();
    store.close().await;

    // The untouched file's chunks are byte-identical across runs.
    assert_eq!(chunks_before, chunks_after);
    assert!(volatile_chunks
        .iter()
        .any(|(_, text)| text.contains("rewritten")));
}

#[tokio::test]
async fn missing_file_is_forgotten_and_removed_from_store() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let keep = write_file(tmp.path(), "keep.txt", "This document stays in the KB.");
    let gone = write_file(tmp.path(), "gone.txt", "This document will be deleted.");
    let paths = vec![keep.clone(), gone.clone()];

    run_ingest(
        &config,
        "docs",
        &paths,
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    std::fs::remove_file(&gone).unwrap();

    let summary = run_ingest(
        &config,
        "docs",
        &paths,
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.count(FileStatus::Removed), 1);

    let store = kb_store(&config, "docs").await;
    assert!(store
        .document_chunks(&gone.to_string_lossy())
        .await
        .unwrap()
        .is_empty());
    assert!(!store
        .document_chunks(&keep.to_string_lossy())
        .await
        .unwrap()
        .is_empty());
    store.close().await;
}

#[tokio::test]
async fn image_goes_through_ocr_and_lands_in_the_index() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let scan = write_file(
        tmp.path(),
        "scan.png",
        "recognized text from a scanned page of meeting notes",
    );

    let summary = run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&scan),
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.count(FileStatus::Ingested), 1);
    assert_eq!(summary.ocr.pages_processed, 1);
    assert_eq!(summary.ocr.engine_inits, 1);

    let log = std::fs::read_to_string(tmp.path().join("app_logs/ocr_processing.log")).unwrap();
    assert!(log.lines().count() >= 1);

    let store = kb_store(&config, "docs").await;
    let chunks = store
        .document_chunks(&scan.to_string_lossy())
        .await
        .unwrap();
    store.close().await;
    assert!(chunks.iter().any(|(_, text)| text.contains("recognized text")));
}

#[tokio::test]
async fn empty_file_is_marked_processed_without_chunks() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let empty = write_file(tmp.path(), "empty.txt", "   \n\t\n");

    let summary = run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&empty),
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.count(FileStatus::Empty), 1);
    assert_eq!(summary.pipeline.stored, 0);

    // Hash was recorded, so the file is not retried on the next run.
    let summary2 = run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&empty),
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary2.count(FileStatus::Unchanged), 1);
}

#[tokio::test]
async fn dimension_mismatch_aborts_before_any_commit() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let a = write_file(tmp.path(), "a.txt", "Document ingested with the first embedder.");

    run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&a),
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    let metadata_path = config.kb.base_dir.join("docs").join(METADATA_FILE);
    let metadata_before = std::fs::read_to_string(&metadata_path).unwrap();

    let b = write_file(tmp.path(), "b.txt", "A new document for the mismatched run.");
    let err = run_ingest(
        &config,
        "docs",
        &[a.clone(), b],
        &IngestOptions::default(),
        caps(4),
        &NoProgress,
    )
    .await
    .unwrap_err();

    let kind = err
        .downcast_ref::<IngestError>()
        .map(IngestError::kind)
        .unwrap();
    assert_eq!(kind.as_str(), "EMBEDDING_DIM_MISMATCH");

    let metadata_after = std::fs::read_to_string(&metadata_path).unwrap();
    assert_eq!(metadata_before, metadata_after);
}

#[tokio::test]
async fn force_reindex_accepts_a_new_embedding_identity() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let a = write_file(tmp.path(), "a.txt", "Document that gets rebuilt under a new model.");

    run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&a),
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    let summary = run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&a),
        &IngestOptions {
            force_reindex: true,
            force_ocr: false,
        },
        caps(4),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(summary.count(FileStatus::Ingested), 1);
    assert!(summary.pipeline.stored > 0);
}

#[tokio::test]
async fn concurrent_ingest_fails_fast_with_busy() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let a = write_file(tmp.path(), "a.txt", "Contended knowledge base content.");

    let kb_dir = config.kb.base_dir.join("docs");
    std::fs::create_dir_all(&kb_dir).unwrap();
    let _held = KbLock::acquire(&kb_dir).unwrap();

    let err = run_ingest(
        &config,
        "docs",
        std::slice::from_ref(&a),
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap_err();

    let kind = err
        .downcast_ref::<IngestError>()
        .map(IngestError::kind)
        .unwrap();
    assert_eq!(kind.as_str(), "KB_BUSY");
}

#[tokio::test]
async fn empty_input_returns_immediately_without_state() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());

    let summary = run_ingest(
        &config,
        "docs",
        &[],
        &IngestOptions::default(),
        caps(8),
        &NoProgress,
    )
    .await
    .unwrap();

    assert!(summary.files.is_empty());
    assert!(!config.kb.base_dir.join("docs").exists());
}
