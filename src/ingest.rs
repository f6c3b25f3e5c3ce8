//! Ingest orchestration.
//!
//! Sequences one ingest run: KB lock and metadata checks, change
//! detection, extraction (with shared batch OCR), the vectorization
//! pipeline, and the atomic hash-map commit. Per-file failures are
//! collected into the run summary; infrastructure failures abort before
//! anything is committed, so affected files reappear as NEW or MODIFIED on
//! the next run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;

use crate::change::{ChangeDetector, METADATA_FILE};
use crate::chunk;
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{ErrorKind, IngestError};
use crate::extract::{self, ExtractOptions};
use crate::kb::{self, KbInfo, KbLock};
use crate::models::{Document, FileOutcome, FileStatus};
use crate::ocr::log::OcrLog;
use crate::ocr::resources::{ResourceController, SysinfoProbe};
use crate::ocr::scheduler::{OcrScheduler, OcrStats};
use crate::ocr::OcrEngineFactory;
use crate::pipeline::{self, PipelineStats};
use crate::progress::{IngestProgressEvent, IngestProgressReporter};
use crate::store::{IndexStore, SqliteStore, INDEX_FILE};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Re-ingest everything regardless of stored hashes; required when the
    /// embedding identity changes.
    pub force_reindex: bool,
    /// Skip direct PDF text extraction and always OCR.
    pub force_ocr: bool,
}

/// Injected capabilities for one run.
pub struct Capabilities {
    pub embedder: Arc<dyn Embedder>,
    pub ocr_factory: Arc<dyn OcrEngineFactory>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub kb_id: String,
    pub files: Vec<FileOutcome>,
    pub pipeline: PipelineStats,
    pub ocr: OcrStats,
    pub duration_secs: f64,
}

impl RunSummary {
    pub fn count(&self, status: FileStatus) -> usize {
        self.files.iter().filter(|f| f.status == status).count()
    }
}

pub async fn run_ingest(
    config: &Config,
    kb_id: &str,
    paths: &[PathBuf],
    options: &IngestOptions,
    caps: Capabilities,
    progress: &dyn IngestProgressReporter,
) -> Result<RunSummary> {
    let started = Instant::now();
    let mut summary = RunSummary {
        kb_id: kb_id.to_string(),
        ..RunSummary::default()
    };

    if paths.is_empty() {
        return Ok(summary);
    }

    let kb_dir = kb::kb_dir(&config.kb.base_dir, kb_id)?;
    std::fs::create_dir_all(&kb_dir)?;
    let _lock = KbLock::acquire(&kb_dir)?;

    verify_embedding_identity(&kb_dir, caps.embedder.as_ref(), options)?;

    let store = Arc::new(SqliteStore::open(&kb_dir).await?);
    let store_dyn: Arc<dyn IndexStore> = store.clone();

    // Change detection.
    progress.report(IngestProgressEvent::Classifying {
        candidates: paths.len() as u64,
    });
    let mut detector = ChangeDetector::load(&kb_dir);
    let (changes, read_errors) = detector.classify(paths);

    for (path, reason) in read_errors {
        summary
            .files
            .push(FileOutcome::failed(path, ErrorKind::FileUnreadable, reason));
    }
    for path in &changes.missing {
        store_dyn.remove_document(&path.to_string_lossy()).await?;
        summary
            .files
            .push(FileOutcome::ok(path.clone(), FileStatus::Removed, 0));
    }
    if !options.force_reindex {
        for path in &changes.unchanged {
            summary
                .files
                .push(FileOutcome::ok(path.clone(), FileStatus::Unchanged, 0));
        }
    }

    let mut targets: Vec<PathBuf> = Vec::new();
    targets.extend(changes.new.iter().cloned());
    targets.extend(changes.modified.iter().cloned());
    if options.force_reindex {
        targets.extend(changes.unchanged.iter().cloned());
    }

    if targets.is_empty() {
        // Still commit forgotten MISSING records.
        for path in &changes.missing {
            detector.forget(path)?;
        }
        store.close().await;
        summary.duration_secs = started.elapsed().as_secs_f64();
        return Ok(summary);
    }

    // Shared OCR scheduler for every extractor invocation in this run.
    let controller = ResourceController::new(
        Box::new(SysinfoProbe::new()),
        config.ocr.cpu_ceiling,
        config.ocr.memory_ceiling,
        config.ocr.max_workers,
    );
    let ocr_log = OcrLog::new(config.ocr.log_path.clone());
    let scheduler = Arc::new(OcrScheduler::new(
        &config.ocr,
        caps.ocr_factory.clone(),
        controller,
        Some(ocr_log),
    ));

    let mut extract_opts = ExtractOptions::from(&config.ocr);
    extract_opts.force_ocr = extract_opts.force_ocr || options.force_ocr;

    // Extract concurrently; results keep input order.
    let total = targets.len() as u64;
    let mut join_set = tokio::task::JoinSet::new();
    for (index, path) in targets.iter().enumerate() {
        let scheduler = scheduler.clone();
        let opts = extract_opts.clone();
        let path = path.clone();
        join_set.spawn(async move {
            let result = extract::extract_document(&path, &scheduler, &opts).await;
            (index, result)
        });
    }

    let mut extracted: Vec<Option<Result<Document, IngestError>>> =
        (0..targets.len()).map(|_| None).collect();
    let mut done = 0u64;
    while let Some(joined) = join_set.join_next().await {
        let (index, result) = joined.map_err(|e| IngestError::Internal(e.to_string()))?;
        done += 1;
        progress.report(IngestProgressEvent::Extracting { n: done, total });
        extracted[index] = Some(result);
    }

    // OCR engine that never came up (and no worker succeeded) is an
    // infrastructure failure, not a per-file one.
    let ocr_stats = scheduler.stats();
    if ocr_stats.engine_init_failures > 0 && ocr_stats.engine_inits == 0 {
        let reason = scheduler
            .last_init_error()
            .unwrap_or_else(|| "unknown".to_string());
        scheduler.shutdown().await;
        store.close().await;
        return Err(IngestError::OcrEngineInit(reason).into());
    }

    let mut documents: Vec<Document> = Vec::new();
    let mut empty_paths: Vec<PathBuf> = Vec::new();
    for (path, result) in targets.iter().zip(extracted.into_iter()) {
        let Some(result) = result else {
            continue;
        };
        match result {
            Ok(doc) if doc.text.trim().is_empty() => {
                // Zero text even after OCR: no chunks, but the hash is
                // still recorded so the file is not retried every run.
                summary.files.push(FileOutcome {
                    path: path.clone(),
                    status: FileStatus::Empty,
                    chunks: 0,
                    error: Some(ErrorKind::ExtractionEmpty),
                    reason: Some("no extractable text".to_string()),
                });
                empty_paths.push(path.clone());
            }
            Ok(doc) => documents.push(doc),
            Err(e) => {
                summary
                    .files
                    .push(FileOutcome::failed(path.clone(), e.kind(), e.to_string()));
            }
        }
    }

    progress.report(IngestProgressEvent::Vectorizing {
        documents: documents.len() as u64,
    });

    let chunk_size = config.chunking.chunk_size;
    let chunk_overlap = config.chunking.chunk_overlap;
    let document_paths: Vec<PathBuf> = documents.iter().map(|d| d.source.clone()).collect();
    let pipeline_result = pipeline::run(
        documents,
        move |d| chunk::chunk(d, chunk_size, chunk_overlap),
        caps.embedder.clone(),
        store_dyn.clone(),
        caps.embedder.dims(),
        config.pipeline.queue_cap,
        config.pipeline.embed_batch,
    )
    .await;

    summary.ocr = scheduler.stats();
    scheduler.shutdown().await;

    let stats = match pipeline_result {
        Ok(stats) => stats,
        Err(e) => {
            store.close().await;
            return Err(e.into());
        }
    };

    let stored: HashMap<String, u64> = stats.stored_per_document.iter().cloned().collect();
    let failed = stats.failed_documents();
    let mut processed: Vec<PathBuf> = Vec::new();
    for path in &document_paths {
        let id = path.to_string_lossy().into_owned();
        if let Some(count) = stored.get(&id) {
            summary
                .files
                .push(FileOutcome::ok(path.clone(), FileStatus::Ingested, *count));
            processed.push(path.clone());
        } else if failed.contains(&id) {
            let reason = stats
                .errors
                .iter()
                .find(|e| e.item == id)
                .map(|e| format!("{}: {}", e.stage, e.reason))
                .unwrap_or_else(|| "pipeline error".to_string());
            summary
                .files
                .push(FileOutcome::failed(path.clone(), ErrorKind::Internal, reason));
        }
    }
    processed.extend(empty_paths.iter().cloned());
    summary.pipeline = stats;

    // Commit: forget removed files, then replace hashes for everything that
    // drained successfully. A failure before this point leaves the map
    // untouched.
    for path in &changes.missing {
        detector.forget(path)?;
    }
    let hash_errors = detector.mark_processed(&processed)?;
    for (path, reason) in hash_errors {
        summary
            .files
            .push(FileOutcome::failed(path, ErrorKind::FileUnreadable, reason));
    }

    store.close().await;
    summary.duration_secs = started.elapsed().as_secs_f64();
    Ok(summary)
}

/// The KB's recorded embedding identity must match the configured embedder
/// unless a forced rebuild is requested, in which case the index and hash
/// map are wiped and the identity rewritten.
fn verify_embedding_identity(
    kb_dir: &std::path::Path,
    embedder: &dyn Embedder,
    options: &IngestOptions,
) -> Result<()> {
    match kb::read_info(kb_dir)? {
        None => {
            kb::write_info(kb_dir, &KbInfo::new(embedder.model_name(), embedder.dims()))?;
            Ok(())
        }
        Some(info) => {
            let model_matches = info.embedding_model == embedder.model_name();
            let dims_match = info.embedding_dim == embedder.dims();
            if model_matches && dims_match {
                return Ok(());
            }
            if !options.force_reindex {
                if !dims_match {
                    return Err(IngestError::EmbeddingDimMismatch {
                        expected: info.embedding_dim,
                        actual: embedder.dims(),
                    }
                    .into());
                }
                anyhow::bail!(
                    "KB was built with embedding model '{}' but '{}' is configured; \
                     rerun with --force-reindex to rebuild",
                    info.embedding_model,
                    embedder.model_name()
                );
            }
            // Forced rebuild with a new identity: drop the old index and
            // hash map so stale-dimension embeddings cannot survive.
            let index = kb_dir.join(INDEX_FILE);
            let _ = std::fs::remove_file(&index);
            let _ = std::fs::remove_file(index.with_extension("sqlite-wal"));
            let _ = std::fs::remove_file(index.with_extension("sqlite-shm"));
            let _ = std::fs::remove_file(kb_dir.join(METADATA_FILE));
            kb::write_info(kb_dir, &KbInfo::new(embedder.model_name(), embedder.dims()))?;
            Ok(())
        }
    }
}
