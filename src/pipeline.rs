//! Three-stage async vectorization pipeline.
//!
//! Documents stream through parse → embed → store as three cooperative
//! tasks separated by bounded queues, so chunking, the embedder, and the
//! index store run in parallel. The embed stage is single-flight and the
//! store stage serializes writes. End-of-stream propagates by closing each
//! queue only after the stage has drained its input.
//!
//! Per-item failures are counted and the stream continues; a dimension
//! mismatch or store write failure is fatal and aborts the run before any
//! metadata commit.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::embedding::Embedder;
use crate::error::IngestError;
use crate::models::{Chunk, Document};
use crate::store::IndexStore;

#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: &'static str,
    pub item: String,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineStats {
    pub parsed: u64,
    pub embedded: u64,
    pub stored: u64,
    pub parse_secs: f64,
    pub embed_secs: f64,
    pub store_secs: f64,
    pub errors: Vec<StageError>,
    /// Chunk counts per successfully stored document, in store order.
    pub stored_per_document: Vec<(String, u64)>,
}

impl PipelineStats {
    /// Document ids that hit a per-item error in any stage.
    pub fn failed_documents(&self) -> HashSet<String> {
        self.errors.iter().map(|e| e.item.clone()).collect()
    }
}

struct ParsedDoc {
    document_id: String,
    chunks: Vec<Chunk>,
}

struct EmbeddedDoc {
    document_id: String,
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
}

struct ParseOutcome {
    parsed: u64,
    secs: f64,
    errors: Vec<StageError>,
}

struct EmbedOutcome {
    embedded: u64,
    secs: f64,
    errors: Vec<StageError>,
    fatal: Option<IngestError>,
}

struct StoreOutcome {
    stored: u64,
    secs: f64,
    stored_per_document: Vec<(String, u64)>,
    fatal: Option<IngestError>,
}

/// Run the pipeline over `documents`. Relative document order is preserved
/// end to end; order within a document is preserved by the parser.
pub async fn run<F>(
    documents: Vec<Document>,
    parse_fn: F,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IndexStore>,
    expected_dim: usize,
    queue_cap: usize,
    embed_batch: usize,
) -> Result<PipelineStats, IngestError>
where
    F: Fn(&Document) -> Result<Vec<Chunk>, IngestError> + Send + 'static,
{
    let (parse_tx, parse_rx) = mpsc::channel::<ParsedDoc>(queue_cap);
    let (embed_tx, embed_rx) = mpsc::channel::<EmbeddedDoc>(queue_cap);

    let parse_handle = tokio::spawn(parse_stage(documents, parse_fn, parse_tx));
    let embed_handle = tokio::spawn(embed_stage(
        parse_rx,
        embed_tx,
        embedder.clone(),
        expected_dim,
        embed_batch,
    ));
    let model = embedder.model_name().to_string();
    let store_handle = tokio::spawn(store_stage(embed_rx, store, model));

    let (parse_out, embed_out, store_out) =
        tokio::join!(parse_handle, embed_handle, store_handle);

    let parse_out = parse_out.map_err(|e| IngestError::Internal(e.to_string()))?;
    let embed_out = embed_out.map_err(|e| IngestError::Internal(e.to_string()))?;
    let store_out = store_out.map_err(|e| IngestError::Internal(e.to_string()))?;

    let mut stats = PipelineStats {
        parsed: parse_out.parsed,
        embedded: embed_out.embedded,
        stored: store_out.stored,
        parse_secs: parse_out.secs,
        embed_secs: embed_out.secs,
        store_secs: store_out.secs,
        errors: parse_out.errors,
        stored_per_document: store_out.stored_per_document,
    };
    stats.errors.extend(embed_out.errors);

    if let Some(fatal) = store_out.fatal {
        return Err(fatal);
    }
    if let Some(fatal) = embed_out.fatal {
        return Err(fatal);
    }

    Ok(stats)
}

async fn parse_stage<F>(
    documents: Vec<Document>,
    parse_fn: F,
    tx: mpsc::Sender<ParsedDoc>,
) -> ParseOutcome
where
    F: Fn(&Document) -> Result<Vec<Chunk>, IngestError> + Send + 'static,
{
    let mut outcome = ParseOutcome {
        parsed: 0,
        secs: 0.0,
        errors: Vec::new(),
    };

    for document in documents {
        let started = Instant::now();
        let result = parse_fn(&document);
        outcome.secs += started.elapsed().as_secs_f64();

        match result {
            Ok(chunks) => {
                outcome.parsed += chunks.len() as u64;
                let parsed = ParsedDoc {
                    document_id: document.id(),
                    chunks,
                };
                if tx.send(parsed).await.is_err() {
                    // Downstream aborted; end the stream.
                    break;
                }
            }
            Err(e) => outcome.errors.push(StageError {
                stage: "parse",
                item: document.id(),
                reason: e.to_string(),
            }),
        }
    }

    outcome
}

async fn embed_stage(
    mut rx: mpsc::Receiver<ParsedDoc>,
    tx: mpsc::Sender<EmbeddedDoc>,
    embedder: Arc<dyn Embedder>,
    expected_dim: usize,
    embed_batch: usize,
) -> EmbedOutcome {
    let mut outcome = EmbedOutcome {
        embedded: 0,
        secs: 0.0,
        errors: Vec::new(),
        fatal: None,
    };

    'docs: while let Some(doc) = rx.recv().await {
        let mut vectors: Vec<Vec<f32>> = Vec::with_capacity(doc.chunks.len());

        for batch in doc.chunks.chunks(embed_batch.max(1)) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let started = Instant::now();
            let result = embedder.embed(&texts).await;
            outcome.secs += started.elapsed().as_secs_f64();

            match result {
                Ok(batch_vectors) => {
                    for vector in &batch_vectors {
                        if vector.len() != expected_dim {
                            outcome.fatal = Some(IngestError::EmbeddingDimMismatch {
                                expected: expected_dim,
                                actual: vector.len(),
                            });
                            rx.close();
                            return outcome;
                        }
                    }
                    outcome.embedded += batch_vectors.len() as u64;
                    vectors.extend(batch_vectors);
                }
                Err(e) => {
                    outcome.errors.push(StageError {
                        stage: "embed",
                        item: doc.document_id.clone(),
                        reason: e.to_string(),
                    });
                    continue 'docs;
                }
            }
        }

        let embedded = EmbeddedDoc {
            document_id: doc.document_id,
            chunks: doc.chunks,
            vectors,
        };
        if tx.send(embedded).await.is_err() {
            break;
        }
    }

    outcome
}

async fn store_stage(
    mut rx: mpsc::Receiver<EmbeddedDoc>,
    store: Arc<dyn IndexStore>,
    model: String,
) -> StoreOutcome {
    let mut outcome = StoreOutcome {
        stored: 0,
        secs: 0.0,
        stored_per_document: Vec::new(),
        fatal: None,
    };

    while let Some(doc) = rx.recv().await {
        let started = Instant::now();
        let result = store
            .replace_document(&doc.document_id, &doc.chunks, &doc.vectors, &model)
            .await;
        outcome.secs += started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                let count = doc.chunks.len() as u64;
                outcome.stored += count;
                outcome.stored_per_document.push((doc.document_id, count));
            }
            Err(e) => {
                outcome.fatal = Some(IngestError::StoreWrite(e.to_string()));
                rx.close();
                return outcome;
            }
        }
    }

    outcome
}
