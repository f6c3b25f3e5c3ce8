//! # kb-ingest
//!
//! An incremental, content-addressed document ingestion pipeline for
//! knowledge bases.
//!
//! kb-ingest takes a heterogeneous list of files (PDFs, Office documents,
//! text, images), routes each through an appropriate extraction path —
//! including page-parallel batch OCR — chunks the extracted text, produces
//! embeddings, and maintains a per-KB index that re-ingests only changed
//! files.
//!
//! ## Architecture
//!
//! ```text
//! input files ──► Change Detector ──► Extractor Router ──┐
//!                                                         ├─► Chunker ──► Pipeline ──► Index Store
//!                                  PDF/image pages ──► Batch OCR Scheduler ─┘
//! ```
//!
//! Embedders and OCR engines are injected capabilities: the pipeline drives
//! them through the [`embedding::Embedder`] and [`ocr::OcrEngine`] traits.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`change`] | Content-hash change detection |
//! | [`extract`] | Per-type extraction routing |
//! | [`ocr`] | Batch OCR scheduler, engines, resource control |
//! | [`chunk`] | Fixed-window chunking |
//! | [`pipeline`] | Parse → embed → store pipeline |
//! | [`embedding`] | Embedding capability and providers |
//! | [`store`] | Index store adapter |
//! | [`kb`] | KB lifecycle, metadata, locking |
//! | [`ingest`] | Ingest orchestration |

pub mod change;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod kb;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod stats;
pub mod store;
