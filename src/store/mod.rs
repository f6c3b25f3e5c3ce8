//! Index store adapter.
//!
//! The store persists `(chunk, embedding)` pairs per knowledge base. Its
//! internal representation is opaque to the rest of the pipeline; only this
//! trait is depended on, so alternative backends can be injected.

pub mod sqlite;

pub use sqlite::{SqliteStore, INDEX_FILE};

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Chunk;

#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Replace all chunks and embeddings for a document in one transaction.
    /// `chunks[i]` pairs with `vectors[i]`.
    async fn replace_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
    ) -> Result<()>;

    /// Drop a document's chunks and embeddings.
    async fn remove_document(&self, document_id: &str) -> Result<()>;

    /// Ordered `(start_offset, text)` pairs for one document.
    async fn document_chunks(&self, document_id: &str) -> Result<Vec<(i64, String)>>;

    async fn chunk_count(&self) -> Result<i64>;

    async fn embedding_count(&self) -> Result<i64>;

    async fn close(&self);
}
