//! SQLite-backed index store.
//!
//! One `index.sqlite` per KB directory, WAL journal, bounded pool. Vectors
//! are stored as little-endian f32 BLOBs.

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use super::IndexStore;
use crate::models::Chunk;

/// Index database file name inside the KB directory.
pub const INDEX_FILE: &str = "index.sqlite";

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(kb_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(kb_dir)?;
        let db_path = kb_dir.join(INDEX_FILE);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                start_offset INTEGER NOT NULL,
                byte_len INTEGER NOT NULL,
                word_count INTEGER NOT NULL,
                text TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS embeddings (
                chunk_id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                dims INTEGER NOT NULL,
                vector BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Encode a vector as little-endian bytes for BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a BLOB back into a vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn replace_document(
        &self,
        document_id: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        model: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, start_offset, byte_len, word_count, text) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.start as i64)
            .bind(chunk.byte_len as i64)
            .bind(chunk.word_count as i64)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO embeddings (chunk_id, model, dims, vector) VALUES (?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_document(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<(i64, String)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT start_offset, text FROM chunks WHERE document_id = ? ORDER BY start_offset",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn chunk_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn embedding_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn chunk(document_id: &str, start: usize, text: &str) -> Chunk {
        Chunk {
            id: format!("{document_id}:{start}"),
            document_id: document_id.to_string(),
            start,
            byte_len: text.len(),
            word_count: text.split_whitespace().count(),
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn replace_and_count() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(tmp.path()).await.unwrap();

        let chunks = vec![chunk("/a.txt", 0, "first"), chunk("/a.txt", 5, "second")];
        let vectors = vec![vec![0.1, 0.2], vec![0.3, 0.4]];
        store
            .replace_document("/a.txt", &chunks, &vectors, "test-model")
            .await
            .unwrap();

        assert_eq!(store.chunk_count().await.unwrap(), 2);
        assert_eq!(store.embedding_count().await.unwrap(), 2);

        // Re-ingesting the same document replaces rather than appends.
        store
            .replace_document("/a.txt", &chunks[..1], &vectors[..1], "test-model")
            .await
            .unwrap();
        assert_eq!(store.chunk_count().await.unwrap(), 1);
        assert_eq!(store.embedding_count().await.unwrap(), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn remove_document_drops_pairs() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(tmp.path()).await.unwrap();

        let chunks = vec![chunk("/a.txt", 0, "alpha")];
        store
            .replace_document("/a.txt", &chunks, &[vec![1.0]], "m")
            .await
            .unwrap();
        store.remove_document("/a.txt").await.unwrap();

        assert_eq!(store.chunk_count().await.unwrap(), 0);
        assert_eq!(store.embedding_count().await.unwrap(), 0);
        store.close().await;
    }

    #[tokio::test]
    async fn document_chunks_come_back_ordered() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteStore::open(tmp.path()).await.unwrap();

        let chunks = vec![
            chunk("/a.txt", 14, "third"),
            chunk("/a.txt", 0, "first"),
            chunk("/a.txt", 7, "second"),
        ];
        let vectors = vec![vec![0.0]; 3];
        store
            .replace_document("/a.txt", &chunks, &vectors, "m")
            .await
            .unwrap();

        let rows = store.document_chunks("/a.txt").await.unwrap();
        assert_eq!(
            rows,
            vec![
                (0, "first".to_string()),
                (7, "second".to_string()),
                (14, "third".to_string()),
            ]
        );
        store.close().await;
    }

    #[test]
    fn vector_blob_round_trip() {
        let vector = vec![0.5f32, -1.25, 3.75, 0.0];
        assert_eq!(blob_to_vec(&vec_to_blob(&vector)), vector);
    }
}
