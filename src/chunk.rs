//! Fixed-stride window chunker.
//!
//! Turns an extracted [`Document`](crate::models::Document) into an ordered
//! sequence of [`Chunk`]s. Text is normalized first; windows of
//! `chunk_size` characters advance by `chunk_size - chunk_overlap`, so each
//! chunk shares `chunk_overlap` characters with its predecessor.
//!
//! Each chunk receives a deterministic id derived from its document id and
//! start offset, making output byte-identical across runs for equal inputs.

use sha2::{Digest, Sha256};

use crate::error::IngestError;
use crate::models::{Chunk, Document};

/// Normalize document text: strip trailing whitespace per line, collapse
/// internal whitespace runs to single spaces, drop empty lines.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            continue;
        };
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(first);
        for word in words {
            out.push(' ');
            out.push_str(word);
        }
    }
    out
}

/// Chunk a document's normalized text with a fixed-stride window.
///
/// Requires `chunk_size > 0` and `chunk_overlap < chunk_size`. Windows that
/// are whitespace-only are discarded; iteration stops once a window reaches
/// the end of the text.
pub fn chunk(
    document: &Document,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Result<Vec<Chunk>, IngestError> {
    if chunk_size == 0 || chunk_overlap >= chunk_size {
        return Err(IngestError::Internal(format!(
            "invalid chunking parameters: size={} overlap={}",
            chunk_size, chunk_overlap
        )));
    }

    let normalized = normalize(&document.text);
    let char_offsets: Vec<usize> = normalized
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .collect();
    let total_chars = char_offsets.len();
    let stride = chunk_size - chunk_overlap;
    let document_id = document.id();

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < total_chars {
        let end = (start + chunk_size).min(total_chars);
        let byte_start = char_offsets[start];
        let byte_end = if end == total_chars {
            normalized.len()
        } else {
            char_offsets[end]
        };
        let window = &normalized[byte_start..byte_end];
        if !window.trim().is_empty() {
            chunks.push(make_chunk(&document_id, start, window));
        }
        if end == total_chars {
            break;
        }
        start += stride;
    }

    Ok(chunks)
}

fn make_chunk(document_id: &str, start: usize, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(start.to_le_bytes());
    let digest = hasher.finalize();

    Chunk {
        id: hex::encode(&digest[..16]),
        document_id: document_id.to_string(),
        start,
        byte_len: text.len(),
        word_count: text.split_whitespace().count(),
        text: text.to_string(),
    }
}
