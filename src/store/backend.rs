//! Storage capability interface.
//!
//! [`StoreBackend`] is the seam between the retrieval engine and the
//! durable layer: every operation is scoped to one book's namespace,
//! so an embedded key-value target can replace SQLite without
//! touching the retriever. Implementations must be `Send + Sync`.
//!
//! The BM25 payload crosses this boundary as an opaque string; the
//! backend never inspects it.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BookIndexMeta, Chunk, Conversation, Message};

/// Per-book durable storage.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`save_chunks`](StoreBackend::save_chunks) | Replace a book's chunks in one transaction |
/// | [`load_chunks`](StoreBackend::load_chunks) | Read all chunks for a book |
/// | [`save_meta`](StoreBackend::save_meta) / [`load_meta`](StoreBackend::load_meta) | Commit record for an indexed book |
/// | [`save_bm25`](StoreBackend::save_bm25) / [`load_bm25`](StoreBackend::load_bm25) | Opaque serialized lexical index, one record per book |
/// | conversation/message methods | Chat history scoped to the book |
/// | [`clear_book`](StoreBackend::clear_book) | Drop the book's whole namespace |
/// | [`close_all`](StoreBackend::close_all) | Release every open handle (error recovery) |
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Replace all chunks for a book in a single transaction.
    async fn save_chunks(&self, book_hash: &str, chunks: &[Chunk]) -> Result<()>;

    /// Load every chunk persisted for a book.
    async fn load_chunks(&self, book_hash: &str) -> Result<Vec<Chunk>>;

    async fn save_meta(&self, meta: &BookIndexMeta) -> Result<()>;

    async fn load_meta(&self, book_hash: &str) -> Result<Option<BookIndexMeta>>;

    /// Persist the serialized lexical index, replacing any prior record.
    async fn save_bm25(&self, book_hash: &str, payload: &str) -> Result<()>;

    async fn load_bm25(&self, book_hash: &str) -> Result<Option<String>>;

    /// Insert or update a conversation row.
    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn load_conversations(&self, book_hash: &str) -> Result<Vec<Conversation>>;

    /// Read-mutate-write the title in one transaction, bumping
    /// `updated_at`.
    async fn update_conversation_title(
        &self,
        book_hash: &str,
        conversation_id: &str,
        title: &str,
        updated_at: i64,
    ) -> Result<()>;

    /// Delete the conversation and all its messages in the same
    /// transaction.
    async fn delete_conversation(&self, book_hash: &str, conversation_id: &str) -> Result<()>;

    async fn save_message(&self, book_hash: &str, message: &Message) -> Result<()>;

    async fn load_messages(&self, book_hash: &str, conversation_id: &str) -> Result<Vec<Message>>;

    /// Drop everything the book owns: chunks, meta, lexical index,
    /// conversations, messages.
    async fn clear_book(&self, book_hash: &str) -> Result<()>;

    /// Close every open handle. The next operation reopens lazily.
    async fn close_all(&self) -> Result<()>;
}

/// Encode an embedding as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn empty_blob_is_empty_vector() {
        assert!(blob_to_vec(&[]).is_empty());
        assert!(vec_to_blob(&[]).is_empty());
    }
}
