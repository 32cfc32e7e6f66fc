//! Core data types that flow through the indexing and retrieval
//! pipeline.
//!
//! ```text
//! BookDocument → chunker → Chunk → embed() → Chunk (+vector)
//!                                      ↓
//!                                  BookStore → search() → ScoredChunk
//! ```
//!
//! `Chunk`, `BookIndexMeta`, `Conversation`, and `Message` are
//! persisted; `ScoredChunk`, `IndexingState`, and progress events are
//! transient.

use serde::{Deserialize, Serialize};

/// A contiguous passage of book text, the atomic unit of retrieval.
///
/// The id is a deterministic function of `(book_hash, section_index,
/// ordinal)`, so re-chunking identical input yields an identical id
/// set. `page_number` is derived from the chunk's character offset
/// from the start of the book and is monotonic non-decreasing in
/// `(section_index, position)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub book_hash: String,
    pub section_index: usize,
    pub chapter_title: String,
    pub page_number: u32,
    pub text: String,
    /// Fixed length across a book; absent until the embedding phase
    /// runs, or permanently on lexical-only (degraded) indexes.
    pub embedding: Option<Vec<f32>>,
}

/// How a [`ScoredChunk`] was retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMethod {
    Vector,
    Bm25,
    Hybrid,
    Context,
}

/// A chunk paired with a relevance score for one query. Never persisted.
///
/// Hybrid scores are normalized to `[0, 1]`; context chunks carry the
/// fixed score [`CONTEXT_SCORE`] so they always outrank fused results.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
    pub method: SearchMethod,
}

/// Score assigned to page/section context chunks; above the hybrid
/// maximum of 1.0 by construction.
pub const CONTEXT_SCORE: f32 = 2.0;

/// Commit record for an indexed book. Written last in an indexing
/// run; a book is "indexed" iff its meta exists with
/// `total_chunks > 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookIndexMeta {
    pub book_hash: String,
    pub book_title: String,
    pub author_name: String,
    pub total_sections: usize,
    pub total_chunks: usize,
    pub embedding_model: String,
    /// Vector length, when the index carries embeddings.
    pub embedding_dims: Option<usize>,
    /// Characters per derived page at index time.
    pub page_size_chars: usize,
    /// Unix epoch seconds.
    pub last_updated: i64,
}

/// A chat thread belonging to exactly one book. Addressed by
/// `(book_hash, id)`; the id alone is not global.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub book_hash: String,
    pub title: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted message roles. `system` is never persisted, which this
/// enum makes unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// One message within a conversation, ordered by `created_at`
/// (epoch milliseconds). Appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingStatus {
    Idle,
    Indexing,
    Complete,
    Error,
}

/// Ephemeral per-book indexing state, one entry per book. Created
/// when an index run starts, discarded on book clear.
#[derive(Debug, Clone)]
pub struct IndexingState {
    pub status: IndexingStatus,
    /// 0–100.
    pub progress: u8,
    pub chunks_processed: usize,
    pub total_chunks: usize,
    pub error: Option<String>,
}

impl IndexingState {
    pub fn started() -> Self {
        Self {
            status: IndexingStatus::Indexing,
            progress: 0,
            chunks_processed: 0,
            total_chunks: 0,
            error: None,
        }
    }
}

/// Indexing pipeline phase reported to progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexPhase {
    Chunking,
    Embedding,
    Indexing,
}

/// A single progress event: `current` out of `total` within `phase`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
    pub phase: IndexPhase,
}

/// Observer for indexing progress. Implementations must be cheap;
/// they are called from inside the pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for callers that don't track progress.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}
