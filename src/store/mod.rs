//! Per-book storage with warm caches and the search primitives.
//!
//! [`BookStore`] fronts a [`StoreBackend`] with per-book in-memory
//! caches of chunks, the deserialized lexical index, book meta, and
//! conversations. Caches hand out `Arc` snapshots, so any number of
//! concurrent retrievals iterate without contending with writers;
//! each write replaces the matching cache entry atomically after the
//! backend transaction succeeds.
//!
//! Search primitives:
//!
//! - **vector** — exact cosine scan over cached chunks (the per-book
//!   corpus is small enough that no ANN structure is warranted);
//! - **bm25** — lookup in the deserialized lexical index;
//! - **hybrid** — both issued in parallel at `2k` candidates each,
//!   max-normalized per list, weighted (vector 1.0, BM25 0.8 by
//!   default), merged with passage-level deduplication, truncated
//!   to `k`.
//!
//! All three honor the spoiler filter: chunks past `max_page` never
//! surface.

pub mod backend;
pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info, warn};

use crate::config::RetrievalConfig;
use crate::error::{Error, Result};
use crate::lexical::Bm25Index;
use crate::models::{
    BookIndexMeta, Chunk, Conversation, Message, ScoredChunk, SearchMethod,
};

pub use backend::StoreBackend;
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Cosine similarity with the defensive conventions retrieval relies
/// on: mismatched lengths or a zero norm score 0 rather than erroring.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}

pub struct BookStore {
    backend: Arc<dyn StoreBackend>,
    chunk_cache: RwLock<HashMap<String, Arc<Vec<Chunk>>>>,
    bm25_cache: RwLock<HashMap<String, Arc<Bm25Index>>>,
    meta_cache: RwLock<HashMap<String, BookIndexMeta>>,
    conversation_cache: RwLock<HashMap<String, Arc<Vec<Conversation>>>>,
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Store("store cache lock poisoned".into())
}

impl BookStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self {
            backend,
            chunk_cache: RwLock::new(HashMap::new()),
            bm25_cache: RwLock::new(HashMap::new()),
            meta_cache: RwLock::new(HashMap::new()),
            conversation_cache: RwLock::new(HashMap::new()),
        }
    }

    // ---- chunks ----

    /// Persist all chunks for a book in one transaction, then replace
    /// the chunk cache wholesale with the written set.
    pub async fn save_chunks(&self, book_hash: &str, chunks: Vec<Chunk>) -> Result<()> {
        self.backend.save_chunks(book_hash, &chunks).await?;
        self.chunk_cache
            .write()
            .map_err(lock_poisoned)?
            .insert(book_hash.to_string(), Arc::new(chunks));
        Ok(())
    }

    /// Cached chunk snapshot for a book; loads from the backend on a
    /// cold cache.
    pub async fn chunks(&self, book_hash: &str) -> Result<Arc<Vec<Chunk>>> {
        if let Some(cached) = self
            .chunk_cache
            .read()
            .map_err(lock_poisoned)?
            .get(book_hash)
        {
            return Ok(cached.clone());
        }
        let loaded = Arc::new(self.backend.load_chunks(book_hash).await?);
        self.chunk_cache
            .write()
            .map_err(lock_poisoned)?
            .insert(book_hash.to_string(), loaded.clone());
        Ok(loaded)
    }

    // ---- meta ----

    pub async fn save_meta(&self, meta: &BookIndexMeta) -> Result<()> {
        self.backend.save_meta(meta).await?;
        self.meta_cache
            .write()
            .map_err(lock_poisoned)?
            .insert(meta.book_hash.clone(), meta.clone());
        Ok(())
    }

    pub async fn meta(&self, book_hash: &str) -> Result<Option<BookIndexMeta>> {
        if let Some(cached) = self
            .meta_cache
            .read()
            .map_err(lock_poisoned)?
            .get(book_hash)
        {
            return Ok(Some(cached.clone()));
        }
        let loaded = self.backend.load_meta(book_hash).await?;
        if let Some(meta) = &loaded {
            self.meta_cache
                .write()
                .map_err(lock_poisoned)?
                .insert(book_hash.to_string(), meta.clone());
        }
        Ok(loaded)
    }

    /// A book is indexed iff its meta exists with `total_chunks > 0`.
    pub async fn is_book_indexed(&self, book_hash: &str) -> Result<bool> {
        Ok(self
            .meta(book_hash)
            .await?
            .map(|meta| meta.total_chunks > 0)
            .unwrap_or(false))
    }

    // ---- lexical index ----

    pub async fn save_bm25_index(&self, book_hash: &str, index: Bm25Index) -> Result<()> {
        let payload = index.to_json()?;
        self.backend.save_bm25(book_hash, &payload).await?;
        self.bm25_cache
            .write()
            .map_err(lock_poisoned)?
            .insert(book_hash.to_string(), Arc::new(index));
        Ok(())
    }

    pub async fn bm25_index(&self, book_hash: &str) -> Result<Option<Arc<Bm25Index>>> {
        if let Some(cached) = self
            .bm25_cache
            .read()
            .map_err(lock_poisoned)?
            .get(book_hash)
        {
            return Ok(Some(cached.clone()));
        }
        let Some(payload) = self.backend.load_bm25(book_hash).await? else {
            return Ok(None);
        };
        let index = Arc::new(Bm25Index::from_json(&payload)?);
        self.bm25_cache
            .write()
            .map_err(lock_poisoned)?
            .insert(book_hash.to_string(), index.clone());
        Ok(Some(index))
    }

    // ---- search ----

    /// Exact cosine scan over cached chunks with embeddings.
    pub async fn vector_search(
        &self,
        book_hash: &str,
        query_vec: &[f32],
        limit: usize,
        max_page: Option<u32>,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.chunks(book_hash).await?;

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .filter(|c| within_page_bound(c, max_page))
            .filter_map(|c| {
                let embedding = c.embedding.as_ref()?;
                Some(ScoredChunk {
                    chunk: c.clone(),
                    score: cosine_similarity(query_vec, embedding),
                    method: SearchMethod::Vector,
                })
            })
            .collect();

        sort_scored(&mut scored);
        scored.truncate(limit);
        Ok(scored)
    }

    /// Lexical search via the deserialized index. A query that yields
    /// no tokens matches nothing; a missing index matches nothing.
    pub async fn bm25_search(
        &self,
        book_hash: &str,
        query: &str,
        limit: usize,
        max_page: Option<u32>,
    ) -> Result<Vec<ScoredChunk>> {
        let Some(index) = self.bm25_index(book_hash).await? else {
            return Ok(Vec::new());
        };
        let chunks = self.chunks(book_hash).await?;
        let by_id: HashMap<&str, &Chunk> =
            chunks.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut scored: Vec<ScoredChunk> = index
            .search(query, limit)
            .into_iter()
            .filter_map(|(id, score)| {
                let chunk = *by_id.get(id.as_str())?;
                if !within_page_bound(chunk, max_page) {
                    return None;
                }
                Some(ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                    method: SearchMethod::Bm25,
                })
            })
            .collect();

        scored.truncate(limit);
        Ok(scored)
    }

    /// Weighted fusion of vector and BM25 results.
    ///
    /// Both sub-searches request `2k` candidates in parallel; each
    /// list is normalized by its own maximum, weighted, and merged.
    /// The deduplication key is the passage's first 100 characters:
    /// when both methods return the same passage, the retained score
    /// is the better weighted score and the method becomes `Hybrid`.
    pub async fn hybrid_search(
        &self,
        book_hash: &str,
        query_embedding: Option<&[f32]>,
        query: &str,
        retrieval: &RetrievalConfig,
        top_k: usize,
        max_page: Option<u32>,
    ) -> Result<Vec<ScoredChunk>> {
        let candidate_k = top_k * 2;

        let (vector_results, bm25_results) = tokio::join!(
            async {
                match query_embedding {
                    Some(qv) => {
                        self.vector_search(book_hash, qv, candidate_k, max_page)
                            .await
                    }
                    None => Ok(Vec::new()),
                }
            },
            self.bm25_search(book_hash, query, candidate_k, max_page),
        );
        let vector_results = vector_results?;
        let bm25_results = bm25_results?;

        let vector_norm = normalize_by_max(&vector_results);
        let bm25_norm = normalize_by_max(&bm25_results);

        let mut merged: HashMap<String, ScoredChunk> = HashMap::new();

        for (scored, norm) in vector_results.iter().zip(vector_norm) {
            let key = dedup_key(&scored.chunk.text);
            merged.insert(
                key,
                ScoredChunk {
                    chunk: scored.chunk.clone(),
                    score: norm * retrieval.vector_weight,
                    method: SearchMethod::Vector,
                },
            );
        }

        for (scored, norm) in bm25_results.iter().zip(bm25_norm) {
            let key = dedup_key(&scored.chunk.text);
            let weighted = norm * retrieval.bm25_weight;
            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.score = existing.score.max(weighted);
                    existing.method = SearchMethod::Hybrid;
                }
                None => {
                    merged.insert(
                        key,
                        ScoredChunk {
                            chunk: scored.chunk.clone(),
                            score: weighted,
                            method: SearchMethod::Bm25,
                        },
                    );
                }
            }
        }

        let mut results: Vec<ScoredChunk> = merged.into_values().collect();
        sort_scored(&mut results);
        results.truncate(top_k);

        debug!(
            book = book_hash,
            results = results.len(),
            "hybrid search complete"
        );
        Ok(results)
    }

    // ---- page / section context ----

    pub async fn chunks_for_page(&self, book_hash: &str, page_number: u32) -> Result<Vec<Chunk>> {
        let chunks = self.chunks(book_hash).await?;
        Ok(chunks
            .iter()
            .filter(|c| c.page_number == page_number)
            .cloned()
            .collect())
    }

    pub async fn chunks_for_section(
        &self,
        book_hash: &str,
        section_index: usize,
    ) -> Result<Vec<Chunk>> {
        let chunks = self.chunks(book_hash).await?;
        Ok(chunks
            .iter()
            .filter(|c| c.section_index == section_index)
            .cloned()
            .collect())
    }

    // ---- conversations ----

    pub async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.backend.save_conversation(conversation).await?;
        self.conversation_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(&conversation.book_hash);
        Ok(())
    }

    /// Conversations for a book, most recently updated first.
    pub async fn conversations(&self, book_hash: &str) -> Result<Arc<Vec<Conversation>>> {
        if let Some(cached) = self
            .conversation_cache
            .read()
            .map_err(lock_poisoned)?
            .get(book_hash)
        {
            return Ok(cached.clone());
        }
        let loaded = Arc::new(self.backend.load_conversations(book_hash).await?);
        self.conversation_cache
            .write()
            .map_err(lock_poisoned)?
            .insert(book_hash.to_string(), loaded.clone());
        Ok(loaded)
    }

    pub async fn update_conversation_title(
        &self,
        book_hash: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.backend
            .update_conversation_title(book_hash, conversation_id, title, now)
            .await?;
        self.conversation_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(book_hash);
        Ok(())
    }

    /// Delete a conversation and all its messages.
    pub async fn delete_conversation(&self, book_hash: &str, conversation_id: &str) -> Result<()> {
        self.backend
            .delete_conversation(book_hash, conversation_id)
            .await?;
        self.conversation_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(book_hash);
        Ok(())
    }

    pub async fn save_message(&self, book_hash: &str, message: &Message) -> Result<()> {
        self.backend.save_message(book_hash, message).await
    }

    /// Messages for a conversation, oldest first.
    pub async fn messages(
        &self,
        book_hash: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>> {
        self.backend.load_messages(book_hash, conversation_id).await
    }

    // ---- lifecycle ----

    /// Drop everything the book owns and its cache entries.
    pub async fn clear_book_index(&self, book_hash: &str) -> Result<()> {
        self.backend.clear_book(book_hash).await?;
        self.chunk_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(book_hash);
        self.bm25_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(book_hash);
        self.meta_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(book_hash);
        self.conversation_cache
            .write()
            .map_err(lock_poisoned)?
            .remove(book_hash);
        info!(book = book_hash, "book index cleared");
        Ok(())
    }

    /// Close every backend handle and drop all caches. The next
    /// operation starts from a cold, consistent state.
    pub async fn recover_from_error(&self) -> Result<()> {
        warn!("recovering store: closing handles and dropping caches");
        self.backend.close_all().await?;
        self.chunk_cache.write().map_err(lock_poisoned)?.clear();
        self.bm25_cache.write().map_err(lock_poisoned)?.clear();
        self.meta_cache.write().map_err(lock_poisoned)?.clear();
        self.conversation_cache
            .write()
            .map_err(lock_poisoned)?
            .clear();
        Ok(())
    }
}

fn within_page_bound(chunk: &Chunk, max_page: Option<u32>) -> bool {
    match max_page {
        Some(max) => chunk.page_number <= max,
        None => true,
    }
}

fn sort_scored(scored: &mut [ScoredChunk]) {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
}

/// Divide each score by the list maximum, clamped to `[0, 1]`: a
/// non-positive maximum zeroes the whole list, and negative cosine
/// scores floor at zero rather than leaking below the interval.
fn normalize_by_max(scored: &[ScoredChunk]) -> Vec<f32> {
    let max = scored.iter().map(|s| s.score).fold(0.0f32, f32::max);
    if max <= 0.0 {
        return vec![0.0; scored.len()];
    }
    scored.iter().map(|s| (s.score / max).max(0.0)).collect()
}

/// Passage-level deduplication key: the first 100 characters of the
/// chunk text. Overlapping windows from vector and BM25 lists that
/// share a prefix collapse to one result.
fn dedup_key(text: &str) -> String {
    text.chars().take(100).collect()
}
