//! Public search surface consumed by chat orchestration.
//!
//! Wraps the [`BookStore`] search primitives with query embedding
//! (retried, timed out, and optional: a provider failure downgrades
//! the query to BM25-only rather than failing it) and with the
//! page/section context lookups, whose results carry the fixed
//! [`CONTEXT_SCORE`] so they always outrank fused hybrid scores.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::RagSettings;
use crate::embedding::EmbeddingProvider;
use crate::error::Result;
use crate::models::{Chunk, ScoredChunk, SearchMethod, CONTEXT_SCORE};
use crate::retry::with_retry_and_timeout;
use crate::store::BookStore;

pub struct Retriever {
    store: Arc<BookStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    settings: RagSettings,
}

impl Retriever {
    pub fn new(
        store: Arc<BookStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        settings: RagSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
        }
    }

    pub async fn is_book_indexed(&self, book_hash: &str) -> Result<bool> {
        self.store.is_book_indexed(book_hash).await
    }

    /// Hybrid search over a book, bounded by `max_page` when the
    /// caller wants spoiler filtering. A `top_k` of `None` falls back
    /// to the configured `retrieval.top_k`.
    ///
    /// The query embedding is computed under the single-query timeout
    /// with retries; if it ultimately fails, the search proceeds
    /// BM25-only instead of erroring.
    pub async fn hybrid_search(
        &self,
        book_hash: &str,
        query: &str,
        top_k: Option<usize>,
        max_page: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredChunk>> {
        let top_k = top_k.unwrap_or(self.settings.retrieval.top_k);
        let query_embedding = self.query_embedding(query, cancel).await;

        self.store
            .hybrid_search(
                book_hash,
                query_embedding.as_deref(),
                query,
                &self.settings.retrieval,
                top_k,
                max_page,
            )
            .await
    }

    async fn query_embedding(&self, query: &str, cancel: &CancelToken) -> Option<Vec<f32>> {
        let provider = self.provider.as_ref()?;
        let outcome = with_retry_and_timeout(
            self.settings.timeouts.embedding_single(),
            &self.settings.retry,
            cancel,
            || provider.embed(query, cancel),
        )
        .await;

        match outcome {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!(error = %e, "query embedding failed, falling back to lexical search");
                None
            }
        }
    }

    /// All chunks anchored to `page_number`, tagged as context.
    pub async fn page_context_chunks(
        &self,
        book_hash: &str,
        page_number: u32,
    ) -> Result<Vec<ScoredChunk>> {
        let chunks = self.store.chunks_for_page(book_hash, page_number).await?;
        Ok(as_context(chunks))
    }

    /// All chunks of the section containing `page_number`: the
    /// section of the first chunk on that page, then every chunk of
    /// that section. Empty when the page has no chunks (for example
    /// a purely illustrative page).
    pub async fn chapter_context_chunks(
        &self,
        book_hash: &str,
        page_number: u32,
    ) -> Result<Vec<ScoredChunk>> {
        let on_page = self.store.chunks_for_page(book_hash, page_number).await?;
        let Some(first) = on_page.first() else {
            debug!(book = book_hash, page = page_number, "no chunks on page");
            return Ok(Vec::new());
        };

        let section = self
            .store
            .chunks_for_section(book_hash, first.section_index)
            .await?;
        Ok(as_context(section))
    }
}

fn as_context(chunks: Vec<Chunk>) -> Vec<ScoredChunk> {
    chunks
        .into_iter()
        .map(|chunk| ScoredChunk {
            chunk,
            score: CONTEXT_SCORE,
            method: SearchMethod::Context,
        })
        .collect()
}
