//! End-to-end index build: chunk → embed → persist.
//!
//! One [`Indexer::index_book`] call drives the three reported phases:
//!
//! | phase | total | current |
//! |-------|-------|---------|
//! | `chunking` | section count | sections processed |
//! | `embedding` | chunk count | chunks with vectors |
//! | `indexing` | 2 | 0 chunks saved, 1 BM25 saved, 2 meta saved |
//!
//! The book counts as indexed only once its meta row is written;
//! chunks and the lexical index land first, so an error or a
//! cancellation mid-run leaves the book un-indexed and
//! [`Indexer::clear_book_index`] is the recovery path.
//!
//! Embedding failures other than cancellation degrade the run rather
//! than fail it: chunks and the BM25 index are persisted without
//! vectors so lexical search stays available.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::book::{chapter_title_for, BookDocument};
use crate::cancel::CancelToken;
use crate::chunker::chunk_section;
use crate::config::RagSettings;
use crate::embedding::EmbeddingProvider;
use crate::error::{Error, Result};
use crate::lexical::Bm25Index;
use crate::models::{
    BookIndexMeta, Chunk, IndexPhase, IndexingState, IndexingStatus, ProgressEvent,
    ProgressReporter,
};
use crate::retry::with_retry_and_timeout;
use crate::store::BookStore;

pub struct Indexer {
    store: Arc<BookStore>,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    settings: RagSettings,
    states: RwLock<HashMap<String, IndexingState>>,
}

impl Indexer {
    pub fn new(
        store: Arc<BookStore>,
        provider: Option<Arc<dyn EmbeddingProvider>>,
        settings: RagSettings,
    ) -> Self {
        Self {
            store,
            provider,
            settings,
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Current indexing state for a book, if a run was ever started.
    pub fn indexing_state(&self, book_hash: &str) -> Option<IndexingState> {
        self.states
            .read()
            .ok()
            .and_then(|states| states.get(book_hash).cloned())
    }

    /// Index a book end to end.
    ///
    /// Idempotent: an already-indexed book returns immediately, as
    /// does a book whose indexing run is still in flight. On
    /// cancellation the call fails with [`Error::IndexingAborted`]
    /// and partial persisted state may remain.
    pub async fn index_book(
        &self,
        book: &BookDocument,
        book_hash: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<()> {
        if self.store.is_book_indexed(book_hash).await? {
            debug!(book = book_hash, "already indexed, skipping");
            return Ok(());
        }

        {
            let mut states = self.states.write().map_err(|_| state_lock_error())?;
            if states
                .get(book_hash)
                .map(|s| s.status == IndexingStatus::Indexing)
                .unwrap_or(false)
            {
                debug!(book = book_hash, "indexing already in flight, skipping");
                return Ok(());
            }
            states.insert(book_hash.to_string(), IndexingState::started());
        }

        let result = self.run_pipeline(book, book_hash, reporter, cancel).await;

        match &result {
            Ok(()) => {
                self.update_state(book_hash, |s| {
                    s.status = IndexingStatus::Complete;
                    s.progress = 100;
                });
                info!(book = book_hash, "indexing complete");
            }
            Err(e) if e.is_cancellation() => {
                self.update_state(book_hash, |s| {
                    s.status = IndexingStatus::Error;
                    s.error = Some("indexing aborted".to_string());
                });
                debug!(book = book_hash, "indexing aborted");
            }
            Err(e) => {
                self.update_state(book_hash, |s| {
                    s.status = IndexingStatus::Error;
                    s.error = Some(e.to_string());
                });
                warn!(book = book_hash, error = %e, "indexing failed");
            }
        }

        result
    }

    async fn run_pipeline(
        &self,
        book: &BookDocument,
        book_hash: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut chunks = self.chunk_phase(book, book_hash, reporter, cancel)?;

        if chunks.is_empty() {
            reporter.report(ProgressEvent {
                current: 0,
                total: 0,
                phase: IndexPhase::Embedding,
            });
            warn!(book = book_hash, "no chunks produced, nothing to index");
            return Ok(());
        }

        self.update_state(book_hash, |s| s.total_chunks = chunks.len());
        self.embed_phase(&mut chunks, book_hash, reporter, cancel)
            .await?;
        self.persist_phase(book, book_hash, chunks, reporter, cancel)
            .await
    }

    fn chunk_phase(
        &self,
        book: &BookDocument,
        book_hash: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<Vec<Chunk>> {
        let total_sections = book.sections.len();
        let config = &self.settings.chunking;
        let mut chunks = Vec::new();
        let mut cumulative_offset = 0usize;

        reporter.report(ProgressEvent {
            current: 0,
            total: total_sections,
            phase: IndexPhase::Chunking,
        });

        for (section_index, section) in book.sections.iter().enumerate() {
            cancel.check()?;

            match section.create_document() {
                Ok(node) => {
                    let text = node.visible_text();
                    let char_count = text.chars().count();
                    if char_count >= config.min_section_chars {
                        let chapter_title = chapter_title_for(&book.toc, section_index);
                        chunks.extend(chunk_section(
                            &text,
                            book_hash,
                            section_index,
                            &chapter_title,
                            cumulative_offset,
                            config,
                        ));
                    } else {
                        debug!(
                            section = section_index,
                            chars = char_count,
                            "skipping short section"
                        );
                    }
                    cumulative_offset += char_count;
                }
                Err(e) => {
                    warn!(section = section_index, error = %e, "skipping malformed section");
                    cumulative_offset += section.size;
                }
            }

            reporter.report(ProgressEvent {
                current: section_index + 1,
                total: total_sections,
                phase: IndexPhase::Chunking,
            });
            let progress = (20 * (section_index + 1) / total_sections.max(1)) as u8;
            self.update_state(book_hash, |s| s.progress = progress);
        }

        debug!(
            book = book_hash,
            chunks = chunks.len(),
            "chunking complete"
        );
        Ok(chunks)
    }

    /// Embed chunk texts in batches. A permanent provider failure
    /// (other than cancellation) leaves the chunks vector-less and
    /// lets the run continue lexical-only.
    async fn embed_phase(
        &self,
        chunks: &mut [Chunk],
        book_hash: &str,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<()> {
        let total = chunks.len();
        reporter.report(ProgressEvent {
            current: 0,
            total,
            phase: IndexPhase::Embedding,
        });

        let Some(provider) = &self.provider else {
            warn!(book = book_hash, "no embedding provider, indexing lexical-only");
            return Ok(());
        };

        let batch_size = self.settings.embedding.batch_size.max(1);
        let mut embedded = 0usize;
        // Start from the provider's declared dimension when it has
        // one; otherwise learn it from the first returned vector.
        let mut expected_dims: Option<usize> = provider.dims();
        let mut degrade_reason: Option<String> = None;

        'batches: for batch in chunks.chunks_mut(batch_size) {
            cancel.check()?;

            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let outcome = with_retry_and_timeout(
                self.settings.timeouts.embedding_batch(),
                &self.settings.retry,
                cancel,
                || provider.embed_many(&texts, cancel),
            )
            .await;

            let vectors = match outcome {
                Ok(vectors) => vectors,
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    degrade_reason = Some(e.to_string());
                    break 'batches;
                }
            };

            if vectors.len() != batch.len() {
                degrade_reason = Some(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                ));
                break 'batches;
            }

            for (chunk, vector) in batch.iter_mut().zip(vectors) {
                match expected_dims {
                    None => expected_dims = Some(vector.len()),
                    Some(dims) if dims != vector.len() => {
                        degrade_reason = Some(format!(
                            "expected {dims}-dimension vectors, got {}",
                            vector.len()
                        ));
                        break 'batches;
                    }
                    Some(_) => {}
                }
                chunk.embedding = Some(vector);
            }

            embedded += batch.len();
            reporter.report(ProgressEvent {
                current: embedded,
                total,
                phase: IndexPhase::Embedding,
            });
            let progress = (20 + 70 * embedded / total.max(1)) as u8;
            self.update_state(book_hash, |s| {
                s.chunks_processed = embedded;
                s.progress = progress;
            });
        }

        if let Some(reason) = degrade_reason {
            warn!(
                book = book_hash,
                reason = %reason,
                "embedding failed permanently, degrading to lexical-only index"
            );
            strip_embeddings(chunks);
            return Ok(());
        }

        debug!(book = book_hash, embedded, "embedding complete");
        Ok(())
    }

    /// Persist in commit order: chunks, lexical index, then meta.
    /// Meta is the commit record; a failure before it leaves the book
    /// un-indexed.
    async fn persist_phase(
        &self,
        book: &BookDocument,
        book_hash: &str,
        chunks: Vec<Chunk>,
        reporter: &dyn ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<()> {
        let total_chunks = chunks.len();
        let embedding_dims = chunks.iter().find_map(|c| c.embedding.as_ref().map(Vec::len));

        cancel.check()?;
        let index = Bm25Index::build(
            chunks
                .iter()
                .map(|c| (c.id.as_str(), c.text.as_str(), c.chapter_title.as_str())),
        );
        self.store.save_chunks(book_hash, chunks).await?;
        reporter.report(ProgressEvent {
            current: 0,
            total: 2,
            phase: IndexPhase::Indexing,
        });
        self.update_state(book_hash, |s| s.progress = 92);

        cancel.check()?;
        self.store.save_bm25_index(book_hash, index).await?;
        reporter.report(ProgressEvent {
            current: 1,
            total: 2,
            phase: IndexPhase::Indexing,
        });
        self.update_state(book_hash, |s| s.progress = 96);

        cancel.check()?;
        let meta = BookIndexMeta {
            book_hash: book_hash.to_string(),
            book_title: book.metadata.title.preferred().to_string(),
            author_name: book.metadata.author.preferred().to_string(),
            total_sections: book.sections.len(),
            total_chunks,
            embedding_model: self
                .provider
                .as_ref()
                .map(|p| p.model_name().to_string())
                .unwrap_or_else(|| "none".to_string()),
            embedding_dims,
            page_size_chars: self.settings.chunking.page_size_chars,
            last_updated: Utc::now().timestamp(),
        };
        self.store.save_meta(&meta).await?;
        reporter.report(ProgressEvent {
            current: 2,
            total: 2,
            phase: IndexPhase::Indexing,
        });

        Ok(())
    }

    /// Drop the book's persisted state and its indexing state entry.
    pub async fn clear_book_index(&self, book_hash: &str) -> Result<()> {
        self.store.clear_book_index(book_hash).await?;
        if let Ok(mut states) = self.states.write() {
            states.remove(book_hash);
        }
        Ok(())
    }

    fn update_state(&self, book_hash: &str, apply: impl FnOnce(&mut IndexingState)) {
        if let Ok(mut states) = self.states.write() {
            if let Some(state) = states.get_mut(book_hash) {
                apply(state);
            }
        }
    }
}

fn strip_embeddings(chunks: &mut [Chunk]) {
    for chunk in chunks {
        chunk.embedding = None;
    }
}

fn state_lock_error() -> Error {
    Error::Store("indexer state lock poisoned".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookMetadata, Section, SectionNode};
    use crate::embedding::HashEmbedder;
    use crate::models::NoProgress;
    use crate::store::MemoryBackend;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CollectingReporter {
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl CollectingReporter {
        fn new() -> Self {
            Self {
                events: Mutex::new(Vec::new()),
            }
        }
        fn events(&self) -> Vec<ProgressEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressReporter for CollectingReporter {
        fn report(&self, event: ProgressEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Provider that always fails with a retryable transport error.
    struct OutageProvider;

    #[async_trait]
    impl EmbeddingProvider for OutageProvider {
        fn model_name(&self) -> &str {
            "outage"
        }
        fn dims(&self) -> Option<usize> {
            Some(4)
        }
        async fn embed(&self, _text: &str, _cancel: &CancelToken) -> Result<Vec<f32>> {
            Err(Error::Embedding("http 500: down".into()))
        }
        async fn embed_many(
            &self,
            _texts: &[String],
            _cancel: &CancelToken,
        ) -> Result<Vec<Vec<f32>>> {
            Err(Error::Embedding("http 500: down".into()))
        }
        async fn health_check(&self, _cancel: &CancelToken) -> Result<bool> {
            Ok(false)
        }
    }

    /// Provider that cancels the shared token on its first call, then
    /// waits for cancellation to land.
    struct SelfCancellingProvider {
        token: CancelToken,
    }

    #[async_trait]
    impl EmbeddingProvider for SelfCancellingProvider {
        fn model_name(&self) -> &str {
            "self-cancelling"
        }
        fn dims(&self) -> Option<usize> {
            Some(4)
        }
        async fn embed(&self, _text: &str, _cancel: &CancelToken) -> Result<Vec<f32>> {
            Err(Error::IndexingAborted)
        }
        async fn embed_many(
            &self,
            _texts: &[String],
            _cancel: &CancelToken,
        ) -> Result<Vec<Vec<f32>>> {
            self.token.cancel();
            Err(Error::IndexingAborted)
        }
        async fn health_check(&self, _cancel: &CancelToken) -> Result<bool> {
            Ok(true)
        }
    }

    fn long_text(sentences: usize) -> String {
        (0..sentences)
            .map(|i| format!("This is sentence number {i} of the section body."))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn sample_book(sections: usize) -> BookDocument {
        BookDocument {
            metadata: BookMetadata {
                title: "Sample".into(),
                author: "Author".into(),
            },
            toc: vec![],
            sections: (0..sections)
                .map(|_| {
                    Section::from_node(SectionNode::element(
                        "body",
                        vec![SectionNode::element(
                            "p",
                            vec![SectionNode::text(&long_text(30))],
                        )],
                    ))
                })
                .collect(),
        }
    }

    fn fast_settings() -> RagSettings {
        let mut settings = RagSettings::default();
        settings.retry.initial_delay_ms = 1;
        settings.retry.max_delay_ms = 2;
        settings
    }

    fn indexer_with(provider: Option<Arc<dyn EmbeddingProvider>>) -> Indexer {
        let store = Arc::new(BookStore::new(Arc::new(MemoryBackend::new())));
        Indexer::new(store, provider, fast_settings())
    }

    #[tokio::test]
    async fn full_run_writes_meta_last_and_completes() {
        let indexer = indexer_with(Some(Arc::new(HashEmbedder::new(4))));
        let reporter = CollectingReporter::new();
        let cancel = CancelToken::new();

        indexer
            .index_book(&sample_book(3), "bk", &reporter, &cancel)
            .await
            .unwrap();

        let meta = indexer.store.meta("bk").await.unwrap().unwrap();
        assert!(meta.total_chunks > 0);
        assert_eq!(meta.total_sections, 3);
        assert_eq!(meta.embedding_model, "hash-embedder");
        assert_eq!(meta.embedding_dims, Some(4));
        assert_eq!(
            meta.total_chunks,
            indexer.store.chunks("bk").await.unwrap().len()
        );

        let state = indexer.indexing_state("bk").unwrap();
        assert_eq!(state.status, IndexingStatus::Complete);
        assert_eq!(state.progress, 100);

        let events = reporter.events();
        let phases: Vec<IndexPhase> = events.iter().map(|e| e.phase).collect();
        let first_embedding = phases
            .iter()
            .position(|p| *p == IndexPhase::Embedding)
            .unwrap();
        let first_indexing = phases
            .iter()
            .position(|p| *p == IndexPhase::Indexing)
            .unwrap();
        assert!(first_embedding > 0);
        assert!(first_indexing > first_embedding);

        let indexing_events: Vec<usize> = events
            .iter()
            .filter(|e| e.phase == IndexPhase::Indexing)
            .map(|e| e.current)
            .collect();
        assert_eq!(indexing_events, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let indexer = indexer_with(Some(Arc::new(HashEmbedder::new(4))));
        let cancel = CancelToken::new();

        indexer
            .index_book(&sample_book(2), "bk", &NoProgress, &cancel)
            .await
            .unwrap();
        let first = indexer.store.meta("bk").await.unwrap().unwrap();

        let reporter = CollectingReporter::new();
        indexer
            .index_book(&sample_book(2), "bk", &reporter, &cancel)
            .await
            .unwrap();

        // No phases run on the second call, and meta is untouched.
        assert!(reporter.events().is_empty());
        let second = indexer.store.meta("bk").await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_book_completes_without_writes() {
        let indexer = indexer_with(Some(Arc::new(HashEmbedder::new(4))));
        let book = BookDocument {
            metadata: BookMetadata {
                title: "Empty".into(),
                author: "Nobody".into(),
            },
            toc: vec![],
            sections: vec![Section::from_node(SectionNode::element(
                "body",
                vec![SectionNode::text("Too short.")],
            ))],
        };

        indexer
            .index_book(&book, "bk", &NoProgress, &CancelToken::new())
            .await
            .unwrap();

        assert!(!indexer.store.is_book_indexed("bk").await.unwrap());
        assert!(indexer.store.meta("bk").await.unwrap().is_none());
        let state = indexer.indexing_state("bk").unwrap();
        assert_eq!(state.status, IndexingStatus::Complete);
    }

    #[tokio::test]
    async fn embedding_outage_degrades_to_lexical_only() {
        let indexer = indexer_with(Some(Arc::new(OutageProvider)));
        let cancel = CancelToken::new();

        indexer
            .index_book(&sample_book(2), "bk", &NoProgress, &cancel)
            .await
            .unwrap();

        assert!(indexer.store.is_book_indexed("bk").await.unwrap());
        let chunks = indexer.store.chunks("bk").await.unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_none()));

        // Lexical search works; vector search has nothing to scan.
        let lexical = indexer
            .store
            .bm25_search("bk", "sentence", 5, None)
            .await
            .unwrap();
        assert!(!lexical.is_empty());
        let vector = indexer
            .store
            .vector_search("bk", &[1.0, 0.0, 0.0, 0.0], 5, None)
            .await
            .unwrap();
        assert!(vector.is_empty());
    }

    /// Provider whose declared dimension disagrees with the vectors
    /// it actually returns.
    struct MiswiredProvider;

    #[async_trait]
    impl EmbeddingProvider for MiswiredProvider {
        fn model_name(&self) -> &str {
            "miswired"
        }
        fn dims(&self) -> Option<usize> {
            Some(8)
        }
        async fn embed(&self, _text: &str, _cancel: &CancelToken) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        async fn embed_many(
            &self,
            texts: &[String],
            _cancel: &CancelToken,
        ) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
        async fn health_check(&self, _cancel: &CancelToken) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn declared_dims_mismatch_degrades_to_lexical_only() {
        let indexer = indexer_with(Some(Arc::new(MiswiredProvider)));

        indexer
            .index_book(&sample_book(2), "bk", &NoProgress, &CancelToken::new())
            .await
            .unwrap();

        // The 3-dimension vectors never survive against the declared 8.
        assert!(indexer.store.is_book_indexed("bk").await.unwrap());
        let chunks = indexer.store.chunks("bk").await.unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_none()));
        assert!(indexer
            .store
            .meta("bk")
            .await
            .unwrap()
            .unwrap()
            .embedding_dims
            .is_none());
    }

    #[tokio::test]
    async fn cancellation_mid_embedding_aborts_and_allows_retry() {
        let cancel = CancelToken::new();
        let provider = Arc::new(SelfCancellingProvider {
            token: cancel.clone(),
        });
        let store = Arc::new(BookStore::new(Arc::new(MemoryBackend::new())));
        let indexer = Indexer::new(store.clone(), Some(provider), fast_settings());

        let result = indexer
            .index_book(&sample_book(2), "bk", &NoProgress, &cancel)
            .await;
        assert!(matches!(result, Err(Error::IndexingAborted)));
        assert!(!store.is_book_indexed("bk").await.unwrap());
        assert_eq!(
            indexer.indexing_state("bk").unwrap().status,
            IndexingStatus::Error
        );

        // A fresh run on the same book proceeds normally.
        let retry_indexer = Indexer::new(
            store.clone(),
            Some(Arc::new(HashEmbedder::new(4))),
            fast_settings(),
        );
        retry_indexer
            .index_book(&sample_book(2), "bk", &NoProgress, &CancelToken::new())
            .await
            .unwrap();
        assert!(store.is_book_indexed("bk").await.unwrap());
    }

    #[tokio::test]
    async fn pre_cancelled_token_rejects_immediately() {
        let indexer = indexer_with(Some(Arc::new(HashEmbedder::new(4))));
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = indexer
            .index_book(&sample_book(1), "bk", &NoProgress, &cancel)
            .await;
        assert!(matches!(result, Err(Error::IndexingAborted)));
        assert!(!indexer.store.is_book_indexed("bk").await.unwrap());
    }

    #[tokio::test]
    async fn clear_book_index_allows_reindex() {
        let indexer = indexer_with(Some(Arc::new(HashEmbedder::new(4))));
        let cancel = CancelToken::new();

        indexer
            .index_book(&sample_book(1), "bk", &NoProgress, &cancel)
            .await
            .unwrap();
        assert!(indexer.store.is_book_indexed("bk").await.unwrap());

        indexer.clear_book_index("bk").await.unwrap();
        assert!(!indexer.store.is_book_indexed("bk").await.unwrap());
        assert!(indexer.indexing_state("bk").is_none());

        indexer
            .index_book(&sample_book(1), "bk", &NoProgress, &cancel)
            .await
            .unwrap();
        assert!(indexer.store.is_book_indexed("bk").await.unwrap());
    }
}
