//! # readest-rag
//!
//! **Per-book retrieval engine for an in-reader AI assistant.**
//!
//! The engine accepts a structured book document, builds a searchable
//! index of its text (dense vectors + lexical BM25), and answers
//! retrieval queries by fusing both signals into one ranked list of
//! passages, with page-bound spoiler filtering and explicit
//! page/section context retrieval. A chat adapter consumes the ranked
//! passages to build a grounded prompt; prompt text and token
//! streaming stay outside this crate.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌───────────────────┐
//! │ BookDocument │──▶│  Indexer     │──▶│  BookStore         │
//! │ sections/TOC │   │ chunk→embed │   │ SQLite per book    │
//! └──────────────┘   │ →persist    │   │ chunks·BM25·meta   │
//!                    └─────────────┘   └─────────┬─────────┘
//!                                                │
//!                                      ┌─────────▼─────────┐
//!                                      │    Retriever       │
//!                                      │ vector ∥ BM25 →    │
//!                                      │ hybrid fusion      │
//!                                      └─────────┬─────────┘
//!                                                │
//!                                      ┌─────────▼─────────┐
//!                                      │ ChatOrchestrator   │
//!                                      │ snapshot · sources │
//!                                      └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`book`] | Book document model: sections, TOC, localized metadata, visible-text extraction |
//! | [`chunker`] | Overlapping page-anchored windows with deterministic ids |
//! | [`indexer`] | chunk → embed → persist pipeline with progress, cancellation, retry, and lexical-only degradation |
//! | [`store`] | Storage capability interface, SQLite and in-memory backends, warm caches, vector/BM25/hybrid search |
//! | [`lexical`] | Serializable BM25 index (no stemming) |
//! | [`embedding`] | Provider trait, OpenAI-compatible transport, deterministic offline embedder |
//! | [`retriever`] | Public search surface: hybrid search and page/chapter context |
//! | [`chat`] | Orchestration contract: request snapshot, source merge, last-sources slot, conversations |
//! | [`retry`] | Per-attempt timeout + jittered exponential backoff |
//! | [`cancel`] | Cooperative cancellation token |
//! | [`config`] | Settings with validation |
//! | [`error`] | Typed error kinds |
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use readest_rag::{
//!     BookStore, CancelToken, HashEmbedder, Indexer, MemoryBackend, NoProgress,
//!     RagSettings, Retriever,
//! };
//! # use readest_rag::book::BookDocument;
//! # async fn run(book: BookDocument) -> readest_rag::Result<()> {
//! let settings = RagSettings::default();
//! let store = Arc::new(BookStore::new(Arc::new(MemoryBackend::new())));
//! let provider = Arc::new(HashEmbedder::new(256));
//!
//! let indexer = Indexer::new(store.clone(), Some(provider.clone()), settings.clone());
//! indexer
//!     .index_book(&book, "book-hash", &NoProgress, &CancelToken::new())
//!     .await?;
//!
//! let retriever = Retriever::new(store, Some(provider), settings);
//! let passages = retriever
//!     .hybrid_search("book-hash", "why does the captain turn back?", None, Some(42), &CancelToken::new())
//!     .await?;
//! for p in &passages {
//!     println!("[{:.3}] p.{} {}", p.score, p.chunk.page_number, p.chunk.chapter_title);
//! }
//! # Ok(())
//! # }
//! ```

pub mod book;
pub mod cancel;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod lexical;
pub mod models;
pub mod retriever;
pub mod retry;
pub mod store;

pub use cancel::CancelToken;
pub use chat::{ChatOrchestrator, ChatProvider, RequestSnapshot, SourceSlot};
pub use config::{load_settings, RagSettings};
pub use embedding::{create_provider, EmbeddingProvider, HashEmbedder, OpenAiCompatProvider};
pub use error::{Error, Result};
pub use indexer::Indexer;
pub use lexical::Bm25Index;
pub use models::{
    BookIndexMeta, Chunk, Conversation, IndexPhase, IndexingState, IndexingStatus, Message,
    MessageRole, NoProgress, ProgressEvent, ProgressReporter, ScoredChunk, SearchMethod,
    CONTEXT_SCORE,
};
pub use retriever::Retriever;
pub use store::{BookStore, MemoryBackend, SqliteBackend, StoreBackend};
