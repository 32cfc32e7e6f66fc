//! Chat orchestration contract.
//!
//! The reader-facing adapter drives one retrieval per chat request:
//!
//! 1. capture a [`RequestSnapshot`] of its configuration at request
//!    start, so later UI changes cannot affect the in-flight request;
//! 2. extract the text of the most recent user message;
//! 3. when the book is indexed, run page-context and hybrid search in
//!    parallel and merge them page-chunks-first, deduplicated by
//!    chunk id;
//! 4. publish the merged set as the process-wide **last sources**
//!    snapshot;
//! 5. hand prompt construction and token streaming to the
//!    [`ChatProvider`], forwarding the cancellation token.
//!
//! Cancellation unwinds silently; persistent errors propagate to the
//! adapter after clearing the last-sources slot.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::models::{Conversation, Message, MessageRole, ScoredChunk};
use crate::retriever::Retriever;
use crate::store::BookStore;

/// Adapter configuration captured at the moment a request starts.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub book_hash: String,
    pub book_title: String,
    pub author_name: String,
    pub current_page: u32,
    /// Per-request result limit; `None` uses the configured
    /// `retrieval.top_k`.
    pub top_k: Option<usize>,
}

/// A prompt turn handed to the chat provider. Unlike persisted
/// [`MessageRole`], the wire role includes `System`; system turns
/// exist only on the way to the provider and are never stored.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Streaming text completion seam.
///
/// Implementations MUST forward `cancel` into their transport so an
/// in-flight completion stops when the request is abandoned. Tokens
/// are delivered through `on_token` as they arrive; the returned
/// string is the full completion.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream_completion(
        &self,
        turns: &[ChatTurn],
        on_token: &(dyn for<'a> Fn(&'a str) + Send + Sync),
        cancel: &CancelToken,
    ) -> Result<String>;
}

/// Process-wide single-slot snapshot of the sources behind the most
/// recent answer.
///
/// Single-writer, many-reader: the orchestrator swaps the slot
/// atomically when a retrieval completes; readers poll
/// [`SourceSlot::last_sources`] and share the `Arc`. [`SourceSlot::clear`]
/// empties the slot until the next successful retrieval.
#[derive(Default)]
pub struct SourceSlot {
    inner: RwLock<Option<Arc<Vec<ScoredChunk>>>>,
}

impl SourceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, sources: Vec<ScoredChunk>) -> Arc<Vec<ScoredChunk>> {
        let shared = Arc::new(sources);
        if let Ok(mut slot) = self.inner.write() {
            *slot = Some(shared.clone());
        }
        shared
    }

    pub fn last_sources(&self) -> Option<Arc<Vec<ScoredChunk>>> {
        self.inner.read().ok().and_then(|slot| slot.clone())
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = None;
        }
    }
}

pub struct ChatOrchestrator {
    retriever: Arc<Retriever>,
    store: Arc<BookStore>,
    sources: SourceSlot,
}

impl ChatOrchestrator {
    pub fn new(retriever: Arc<Retriever>, store: Arc<BookStore>) -> Self {
        Self {
            retriever,
            store,
            sources: SourceSlot::new(),
        }
    }

    /// Text of the most recent user message, if any.
    pub fn latest_user_text(messages: &[Message]) -> Option<&str> {
        messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    /// Run the per-request retrieval: page context and hybrid search
    /// in parallel, merged page-chunks-first with chunk-id
    /// deduplication, bounded to the snapshot's current page.
    ///
    /// The merged set is published as the last sources. An
    /// un-indexed book yields an empty set and leaves the slot
    /// untouched. A persistent error clears the slot before
    /// propagating; cancellation propagates without logging.
    pub async fn retrieve_sources(
        &self,
        snapshot: &RequestSnapshot,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<Arc<Vec<ScoredChunk>>> {
        if !self.retriever.is_book_indexed(&snapshot.book_hash).await? {
            debug!(book = %snapshot.book_hash, "book not indexed, no sources");
            return Ok(Arc::new(Vec::new()));
        }

        let result = self.gather(snapshot, query, cancel).await;
        match result {
            Ok(merged) => {
                let shared = self.sources.publish(merged);
                debug!(
                    book = %snapshot.book_hash,
                    sources = shared.len(),
                    "published last sources"
                );
                Ok(shared)
            }
            Err(e) => {
                if !e.is_cancellation() {
                    self.sources.clear();
                }
                Err(e)
            }
        }
    }

    async fn gather(
        &self,
        snapshot: &RequestSnapshot,
        query: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredChunk>> {
        let (page_context, hybrid) = tokio::join!(
            self.retriever
                .page_context_chunks(&snapshot.book_hash, snapshot.current_page),
            self.retriever.hybrid_search(
                &snapshot.book_hash,
                query,
                snapshot.top_k,
                Some(snapshot.current_page),
                cancel,
            ),
        );
        let page_context = page_context?;
        let hybrid = hybrid?;

        let mut merged = Vec::with_capacity(page_context.len() + hybrid.len());
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for source in page_context.into_iter().chain(hybrid) {
            if seen.insert(source.chunk.id.clone()) {
                merged.push(source);
            }
        }
        Ok(merged)
    }

    pub fn last_sources(&self) -> Option<Arc<Vec<ScoredChunk>>> {
        self.sources.last_sources()
    }

    pub fn clear_last_sources(&self) {
        self.sources.clear();
    }

    // ---- conversation lifecycle ----

    /// Create a conversation on the first user message and persist
    /// that message. The title is derived from the message's opening
    /// words.
    pub async fn begin_conversation(
        &self,
        book_hash: &str,
        first_message: &str,
    ) -> Result<Conversation> {
        let now = Utc::now().timestamp_millis();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            book_hash: book_hash.to_string(),
            title: derive_title(first_message),
            created_at: now,
            updated_at: now,
        };
        self.store.save_conversation(&conversation).await?;
        self.store
            .save_message(
                book_hash,
                &Message {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: conversation.id.clone(),
                    role: MessageRole::User,
                    content: first_message.to_string(),
                    created_at: now,
                },
            )
            .await?;
        info!(book = book_hash, conversation = %conversation.id, "conversation started");
        Ok(conversation)
    }

    /// Append a message to an existing conversation, bumping the
    /// conversation's `updated_at`.
    pub async fn append_message(
        &self,
        book_hash: &str,
        conversation_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        let conversations = self.store.conversations(book_hash).await?;
        let conversation = conversations
            .iter()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| Error::Store(format!("conversation not found: {conversation_id}")))?;

        let now = Utc::now().timestamp_millis();
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        };
        self.store.save_message(book_hash, &message).await?;

        let mut bumped = conversation.clone();
        bumped.updated_at = now;
        self.store.save_conversation(&bumped).await?;

        Ok(message)
    }

    pub async fn conversations(&self, book_hash: &str) -> Result<Arc<Vec<Conversation>>> {
        self.store.conversations(book_hash).await
    }

    pub async fn conversation_messages(
        &self,
        book_hash: &str,
        conversation_id: &str,
    ) -> Result<Vec<Message>> {
        self.store.messages(book_hash, conversation_id).await
    }

    pub async fn rename_conversation(
        &self,
        book_hash: &str,
        conversation_id: &str,
        title: &str,
    ) -> Result<()> {
        self.store
            .update_conversation_title(book_hash, conversation_id, title)
            .await
    }

    pub async fn delete_conversation(&self, book_hash: &str, conversation_id: &str) -> Result<()> {
        self.store
            .delete_conversation(book_hash, conversation_id)
            .await
    }
}

/// Conversation title from the opening words of the first message.
fn derive_title(message: &str) -> String {
    let mut title: String = message.split_whitespace().take(6).collect::<Vec<_>>().join(" ");
    if title.chars().count() > 48 {
        title = title.chars().take(48).collect();
    }
    if title.is_empty() {
        title = "New conversation".to_string();
    }
    title
}
