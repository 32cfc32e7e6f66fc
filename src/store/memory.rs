//! In-memory [`StoreBackend`] for tests and embedded hosts.
//!
//! Per-book namespaces live in a `HashMap` behind `std::sync::RwLock`.
//! Behavior matches the SQLite backend operation for operation,
//! including the delete-conversation cascade.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::models::{BookIndexMeta, Chunk, Conversation, Message};

use super::backend::StoreBackend;

#[derive(Default)]
struct BookSpace {
    chunks: Vec<Chunk>,
    meta: Option<BookIndexMeta>,
    bm25: Option<String>,
    conversations: HashMap<String, Conversation>,
    messages: Vec<Message>,
}

#[derive(Default)]
pub struct MemoryBackend {
    books: RwLock<HashMap<String, BookSpace>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_poisoned<T>(_: T) -> Error {
    Error::Store("memory backend lock poisoned".into())
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn save_chunks(&self, book_hash: &str, chunks: &[Chunk]) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        books.entry(book_hash.to_string()).or_default().chunks = chunks.to_vec();
        Ok(())
    }

    async fn load_chunks(&self, book_hash: &str) -> Result<Vec<Chunk>> {
        let books = self.books.read().map_err(lock_poisoned)?;
        Ok(books
            .get(book_hash)
            .map(|space| space.chunks.clone())
            .unwrap_or_default())
    }

    async fn save_meta(&self, meta: &BookIndexMeta) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        books.entry(meta.book_hash.clone()).or_default().meta = Some(meta.clone());
        Ok(())
    }

    async fn load_meta(&self, book_hash: &str) -> Result<Option<BookIndexMeta>> {
        let books = self.books.read().map_err(lock_poisoned)?;
        Ok(books.get(book_hash).and_then(|space| space.meta.clone()))
    }

    async fn save_bm25(&self, book_hash: &str, payload: &str) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        books.entry(book_hash.to_string()).or_default().bm25 = Some(payload.to_string());
        Ok(())
    }

    async fn load_bm25(&self, book_hash: &str) -> Result<Option<String>> {
        let books = self.books.read().map_err(lock_poisoned)?;
        Ok(books.get(book_hash).and_then(|space| space.bm25.clone()))
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        books
            .entry(conversation.book_hash.clone())
            .or_default()
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn load_conversations(&self, book_hash: &str) -> Result<Vec<Conversation>> {
        let books = self.books.read().map_err(lock_poisoned)?;
        let mut conversations: Vec<Conversation> = books
            .get(book_hash)
            .map(|space| space.conversations.values().cloned().collect())
            .unwrap_or_default();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn update_conversation_title(
        &self,
        book_hash: &str,
        conversation_id: &str,
        title: &str,
        updated_at: i64,
    ) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        let conversation = books
            .get_mut(book_hash)
            .and_then(|space| space.conversations.get_mut(conversation_id))
            .ok_or_else(|| Error::Store(format!("conversation not found: {conversation_id}")))?;
        conversation.title = title.to_string();
        conversation.updated_at = updated_at;
        Ok(())
    }

    async fn delete_conversation(&self, book_hash: &str, conversation_id: &str) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        if let Some(space) = books.get_mut(book_hash) {
            space.conversations.remove(conversation_id);
            space
                .messages
                .retain(|m| m.conversation_id != conversation_id);
        }
        Ok(())
    }

    async fn save_message(&self, book_hash: &str, message: &Message) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        books
            .entry(book_hash.to_string())
            .or_default()
            .messages
            .push(message.clone());
        Ok(())
    }

    async fn load_messages(&self, book_hash: &str, conversation_id: &str) -> Result<Vec<Message>> {
        let books = self.books.read().map_err(lock_poisoned)?;
        let mut messages: Vec<Message> = books
            .get(book_hash)
            .map(|space| {
                space
                    .messages
                    .iter()
                    .filter(|m| m.conversation_id == conversation_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Stable sort: same-timestamp messages keep insertion order.
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn clear_book(&self, book_hash: &str) -> Result<()> {
        let mut books = self.books.write().map_err(lock_poisoned)?;
        books.remove(book_hash);
        Ok(())
    }

    async fn close_all(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRole;

    fn conversation(id: &str, book: &str, updated_at: i64) -> Conversation {
        Conversation {
            id: id.to_string(),
            book_hash: book.to_string(),
            title: "Untitled".to_string(),
            created_at: updated_at,
            updated_at,
        }
    }

    fn message(id: &str, conversation_id: &str, created_at: i64) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            role: MessageRole::User,
            content: "hello".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn conversations_sort_by_recency() {
        let backend = MemoryBackend::new();
        backend
            .save_conversation(&conversation("c1", "b", 100))
            .await
            .unwrap();
        backend
            .save_conversation(&conversation("c2", "b", 300))
            .await
            .unwrap();
        backend
            .save_conversation(&conversation("c3", "b", 200))
            .await
            .unwrap();

        let loaded = backend.load_conversations("b").await.unwrap();
        let ids: Vec<&str> = loaded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c1"]);
    }

    #[tokio::test]
    async fn delete_conversation_cascades_to_messages() {
        let backend = MemoryBackend::new();
        backend
            .save_conversation(&conversation("c1", "b", 1))
            .await
            .unwrap();
        backend.save_message("b", &message("m1", "c1", 1)).await.unwrap();
        backend.save_message("b", &message("m2", "c1", 2)).await.unwrap();

        backend.delete_conversation("b", "c1").await.unwrap();

        assert!(backend.load_conversations("b").await.unwrap().is_empty());
        assert!(backend.load_messages("b", "c1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn books_are_isolated() {
        let backend = MemoryBackend::new();
        backend
            .save_bm25("book-a", "payload-a")
            .await
            .unwrap();
        backend
            .save_bm25("book-b", "payload-b")
            .await
            .unwrap();

        backend.clear_book("book-a").await.unwrap();

        assert!(backend.load_bm25("book-a").await.unwrap().is_none());
        assert_eq!(
            backend.load_bm25("book-b").await.unwrap().as_deref(),
            Some("payload-b")
        );
    }

    #[tokio::test]
    async fn title_update_bumps_updated_at() {
        let backend = MemoryBackend::new();
        backend
            .save_conversation(&conversation("c1", "b", 100))
            .await
            .unwrap();
        backend
            .update_conversation_title("b", "c1", "Renamed", 500)
            .await
            .unwrap();

        let loaded = backend.load_conversations("b").await.unwrap();
        assert_eq!(loaded[0].title, "Renamed");
        assert_eq!(loaded[0].updated_at, 500);
        assert_eq!(loaded[0].created_at, 100);
    }

    #[tokio::test]
    async fn missing_conversation_title_update_errors() {
        let backend = MemoryBackend::new();
        let result = backend
            .update_conversation_title("b", "ghost", "X", 1)
            .await;
        assert!(matches!(result, Err(Error::Store(_))));
    }
}
