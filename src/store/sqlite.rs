//! SQLite-backed [`StoreBackend`].
//!
//! One database file per book, named `readest-ai-{book_hash}.sqlite`
//! in the configured data directory, so clearing a book removes its
//! files and cannot touch any other book. Pools are opened lazily
//! and cached; [`close_all`](StoreBackend::close_all) drops every
//! pool so the next operation reopens from a clean slate.
//!
//! Schema version 1:
//!
//! | Table | Key | Purpose |
//! |-------|-----|---------|
//! | `chunks` | `id`, indexed by `book_hash` | chunk rows, embedding as LE f32 BLOB |
//! | `book_meta` | `book_hash` | commit record |
//! | `bm25_indices` | `book_hash` | serialized lexical index |
//! | `conversations` | `id`, indexed by `book_hash` | chat threads |
//! | `messages` | `id`, indexed by `conversation_id` | chat messages |

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{BookIndexMeta, Chunk, Conversation, Message, MessageRole};

use super::backend::{blob_to_vec, vec_to_blob, StoreBackend};

const DB_PREFIX: &str = "readest-ai-";
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteBackend {
    data_dir: PathBuf,
    pools: tokio::sync::Mutex<HashMap<String, SqlitePool>>,
}

impl SqliteBackend {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    fn db_path(&self, book_hash: &str) -> PathBuf {
        self.data_dir.join(format!("{DB_PREFIX}{book_hash}.sqlite"))
    }

    async fn pool_for(&self, book_hash: &str) -> Result<SqlitePool> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(book_hash) {
            return Ok(pool.clone());
        }

        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| Error::Store(format!("cannot create data dir: {e}")))?;

        let path = self.db_path(book_hash);
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Error::Store(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        run_migrations(&pool).await?;
        debug!(book = book_hash, "opened book database");

        pools.insert(book_hash.to_string(), pool.clone());
        Ok(pool)
    }

    async fn remove_pool(&self, book_hash: &str) {
        let pool = self.pools.lock().await.remove(book_hash);
        if let Some(pool) = pool {
            pool.close().await;
        }
    }
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            book_hash TEXT NOT NULL,
            section_index INTEGER NOT NULL,
            chapter_title TEXT NOT NULL,
            page_number INTEGER NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS book_meta (
            book_hash TEXT PRIMARY KEY,
            book_title TEXT NOT NULL,
            author_name TEXT NOT NULL,
            total_sections INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            embedding_model TEXT NOT NULL,
            embedding_dims INTEGER,
            page_size_chars INTEGER NOT NULL,
            last_updated INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bm25_indices (
            book_hash TEXT PRIMARY KEY,
            payload TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            book_hash TEXT NOT NULL,
            title TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_book_hash ON chunks(book_hash)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_conversations_book_hash ON conversations(book_hash)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_messages_conversation_id ON messages(conversation_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(pool)
        .await?;

    Ok(())
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        book_hash: row.get("book_hash"),
        section_index: row.get::<i64, _>("section_index") as usize,
        chapter_title: row.get("chapter_title"),
        page_number: row.get::<i64, _>("page_number") as u32,
        text: row.get("text"),
        embedding: embedding.map(|blob| blob_to_vec(&blob)),
    }
}

#[async_trait]
impl StoreBackend for SqliteBackend {
    async fn save_chunks(&self, book_hash: &str, chunks: &[Chunk]) -> Result<()> {
        let pool = self.pool_for(book_hash).await?;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE book_hash = ?")
            .bind(book_hash)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let blob = chunk.embedding.as_ref().map(|v| vec_to_blob(v));
            sqlx::query(
                r#"
                INSERT INTO chunks (id, book_hash, section_index, chapter_title, page_number, text, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.book_hash)
            .bind(chunk.section_index as i64)
            .bind(&chunk.chapter_title)
            .bind(chunk.page_number as i64)
            .bind(&chunk.text)
            .bind(blob)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn load_chunks(&self, book_hash: &str) -> Result<Vec<Chunk>> {
        let pool = self.pool_for(book_hash).await?;
        let rows = sqlx::query(
            "SELECT id, book_hash, section_index, chapter_title, page_number, text, embedding
             FROM chunks WHERE book_hash = ? ORDER BY section_index, id",
        )
        .bind(book_hash)
        .fetch_all(&pool)
        .await?;

        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn save_meta(&self, meta: &BookIndexMeta) -> Result<()> {
        let pool = self.pool_for(&meta.book_hash).await?;
        sqlx::query(
            r#"
            INSERT INTO book_meta (book_hash, book_title, author_name, total_sections,
                                   total_chunks, embedding_model, embedding_dims,
                                   page_size_chars, last_updated)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(book_hash) DO UPDATE SET
                book_title = excluded.book_title,
                author_name = excluded.author_name,
                total_sections = excluded.total_sections,
                total_chunks = excluded.total_chunks,
                embedding_model = excluded.embedding_model,
                embedding_dims = excluded.embedding_dims,
                page_size_chars = excluded.page_size_chars,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&meta.book_hash)
        .bind(&meta.book_title)
        .bind(&meta.author_name)
        .bind(meta.total_sections as i64)
        .bind(meta.total_chunks as i64)
        .bind(&meta.embedding_model)
        .bind(meta.embedding_dims.map(|d| d as i64))
        .bind(meta.page_size_chars as i64)
        .bind(meta.last_updated)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn load_meta(&self, book_hash: &str) -> Result<Option<BookIndexMeta>> {
        let pool = self.pool_for(book_hash).await?;
        let row = sqlx::query(
            "SELECT book_hash, book_title, author_name, total_sections, total_chunks,
                    embedding_model, embedding_dims, page_size_chars, last_updated
             FROM book_meta WHERE book_hash = ?",
        )
        .bind(book_hash)
        .fetch_optional(&pool)
        .await?;

        Ok(row.map(|r| BookIndexMeta {
            book_hash: r.get("book_hash"),
            book_title: r.get("book_title"),
            author_name: r.get("author_name"),
            total_sections: r.get::<i64, _>("total_sections") as usize,
            total_chunks: r.get::<i64, _>("total_chunks") as usize,
            embedding_model: r.get("embedding_model"),
            embedding_dims: r
                .get::<Option<i64>, _>("embedding_dims")
                .map(|d| d as usize),
            page_size_chars: r.get::<i64, _>("page_size_chars") as usize,
            last_updated: r.get("last_updated"),
        }))
    }

    async fn save_bm25(&self, book_hash: &str, payload: &str) -> Result<()> {
        let pool = self.pool_for(book_hash).await?;
        sqlx::query(
            r#"
            INSERT INTO bm25_indices (book_hash, payload) VALUES (?, ?)
            ON CONFLICT(book_hash) DO UPDATE SET payload = excluded.payload
            "#,
        )
        .bind(book_hash)
        .bind(payload)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn load_bm25(&self, book_hash: &str) -> Result<Option<String>> {
        let pool = self.pool_for(book_hash).await?;
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM bm25_indices WHERE book_hash = ?")
                .bind(book_hash)
                .fetch_optional(&pool)
                .await?;
        Ok(payload)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let pool = self.pool_for(&conversation.book_hash).await?;
        sqlx::query(
            r#"
            INSERT INTO conversations (id, book_hash, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.book_hash)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn load_conversations(&self, book_hash: &str) -> Result<Vec<Conversation>> {
        let pool = self.pool_for(book_hash).await?;
        let rows = sqlx::query(
            "SELECT id, book_hash, title, created_at, updated_at
             FROM conversations WHERE book_hash = ? ORDER BY updated_at DESC",
        )
        .bind(book_hash)
        .fetch_all(&pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Conversation {
                id: r.get("id"),
                book_hash: r.get("book_hash"),
                title: r.get("title"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    async fn update_conversation_title(
        &self,
        book_hash: &str,
        conversation_id: &str,
        title: &str,
        updated_at: i64,
    ) -> Result<()> {
        let pool = self.pool_for(book_hash).await?;
        let mut tx = pool.begin().await?;

        let exists: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM conversations WHERE id = ?")
                .bind(conversation_id)
                .fetch_one(&mut *tx)
                .await?;
        if !exists {
            return Err(Error::Store(format!(
                "conversation not found: {conversation_id}"
            )));
        }

        sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(updated_at)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_conversation(&self, book_hash: &str, conversation_id: &str) -> Result<()> {
        let pool = self.pool_for(book_hash).await?;
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn save_message(&self, book_hash: &str, message: &Message) -> Result<()> {
        let pool = self.pool_for(book_hash).await?;
        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn load_messages(&self, book_hash: &str, conversation_id: &str) -> Result<Vec<Message>> {
        let pool = self.pool_for(book_hash).await?;
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(conversation_id)
        .fetch_all(&pool)
        .await?;

        rows.iter()
            .map(|r| {
                let role: String = r.get("role");
                let role = MessageRole::parse(&role)
                    .ok_or_else(|| Error::Store(format!("unknown message role: {role}")))?;
                Ok(Message {
                    id: r.get("id"),
                    conversation_id: r.get("conversation_id"),
                    role,
                    content: r.get("content"),
                    created_at: r.get("created_at"),
                })
            })
            .collect()
    }

    async fn clear_book(&self, book_hash: &str) -> Result<()> {
        self.remove_pool(book_hash).await;

        let path = self.db_path(book_hash);
        for suffix in ["", "-wal", "-shm"] {
            let file = PathBuf::from(format!("{}{}", path.display(), suffix));
            if file.exists() {
                std::fs::remove_file(&file)
                    .map_err(|e| Error::Store(format!("cannot remove {}: {e}", file.display())))?;
            }
        }

        info!(book = book_hash, "cleared book database");
        Ok(())
    }

    async fn close_all(&self) -> Result<()> {
        let pools: Vec<SqlitePool> = {
            let mut guard = self.pools.lock().await;
            guard.drain().map(|(_, pool)| pool).collect()
        };
        for pool in pools {
            pool.close().await;
        }
        Ok(())
    }
}
