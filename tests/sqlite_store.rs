//! Persistence paths over the SQLite backend: per-book database
//! files, round-trips for every object kind, cascade deletion, and
//! cache recovery after closing handles.

use std::sync::Arc;

use tempfile::TempDir;

use readest_rag::lexical::Bm25Index;
use readest_rag::{
    BookIndexMeta, BookStore, Chunk, Conversation, Message, MessageRole, SqliteBackend,
    StoreBackend,
};

fn chunk(id: &str, page: u32, text: &str, embedding: Option<Vec<f32>>) -> Chunk {
    Chunk {
        id: id.to_string(),
        book_hash: "alpha".to_string(),
        section_index: 0,
        chapter_title: "Opening".to_string(),
        page_number: page,
        text: text.to_string(),
        embedding,
    }
}

fn meta_for(book_hash: &str, total_chunks: usize) -> BookIndexMeta {
    BookIndexMeta {
        book_hash: book_hash.to_string(),
        book_title: "A Book".to_string(),
        author_name: "Someone".to_string(),
        total_sections: 1,
        total_chunks,
        embedding_model: "hash-embedder".to_string(),
        embedding_dims: Some(3),
        page_size_chars: 1000,
        last_updated: 1_700_000_000,
    }
}

#[tokio::test]
async fn chunks_round_trip_with_embeddings() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());

    let chunks = vec![
        chunk("c1", 0, "first passage of text", Some(vec![0.5, -0.25, 1.0])),
        chunk("c2", 1, "second passage of text", None),
    ];
    backend.save_chunks("alpha", &chunks).await.unwrap();

    let loaded = backend.load_chunks("alpha").await.unwrap();
    assert_eq!(loaded.len(), 2);
    let c1 = loaded.iter().find(|c| c.id == "c1").unwrap();
    assert_eq!(c1.embedding, Some(vec![0.5, -0.25, 1.0]));
    assert_eq!(c1.chapter_title, "Opening");
    let c2 = loaded.iter().find(|c| c.id == "c2").unwrap();
    assert!(c2.embedding.is_none());
}

#[tokio::test]
async fn save_chunks_replaces_prior_set() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());

    backend
        .save_chunks("alpha", &[chunk("old", 0, "stale", None)])
        .await
        .unwrap();
    backend
        .save_chunks("alpha", &[chunk("new", 0, "fresh", None)])
        .await
        .unwrap();

    let loaded = backend.load_chunks("alpha").await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, "new");
}

#[tokio::test]
async fn meta_and_bm25_round_trip() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());

    assert!(backend.load_meta("alpha").await.unwrap().is_none());
    backend.save_meta(&meta_for("alpha", 7)).await.unwrap();
    let loaded = backend.load_meta("alpha").await.unwrap().unwrap();
    assert_eq!(loaded, meta_for("alpha", 7));

    let index = Bm25Index::build(vec![("c1", "some indexed words", "Opening")]);
    let payload = index.to_json().unwrap();
    backend.save_bm25("alpha", &payload).await.unwrap();
    let stored = backend.load_bm25("alpha").await.unwrap().unwrap();
    let restored = Bm25Index::from_json(&stored).unwrap();
    assert_eq!(restored.doc_count(), 1);
}

#[tokio::test]
async fn database_file_is_per_book_and_clear_removes_it() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());

    backend.save_meta(&meta_for("alpha", 1)).await.unwrap();
    backend.save_meta(&meta_for("beta", 2)).await.unwrap();

    let alpha_db = tmp.path().join("readest-ai-alpha.sqlite");
    let beta_db = tmp.path().join("readest-ai-beta.sqlite");
    assert!(alpha_db.exists());
    assert!(beta_db.exists());

    backend.clear_book("alpha").await.unwrap();
    assert!(!alpha_db.exists());
    assert!(beta_db.exists());

    assert!(backend.load_meta("alpha").await.unwrap().is_none());
    assert_eq!(
        backend.load_meta("beta").await.unwrap().unwrap().total_chunks,
        2
    );
}

#[tokio::test]
async fn conversations_and_messages_cascade() {
    let tmp = TempDir::new().unwrap();
    let backend = SqliteBackend::new(tmp.path());

    let conversation = Conversation {
        id: "conv-1".to_string(),
        book_hash: "alpha".to_string(),
        title: "About the opening".to_string(),
        created_at: 1000,
        updated_at: 1000,
    };
    backend.save_conversation(&conversation).await.unwrap();

    for (i, (role, content)) in [
        (MessageRole::User, "who is the narrator?"),
        (MessageRole::Assistant, "the narrator introduces himself"),
        (MessageRole::User, "what page was that on?"),
    ]
    .iter()
    .enumerate()
    {
        backend
            .save_message(
                "alpha",
                &Message {
                    id: format!("m{i}"),
                    conversation_id: "conv-1".to_string(),
                    role: *role,
                    content: content.to_string(),
                    created_at: 1000 + i as i64,
                },
            )
            .await
            .unwrap();
    }

    let messages = backend.load_messages("alpha", "conv-1").await.unwrap();
    assert_eq!(messages.len(), 3);
    assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].role, MessageRole::Assistant);

    backend
        .update_conversation_title("alpha", "conv-1", "Narrator questions", 2000)
        .await
        .unwrap();
    let conversations = backend.load_conversations("alpha").await.unwrap();
    assert_eq!(conversations[0].title, "Narrator questions");
    assert_eq!(conversations[0].updated_at, 2000);

    backend.delete_conversation("alpha", "conv-1").await.unwrap();
    assert!(backend.load_conversations("alpha").await.unwrap().is_empty());
    assert!(backend
        .load_messages("alpha", "conv-1")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn store_recovers_after_closing_handles() {
    let tmp = TempDir::new().unwrap();
    let store = BookStore::new(Arc::new(SqliteBackend::new(tmp.path())));

    let chunks = vec![chunk("c1", 0, "durable passage", Some(vec![1.0, 0.0, 0.0]))];
    let index = Bm25Index::build(vec![("c1", "durable passage", "Opening")]);
    store.save_chunks("alpha", chunks).await.unwrap();
    store.save_bm25_index("alpha", index).await.unwrap();
    store.save_meta(&meta_for("alpha", 1)).await.unwrap();

    store.recover_from_error().await.unwrap();

    // Everything reloads from disk through fresh handles.
    assert!(store.is_book_indexed("alpha").await.unwrap());
    assert_eq!(store.chunks("alpha").await.unwrap().len(), 1);
    let results = store
        .bm25_search("alpha", "durable", 5, None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk.id, "c1");

    let vector = store
        .vector_search("alpha", &[1.0, 0.0, 0.0], 5, None)
        .await
        .unwrap();
    assert_eq!(vector.len(), 1);
    assert!((vector[0].score - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn reopening_backend_sees_persisted_data() {
    let tmp = TempDir::new().unwrap();

    {
        let backend = SqliteBackend::new(tmp.path());
        backend
            .save_chunks("alpha", &[chunk("c1", 0, "survives restarts", None)])
            .await
            .unwrap();
        backend.save_meta(&meta_for("alpha", 1)).await.unwrap();
        backend.close_all().await.unwrap();
    }

    let backend = SqliteBackend::new(tmp.path());
    let loaded = backend.load_chunks("alpha").await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].text, "survives restarts");
    assert!(backend.load_meta("alpha").await.unwrap().is_some());
}
