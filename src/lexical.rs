//! Serializable BM25 index over chunk text and chapter titles.
//!
//! A small Okapi BM25 (`k1 = 1.2`, `b = 0.75`) inverted index built
//! once per indexing run and replaced wholesale on re-index. Tokens
//! are matched exactly as stored: the tokenizer lowercases and splits
//! on non-alphanumeric characters, and no stemmer runs on either the
//! indexing or the query side.
//!
//! The index serializes to a JSON string and is persisted as a single
//! record per book. The payload carries a `format` version so the
//! implementation can change without silently misreading old rows.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

const K1: f32 = 1.2;
const B: f32 = 0.75;

/// Serialized-format version; bumped on any incompatible change.
const FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    format: u32,
    /// term → (doc id → term frequency).
    postings: HashMap<String, HashMap<String, u32>>,
    /// doc id → token count.
    doc_lengths: HashMap<String, u32>,
    avg_doc_length: f32,
}

impl Bm25Index {
    /// Build an index over `(id, text, chapter_title)` documents.
    /// Both fields contribute tokens under the same document key.
    pub fn build<'a, I>(documents: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str, &'a str)>,
    {
        let mut postings: HashMap<String, HashMap<String, u32>> = HashMap::new();
        let mut doc_lengths: HashMap<String, u32> = HashMap::new();

        for (id, text, chapter_title) in documents {
            let mut length = 0u32;
            for token in tokenize(text).chain(tokenize(chapter_title)) {
                length += 1;
                *postings
                    .entry(token)
                    .or_default()
                    .entry(id.to_string())
                    .or_insert(0) += 1;
            }
            doc_lengths.insert(id.to_string(), length);
        }

        let total: u64 = doc_lengths.values().map(|&l| l as u64).sum();
        let avg_doc_length = if doc_lengths.is_empty() {
            0.0
        } else {
            total as f32 / doc_lengths.len() as f32
        };

        debug!(
            docs = doc_lengths.len(),
            terms = postings.len(),
            "built lexical index"
        );

        Self {
            format: FORMAT,
            postings,
            doc_lengths,
            avg_doc_length,
        }
    }

    pub fn doc_count(&self) -> usize {
        self.doc_lengths.len()
    }

    /// Score documents against `query`, best first, up to `limit`.
    ///
    /// A query that yields no tokens produces an empty result rather
    /// than an error; retrieval callers treat unparseable queries as
    /// matching nothing.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f32)> {
        let terms: Vec<String> = tokenize(query).collect();
        if terms.is_empty() || self.doc_lengths.is_empty() {
            return Vec::new();
        }

        let n = self.doc_lengths.len() as f32;
        let mut scores: HashMap<&str, f32> = HashMap::new();

        for term in &terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (id, &tf) in docs {
                let doc_len = self.doc_lengths.get(id).copied().unwrap_or(0) as f32;
                let tf = tf as f32;
                let denom = tf + K1 * (1.0 - B + B * doc_len / self.avg_doc_length.max(1.0));
                *scores.entry(id.as_str()).or_insert(0.0) += idf * (tf * (K1 + 1.0)) / denom;
            }
        }

        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Serialize to the persisted string form.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize the persisted string form, rejecting payloads from
    /// a different format version.
    pub fn from_json(payload: &str) -> Result<Self> {
        let index: Bm25Index = serde_json::from_str(payload)
            .map_err(|e| Error::InvalidQuery(format!("bad lexical index payload: {e}")))?;
        if index.format != FORMAT {
            return Err(Error::InvalidQuery(format!(
                "unsupported lexical index format {}",
                index.format
            )));
        }
        Ok(index)
    }
}

/// Lowercase alphanumeric tokenizer. No stemming, no stop words.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}
