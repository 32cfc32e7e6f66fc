//! Error kinds the engine distinguishes.
//!
//! Callers match on variants to decide policy: cancellation unwinds
//! silently, embedding failures may degrade to lexical-only indexing,
//! store failures propagate, and query parse failures are swallowed
//! into empty result sets.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Cooperative cancellation observed; never retried.
    #[error("indexing aborted")]
    IndexingAborted,

    /// Embedding transport or provider failure, after retries.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Persistence failure in the underlying backend.
    #[error("store error: {0}")]
    Store(String),

    /// BM25 query could not be tokenized; handled internally.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A section failed to yield a structured document; the chunker
    /// logs and skips it.
    #[error("book document error: {0}")]
    Book(String),

    /// Missing API key / base URL or malformed settings; never retried.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the error is a cancellation and should unwind silently.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::IndexingAborted)
    }

    /// True when a retry of the failed operation could succeed.
    ///
    /// Authentication, configuration, and cancellation short-circuit
    /// the retry loop; transport-level embedding failures do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Embedding(msg) => {
                !(msg.contains("401") || msg.contains("403") || msg.contains("400"))
            }
            Error::IndexingAborted | Error::Config(_) => false,
            Error::Store(_) | Error::InvalidQuery(_) | Error::Book(_) => false,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(format!("serialization: {e}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let status = e
            .status()
            .map(|s| format!(" {}", s.as_u16()))
            .unwrap_or_default();
        Error::Embedding(format!("http{status}: {e}"))
    }
}
