use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Engine settings: embedding provider, chunking policy, retrieval
/// weights, timeouts, and retry policy.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RagSettings {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"openai"` (any OpenAI-compatible endpoint) or `"disabled"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Texts per request on the OpenAI-compatible path.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            api_key: None,
            base_url: None,
            batch_size: 5,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    5
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window target, in characters.
    #[serde(default = "default_target_chars")]
    pub target_chars: usize,
    /// Overlap between consecutive windows, in characters.
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    /// Sections shorter than this after extraction are skipped.
    #[serde(default = "default_min_section_chars")]
    pub min_section_chars: usize,
    /// Characters per derived page; recorded in the book meta so
    /// page numbers stay interpretable after the default changes.
    #[serde(default = "default_page_size_chars")]
    pub page_size_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chars: default_target_chars(),
            overlap_chars: default_overlap_chars(),
            min_section_chars: default_min_section_chars(),
            page_size_chars: default_page_size_chars(),
        }
    }
}

fn default_target_chars() -> usize {
    1000
}
fn default_overlap_chars() -> usize {
    180
}
fn default_min_section_chars() -> usize {
    100
}
fn default_page_size_chars() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_bm25_weight")]
    pub bm25_weight: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            vector_weight: default_vector_weight(),
            bm25_weight: default_bm25_weight(),
            top_k: default_top_k(),
        }
    }
}

fn default_vector_weight() -> f32 {
    1.0
}
fn default_bm25_weight() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    10
}

/// Per-attempt timeouts for provider calls.
#[derive(Debug, Deserialize, Clone)]
pub struct TimeoutConfig {
    #[serde(default = "default_embedding_single_secs")]
    pub embedding_single_secs: u64,
    #[serde(default = "default_embedding_batch_secs")]
    pub embedding_batch_secs: u64,
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embedding_single_secs: default_embedding_single_secs(),
            embedding_batch_secs: default_embedding_batch_secs(),
            health_check_secs: default_health_check_secs(),
        }
    }
}

fn default_embedding_single_secs() -> u64 {
    15
}
fn default_embedding_batch_secs() -> u64 {
    60
}
fn default_health_check_secs() -> u64 {
    5
}

impl TimeoutConfig {
    pub fn embedding_single(&self) -> Duration {
        Duration::from_secs(self.embedding_single_secs)
    }
    pub fn embedding_batch(&self) -> Duration {
        Duration::from_secs(self.embedding_batch_secs)
    }
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }
}

/// Exponential backoff policy for embedding calls.
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter fraction applied to each delay, in `[0.0, 1.0]`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_jitter() -> f64 {
    0.25
}

impl RagSettings {
    pub fn validate(&self) -> Result<()> {
        if self.chunking.target_chars == 0 {
            return Err(Error::Config("chunking.target_chars must be > 0".into()));
        }
        if self.chunking.overlap_chars >= self.chunking.target_chars {
            return Err(Error::Config(
                "chunking.overlap_chars must be < chunking.target_chars".into(),
            ));
        }
        if self.chunking.page_size_chars == 0 {
            return Err(Error::Config("chunking.page_size_chars must be > 0".into()));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::Config("retrieval.top_k must be >= 1".into()));
        }
        if self.embedding.is_enabled() {
            if self.embedding.model.is_none() {
                return Err(Error::Config(format!(
                    "embedding.model must be set when provider is '{}'",
                    self.embedding.provider
                )));
            }
            if self.embedding.batch_size == 0 {
                return Err(Error::Config("embedding.batch_size must be >= 1".into()));
            }
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" => {}
            other => {
                return Err(Error::Config(format!(
                    "unknown embedding provider: '{other}'. Must be disabled or openai."
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config("retry.jitter must be in [0.0, 1.0]".into()));
        }
        Ok(())
    }
}

/// Load settings from a TOML file and validate them.
pub fn load_settings(path: &Path) -> Result<RagSettings> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let settings: RagSettings =
        toml::from_str(&content).map_err(|e| Error::Config(format!("failed to parse: {e}")))?;
    settings.validate()?;
    Ok(settings)
}
