//! Deployment configuration for the ingestion pipeline.
//!
//! Retry bounds, backoff factors, chunk sizing, timeouts, and the concurrent
//! re-ingestion policy are deployment constants rather than hardcoded values.
//! Defaults can be overridden programmatically via the `with_*` builders or
//! from the environment (`.env` supported through `dotenvy`):
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `RAGLINE_CHUNK_MAX_CHARS` | Maximum characters per chunk |
//! | `RAGLINE_CHUNK_OVERLAP` | Overlapping characters between chunks |
//! | `RAGLINE_MAX_ATTEMPTS` | Retry budget per stage |
//! | `RAGLINE_RETRY_BASE_MS` | Base backoff delay in milliseconds |
//! | `RAGLINE_CALL_TIMEOUT_MS` | Timeout for each external call |
//! | `RAGLINE_COLLECTION_PREFIX` | Tenant namespace for index collections |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Chunker parameters. A generation's chunks are a pure function of
/// `(content, ChunkingConfig)`, so the config is persisted with the run to
/// keep re-execution byte-identical.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub const DEFAULT_MAX_CHARS: usize = 1200;
    pub const DEFAULT_OVERLAP: usize = 200;

    #[must_use]
    pub fn new(max_chars: usize, overlap: usize) -> Self {
        Self { max_chars, overlap }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: Self::DEFAULT_MAX_CHARS,
            overlap: Self::DEFAULT_OVERLAP,
        }
    }
}

/// What happens when a submission arrives while a generation is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Reject with `IngestionInFlight`.
    Reject,
    /// Increment the generation counter; in-flight workers detect the stale
    /// stamp at write time and discard their results.
    Supersede,
}

/// Top-level pipeline configuration.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub retry: RetryPolicy,
    /// Bounded timeout applied to every external call (object store,
    /// embedding provider, vector index). Timeouts classify as transient.
    pub call_timeout: Duration,
    pub concurrency: ConcurrencyPolicy,
    /// Tenant namespace prefixed onto collection and alias names.
    pub collection_prefix: String,
    /// Chunks per embedding request.
    pub embed_batch_size: usize,
}

impl PipelineConfig {
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_EMBED_BATCH_SIZE: usize = 32;
    pub const DEFAULT_COLLECTION_PREFIX: &'static str = "ragline";

    /// Resolve configuration from the environment, falling back to defaults
    /// for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        if let Some(v) = env_usize("RAGLINE_CHUNK_MAX_CHARS") {
            config.chunking.max_chars = v;
        }
        if let Some(v) = env_usize("RAGLINE_CHUNK_OVERLAP") {
            config.chunking.overlap = v;
        }
        if let Some(v) = env_usize("RAGLINE_MAX_ATTEMPTS") {
            config.retry.max_attempts = (v as u32).max(1);
        }
        if let Some(v) = env_usize("RAGLINE_RETRY_BASE_MS") {
            config.retry.base_delay = Duration::from_millis(v as u64);
        }
        if let Some(v) = env_usize("RAGLINE_CALL_TIMEOUT_MS") {
            config.call_timeout = Duration::from_millis(v as u64);
        }
        if let Ok(prefix) = std::env::var("RAGLINE_COLLECTION_PREFIX") {
            if !prefix.is_empty() {
                config.collection_prefix = prefix;
            }
        }
        config
    }

    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    #[must_use]
    pub fn with_collection_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.collection_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            retry: RetryPolicy::default(),
            call_timeout: Self::DEFAULT_CALL_TIMEOUT,
            concurrency: ConcurrencyPolicy::Supersede,
            collection_prefix: Self::DEFAULT_COLLECTION_PREFIX.to_string(),
            embed_batch_size: Self::DEFAULT_EMBED_BATCH_SIZE,
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}
