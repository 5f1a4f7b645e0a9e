//! Embedding providers.
//!
//! The pipeline talks to embedding backends through [`EmbeddingProvider`],
//! which turns a batch of chunk texts into fixed-dimension vectors. Failures
//! carry their retry classification: [`EmbedError::Transient`] is retried
//! with backoff, [`EmbedError::Permanent`] fails the generation immediately.
//!
//! Two implementations ship with the crate: [`MockEmbeddingProvider`] for
//! deterministic tests and [`HttpEmbeddingProvider`] for JSON-over-HTTP
//! backends.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Embedding failure, split by retry classification.
#[derive(Debug, Error, Diagnostic)]
pub enum EmbedError {
    /// Timeouts, rate limits, connection errors. Worth retrying.
    #[error("transient embedding error: {0}")]
    #[diagnostic(code(ragline::embed::transient))]
    Transient(String),

    /// Malformed input or a provider-side rejection of the request itself.
    #[error("permanent embedding error: {0}")]
    #[diagnostic(code(ragline::embed::permanent))]
    Permanent(String),
}

/// Turns text batches into fixed-dimension vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimension of every vector this provider produces.
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts. The result must contain exactly one vector
    /// per input, in input order.
    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Deterministic provider for tests.
///
/// Vectors are derived from a hash of the input text, so the same chunk
/// always embeds to the same vector and similarity assertions stay stable.
/// Failures can be scripted per call.
pub struct MockEmbeddingProvider {
    dimensions: usize,
    calls: AtomicU32,
    planned_failures: Mutex<VecDeque<EmbedError>>,
    always_fail: Option<fn(&str) -> EmbedError>,
}

impl MockEmbeddingProvider {
    pub const DEFAULT_DIMENSIONS: usize = 8;

    pub fn new() -> Self {
        Self::with_dimensions(Self::DEFAULT_DIMENSIONS)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            calls: AtomicU32::new(0),
            planned_failures: Mutex::new(VecDeque::new()),
            always_fail: None,
        }
    }

    /// Fail the next `n` calls with a transient error, then succeed.
    #[must_use]
    pub fn failing_transient(self, n: usize) -> Self {
        {
            let mut plan = self.planned_failures.lock();
            for _ in 0..n {
                plan.push_back(EmbedError::Transient("scripted failure".to_string()));
            }
        }
        self
    }

    /// Every call fails with a transient error.
    #[must_use]
    pub fn always_transient(mut self) -> Self {
        self.always_fail = Some(|_| EmbedError::Transient("scripted rate limit".to_string()));
        self
    }

    /// Every call fails with a permanent error.
    #[must_use]
    pub fn always_permanent(mut self) -> Self {
        self.always_fail = Some(|_| EmbedError::Permanent("scripted malformed input".to_string()));
        self
    }

    /// Number of embed calls observed so far.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        let mut seed = hasher.finish();
        (0..self.dimensions)
            .map(|_| {
                // xorshift keeps components spread without any rand state.
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                ((seed % 2000) as f32 / 1000.0) - 1.0
            })
            .collect()
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(fail) = self.always_fail {
            return Err(fail(""));
        }
        if let Some(planned) = self.planned_failures.lock().pop_front() {
            return Err(planned);
        }
        Ok(batch.iter().map(|text| self.vector_for(text)).collect())
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// JSON-over-HTTP embedding backend.
///
/// Sends `{"model": ..., "input": [...]}` and expects
/// `{"embeddings": [[...], ...]}` back. HTTP 408/429/5xx and transport
/// errors classify transient; any other non-success status is permanent.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    dimensions: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(
        endpoint: Url,
        model: impl Into<String>,
        dimensions: usize,
        timeout: Duration,
    ) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| EmbedError::Permanent(format!("client build: {err}")))?;
        Ok(Self {
            client,
            endpoint,
            model: model.into(),
            dimensions,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let request = EmbedRequest {
            model: &self.model,
            input: batch,
        };
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() || err.is_connect() {
                    EmbedError::Transient(err.to_string())
                } else {
                    EmbedError::Permanent(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("status {status}: {body}");
            return if status.as_u16() == 408
                || status.as_u16() == 429
                || status.is_server_error()
            {
                Err(EmbedError::Transient(message))
            } else {
                Err(EmbedError::Permanent(message))
            };
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|err| EmbedError::Permanent(format!("response decode: {err}")))?;
        if parsed.embeddings.len() != batch.len() {
            return Err(EmbedError::Permanent(format!(
                "expected {} vectors, provider returned {}",
                batch.len(),
                parsed.embeddings.len()
            )));
        }
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_vectors_are_deterministic() {
        let provider = MockEmbeddingProvider::new();
        let batch = vec!["alpha".to_string(), "beta".to_string()];
        let a = provider.embed(&batch).await.unwrap();
        let b = provider.embed(&batch).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].len(), MockEmbeddingProvider::DEFAULT_DIMENSIONS);
        assert_ne!(a[0], a[1]);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let provider = MockEmbeddingProvider::new().failing_transient(2);
        let batch = vec!["x".to_string()];
        assert!(matches!(
            provider.embed(&batch).await,
            Err(EmbedError::Transient(_))
        ));
        assert!(matches!(
            provider.embed(&batch).await,
            Err(EmbedError::Transient(_))
        ));
        assert!(provider.embed(&batch).await.is_ok());
    }

    #[tokio::test]
    async fn always_permanent_never_recovers() {
        let provider = MockEmbeddingProvider::new().always_permanent();
        for _ in 0..3 {
            assert!(matches!(
                provider.embed(&["x".to_string()]).await,
                Err(EmbedError::Permanent(_))
            ));
        }
    }
}
