//! Embedding provider abstraction for Sift.
//!
//! A provider converts text into fixed-dimension f32 vectors. Providers are
//! a capability set, not an inheritance hierarchy: the engine dispatches on
//! `identifier()` against a registry of trait objects.
//!
//! This crate ships:
//! - [`EmbeddingProvider`] - the async trait every provider implements
//! - [`MockProvider`] - a deterministic in-process provider used by tests
//! - [`http`] - the contract HTTP adapters must honor (wire shapes,
//!   transport trait, backoff policy); concrete HTTP clients live outside
//!   this workspace

pub mod http;
mod mock;

pub use mock::MockProvider;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Error returned by embedding providers.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// The provider rejected or failed the request.
    #[error("provider failure: {message}")]
    Failed {
        message: String,
        /// Whether retrying with backoff is worthwhile.
        retryable: bool,
        /// Provider-signaled delay before the next attempt (rate limiting).
        retry_after: Option<Duration>,
    },

    /// The provider did not answer within the caller's budget.
    #[error("provider timed out")]
    Timeout,

    /// The provider returned vectors of an unexpected length.
    #[error("provider returned {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ProviderError {
    /// Shorthand for a retryable failure with no rate-limit hint.
    pub fn failed(message: impl Into<String>) -> Self {
        ProviderError::Failed {
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }

    /// Shorthand for a terminal failure (bad request, auth, config).
    pub fn terminal(message: impl Into<String>) -> Self {
        ProviderError::Failed {
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// Whether the pipeline should retry this error with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Failed { retryable, .. } => *retryable,
            ProviderError::Timeout => true,
            ProviderError::DimensionMismatch { .. } => false,
        }
    }

    /// Provider-signaled backoff delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::Failed { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Where a provider executes.
///
/// Ingest uses this to decide whether an embedding can be produced
/// synchronously inside a batch transaction: `Local` providers may be
/// called under the batch latency budget; `Remote` providers are never
/// called mid-transaction and the document is queued instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Runs in-process (model weights loaded into memory).
    Local,
    /// Requires a network round-trip.
    Remote,
}

/// An entity that converts text into fixed-dimension vectors.
///
/// Implementations must be `Send + Sync`; the pipeline coalesces concurrent
/// callers onto a single in-flight call per cache key, so providers only
/// need to tolerate moderate concurrency.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Stable identifier used for registry dispatch and cache keys
    /// (e.g. `"mock"`, `"openai"`).
    fn identifier(&self) -> &str;

    /// Dimension of every vector this provider produces.
    fn dimensions(&self) -> usize;

    /// Where this provider executes.
    fn kind(&self) -> ProviderKind;

    /// Embed a single text.
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts, preserving input order.
    ///
    /// The default implementation loops over [`embed_one`]; providers with
    /// a native batch endpoint should override it.
    ///
    /// [`embed_one`]: EmbeddingProvider::embed_one
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed_one(text).await?);
        }
        Ok(out)
    }

    /// Eagerly initialize provider state (model weights, sessions).
    async fn preload(&self) -> Result<()> {
        Ok(())
    }

    /// Release provider state. Called when the engine's memory ceiling is
    /// exceeded, least-recently-used provider first.
    async fn unload(&self) {}

    /// Rough estimate of resident memory in bytes (loaded weights,
    /// sessions). Zero for providers with no in-process state.
    fn memory_estimate(&self) -> usize {
        0
    }
}
