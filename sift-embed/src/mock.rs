//! Deterministic mock provider.
//!
//! Produces stable pseudo-embeddings derived from the text alone, so tests
//! can assert byte-for-byte cache coherence without a model runtime. An
//! optional artificial delay and scripted failure count make timeout and
//! retry paths testable.

use crate::{EmbeddingProvider, ProviderError, ProviderKind, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Deterministic in-process provider for tests.
pub struct MockProvider {
    identifier: String,
    dimensions: usize,
    delay: Option<Duration>,
    fail_remaining: AtomicU32,
}

impl MockProvider {
    /// Create a mock provider with the given dimension.
    pub fn new(dimensions: usize) -> Self {
        Self {
            identifier: "mock".to_string(),
            dimensions,
            delay: None,
            fail_remaining: AtomicU32::new(0),
        }
    }

    /// Override the registry identifier (to register several mocks at once).
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Sleep this long before answering, to exercise timeout budgets.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `n` calls with a retryable error before succeeding.
    pub fn failing(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// The deterministic vector for a text, L2-normalized.
    ///
    /// Each component is derived from an FNV-1a hash of the text and the
    /// component index, mapped into [-1, 1].
    pub fn vector_for(text: &str, dimensions: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(dimensions);
        for i in 0..dimensions {
            let mut h: u64 = 0xcbf29ce484222325;
            for b in text.as_bytes() {
                h ^= u64::from(*b);
                h = h.wrapping_mul(0x100000001b3);
            }
            h ^= i as u64;
            h = h.wrapping_mul(0x100000001b3);
            // Map the top 32 bits into [-1, 1].
            let unit = (h >> 32) as f32 / u32::MAX as f32;
            out.push(unit * 2.0 - 1.0);
        }
        let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut out {
                *x /= norm;
            }
        }
        out
    }
}

#[async_trait]
impl EmbeddingProvider for MockProvider {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ProviderError::failed("scripted mock failure"));
        }
        Ok(Self::vector_for(text, self.dimensions))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        texts
            .iter()
            .map(|t| {
                if self
                    .fail_remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    Err(ProviderError::failed("scripted mock failure"))
                } else {
                    Ok(Self::vector_for(t, self.dimensions))
                }
            })
            .collect()
    }
}
