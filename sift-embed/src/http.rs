//! Contract for HTTP embedding adapters.
//!
//! Concrete HTTP clients (OpenAI, Anthropic, OpenRouter, custom endpoints)
//! live outside this workspace. What ships here is the interface they must
//! honor: the wire shapes (`POST text[] -> vector[]`), authentication via an
//! implementation-specific header, rate-limit backoff that respects the
//! provider's retry-after signal, and a declared dimension that must match
//! the collection's.
//!
//! [`HttpEmbeddingProvider`] implements [`EmbeddingProvider`] generically
//! over any [`HttpTransport`], so an adapter only supplies the transport.

use crate::{EmbeddingProvider, ProviderError, ProviderKind, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Known endpoint dialects. All of them accept a batch of texts and return
/// one vector per text; they differ in paths and auth header names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpDialect {
    OpenAiCompatible,
    Anthropic,
    OpenRouter,
    Custom,
}

impl HttpDialect {
    /// Header carrying the credential for this dialect.
    pub fn auth_header(&self) -> &'static str {
        match self {
            HttpDialect::Anthropic => "x-api-key",
            _ => "authorization",
        }
    }

    /// How the credential is formatted into the auth header.
    pub fn auth_value(&self, api_key: &str) -> String {
        match self {
            HttpDialect::Anthropic => api_key.to_string(),
            _ => format!("Bearer {}", api_key),
        }
    }
}

/// Configuration for an HTTP embedding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    /// Registry identifier (doubles as the cache-key provider id).
    pub identifier: String,
    /// Endpoint URL for the embeddings call.
    pub endpoint: String,
    pub dialect: HttpDialect,
    /// Model name sent in the request body.
    pub model: String,
    /// Declared output dimension; responses are validated against it.
    pub dimensions: usize,
    /// Credential placed in the dialect's auth header. Never logged.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

/// Request body: `POST text[]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequestBody {
    pub model: String,
    pub input: Vec<String>,
}

/// One vector in a response, tagged with its input index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingDatum {
    pub index: usize,
    pub embedding: Vec<f32>,
}

/// Response body: `vector[]`, one per input text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponseBody {
    pub data: Vec<EmbeddingDatum>,
}

/// A completed HTTP exchange, as seen by the provider layer.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Parsed `Retry-After` value, when the server sent one.
    pub retry_after: Option<Duration>,
}

/// Minimal transport the adapter supplies. The provider layer owns request
/// construction, response decoding, and retry classification.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> std::result::Result<HttpResponse, String>;
}

/// Exponential backoff with a small attempt cap.
///
/// A provider-signaled retry-after always wins over the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: u32,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            factor: 2,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (1-based; attempt 1 has no delay).
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint;
        }
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base * self.factor.saturating_pow(attempt - 2)
    }
}

/// [`EmbeddingProvider`] over any [`HttpTransport`].
pub struct HttpEmbeddingProvider<T: HttpTransport> {
    config: HttpProviderConfig,
    transport: T,
}

impl<T: HttpTransport> HttpEmbeddingProvider<T> {
    pub fn new(config: HttpProviderConfig, transport: T) -> Self {
        Self { config, transport }
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![("content-type".to_string(), "application/json".to_string())];
        if let Some(key) = &self.config.api_key {
            headers.push((
                self.config.dialect.auth_header().to_string(),
                self.config.dialect.auth_value(key),
            ));
        }
        headers
    }

    fn decode(&self, response: HttpResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
        match response.status {
            200 => {}
            429 | 500..=599 => {
                tracing::debug!(
                    "provider '{}' returned HTTP {} (retry_after={:?})",
                    self.config.identifier,
                    response.status,
                    response.retry_after
                );
                return Err(ProviderError::Failed {
                    message: format!("provider returned HTTP {}", response.status),
                    retryable: true,
                    retry_after: response.retry_after,
                });
            }
            status => {
                return Err(ProviderError::terminal(format!(
                    "provider returned HTTP {}",
                    status
                )));
            }
        }

        let body: EmbeddingResponseBody = serde_json::from_slice(&response.body)
            .map_err(|e| ProviderError::terminal(format!("malformed response body: {}", e)))?;

        if body.data.len() != expected {
            return Err(ProviderError::terminal(format!(
                "provider returned {} vectors for {} inputs",
                body.data.len(),
                expected
            )));
        }

        // Responses may arrive out of order; the index field is authoritative.
        let mut out = vec![Vec::new(); expected];
        for datum in body.data {
            if datum.embedding.len() != self.config.dimensions {
                return Err(ProviderError::DimensionMismatch {
                    expected: self.config.dimensions,
                    actual: datum.embedding.len(),
                });
            }
            if datum.index >= expected {
                return Err(ProviderError::terminal(format!(
                    "response index {} out of range",
                    datum.index
                )));
            }
            out[datum.index] = datum.embedding;
        }
        Ok(out)
    }
}

#[async_trait]
impl<T: HttpTransport> EmbeddingProvider for HttpEmbeddingProvider<T> {
    fn identifier(&self) -> &str {
        &self.config.identifier
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Remote
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| ProviderError::terminal("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequestBody {
            model: self.config.model.clone(),
            input: texts.to_vec(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::terminal(format!("request encoding failed: {}", e)))?;

        let response = self
            .transport
            .post_json(&self.config.endpoint, &self.headers(), &payload)
            .await
            .map_err(ProviderError::failed)?;

        self.decode(response, texts.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CannedTransport {
        responses: Mutex<Vec<HttpResponse>>,
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn post_json(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _body: &[u8],
        ) -> std::result::Result<HttpResponse, String> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| "no canned response".to_string())
        }
    }

    fn provider(responses: Vec<HttpResponse>) -> HttpEmbeddingProvider<CannedTransport> {
        HttpEmbeddingProvider::new(
            HttpProviderConfig {
                identifier: "test-http".to_string(),
                endpoint: "http://localhost/v1/embeddings".to_string(),
                dialect: HttpDialect::OpenAiCompatible,
                model: "test-model".to_string(),
                dimensions: 3,
                api_key: Some("secret".to_string()),
            },
            CannedTransport {
                responses: Mutex::new(responses),
            },
        )
    }

    fn ok_body(vectors: &[(usize, Vec<f32>)]) -> Vec<u8> {
        let data: Vec<EmbeddingDatum> = vectors
            .iter()
            .map(|(index, embedding)| EmbeddingDatum {
                index: *index,
                embedding: embedding.clone(),
            })
            .collect();
        serde_json::to_vec(&EmbeddingResponseBody { data }).unwrap()
    }

    #[tokio::test]
    async fn test_batch_reordered_by_index() {
        let p = provider(vec![HttpResponse {
            status: 200,
            body: ok_body(&[(1, vec![4.0, 5.0, 6.0]), (0, vec![1.0, 2.0, 3.0])]),
            retry_after: None,
        }]);
        let out = p
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(out[0], vec![1.0, 2.0, 3.0]);
        assert_eq!(out[1], vec![4.0, 5.0, 6.0]);
    }

    #[tokio::test]
    async fn test_rate_limit_is_retryable_with_hint() {
        let p = provider(vec![HttpResponse {
            status: 429,
            body: Vec::new(),
            retry_after: Some(Duration::from_secs(3)),
        }]);
        let err = p.embed_one("a").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_terminal() {
        let p = provider(vec![HttpResponse {
            status: 200,
            body: ok_body(&[(0, vec![1.0, 2.0])]),
            retry_after: None,
        }]);
        let err = p.embed_one("a").await.unwrap_err();
        assert!(matches!(err, ProviderError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_auth_error_not_retryable() {
        let p = provider(vec![HttpResponse {
            status: 401,
            body: Vec::new(),
            retry_after: None,
        }]);
        let err = p.embed_one("a").await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_backoff_progression() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::ZERO);
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(250));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(500));
        // A retry-after hint always wins.
        assert_eq!(
            policy.delay_for(3, Some(Duration::from_secs(9))),
            Duration::from_secs(9)
        );
    }

    #[test]
    fn test_dialect_auth_headers() {
        assert_eq!(HttpDialect::Anthropic.auth_header(), "x-api-key");
        assert_eq!(HttpDialect::OpenAiCompatible.auth_header(), "authorization");
        assert_eq!(
            HttpDialect::OpenRouter.auth_value("k"),
            "Bearer k".to_string()
        );
    }
}
