//! External collaborator contracts: embedding and text generation.
//!
//! The core never talks to a model directly; it goes through the two traits
//! here. Every call is a blocking boundary that takes a caller-supplied
//! timeout and a [`CancelToken`]; timeouts and cancellation surface as
//! [`ProviderError`] variants and are treated identically to provider
//! outages by the callers (router and generator fall back, they do not
//! fail).
//!
//! Shipped implementations: [`HttpEmbedder`] / [`HttpGenerator`] speak a
//! minimal JSON protocol over HTTP (blocking reqwest, rustls), and
//! [`NullProvider`] always fails, which backs fully-degraded operation and
//! the fallback tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default timeout for embedding calls.
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for generation calls.
pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Error from an external model provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ProviderError {
    /// Timeouts are treated identically to outages by every caller.
    pub fn is_degradation(&self) -> bool {
        !matches!(self, ProviderError::Cancelled)
    }
}

/// Cooperative cancellation signal threaded through the pipeline.
///
/// Cloning shares the underlying flag. Checked before and after every
/// blocking boundary; in-flight HTTP calls are bounded by their timeout, so
/// a cancel is observed within one timeout at worst.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Errors with [`ProviderError::Cancelled`] when the flag is set.
    pub fn check(&self) -> Result<(), ProviderError> {
        if self.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Embeds text into a fixed-dimension vector.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(
        &self,
        text: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, ProviderError>;

    /// Output dimension, when known up front.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Options for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 512,
            timeout: DEFAULT_GENERATE_TIMEOUT,
        }
    }
}

/// Generates free text from a prompt.
pub trait GenerationProvider: Send + Sync {
    fn generate(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        cancel: &CancelToken,
    ) -> Result<String, ProviderError>;
}

fn map_reqwest_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout)
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// Embedding provider over a JSON HTTP endpoint.
///
/// POSTs `{"input": "..."}` to `<base_url>/embed` and expects
/// `{"embedding": [..]}` back.
pub struct HttpEmbedder {
    base_url: String,
    dimension: Option<usize>,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>, dimension: Option<usize>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dimension,
        }
    }
}

impl EmbeddingProvider for HttpEmbedder {
    fn embed(
        &self,
        text: &str,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, ProviderError> {
        cancel.check()?;

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crossway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let response = client
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { input: text })
            .send()
            .map_err(|e| map_reqwest_error(e, timeout))?;

        cancel.check()?;

        if !response.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "embedding endpoint returned {}",
                response.status()
            )));
        }

        let body: EmbedResponse = response
            .json()
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(ProviderError::Malformed("empty embedding".into()));
        }
        if let Some(dim) = self.dimension {
            if body.embedding.len() != dim {
                return Err(ProviderError::Malformed(format!(
                    "embedding dimension mismatch: expected {dim}, got {}",
                    body.embedding.len()
                )));
            }
        }
        debug!(len = body.embedding.len(), "embed_ok");
        Ok(body.embedding)
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    text: String,
}

/// Generation provider over a JSON HTTP endpoint.
///
/// POSTs `{"prompt": ..., "temperature": ..., "max_tokens": ...}` to
/// `<base_url>/generate` and expects `{"text": "..."}` back.
pub struct HttpGenerator {
    base_url: String,
}

impl HttpGenerator {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl GenerationProvider for HttpGenerator {
    fn generate(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        cancel: &CancelToken,
    ) -> Result<String, ProviderError> {
        cancel.check()?;

        let client = reqwest::blocking::Client::builder()
            .timeout(opts.timeout)
            .user_agent(concat!("crossway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let response = client
            .post(format!("{}/generate", self.base_url))
            .json(&GenerateRequest {
                prompt,
                temperature: opts.temperature,
                max_tokens: opts.max_tokens,
            })
            .send()
            .map_err(|e| map_reqwest_error(e, opts.timeout))?;

        cancel.check()?;

        if !response.status().is_success() {
            return Err(ProviderError::Unavailable(format!(
                "generation endpoint returned {}",
                response.status()
            )));
        }

        let body: GenerateResponse = response
            .json()
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(body.text)
    }
}

/// Provider that always fails with `Unavailable`.
///
/// Used when no endpoint is configured; the pipeline then runs entirely on
/// its rule-based fallbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProvider;

impl EmbeddingProvider for NullProvider {
    fn embed(
        &self,
        _text: &str,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Vec<f32>, ProviderError> {
        cancel.check()?;
        Err(ProviderError::Unavailable("no embedding endpoint configured".into()))
    }
}

impl GenerationProvider for NullProvider {
    fn generate(
        &self,
        _prompt: &str,
        _opts: &GenerationOptions,
        cancel: &CancelToken,
    ) -> Result<String, ProviderError> {
        cancel.check()?;
        Err(ProviderError::Unavailable("no generation endpoint configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_trips_check() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(matches!(token.check(), Err(ProviderError::Cancelled)));
        // Clones share the flag.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn null_provider_is_unavailable_not_a_panic() {
        let p = NullProvider;
        let err = p
            .embed("hi", DEFAULT_EMBED_TIMEOUT, &CancelToken::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
        assert!(err.is_degradation());
    }

    #[test]
    fn cancelled_is_not_a_degradation() {
        assert!(!ProviderError::Cancelled.is_degradation());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_degradation());
    }
}
