//! Remote OpenAI-compatible embeddings client.

use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

use super::{l2_normalize, Embedder};

/// Connection settings for the remote embeddings API.
#[derive(Debug, Clone)]
pub struct RemoteEmbedderConfig {
    /// Bearer token.
    pub api_key: String,
    /// API base URL (no trailing slash required).
    pub base_url: String,
    /// Embedding model identifier.
    pub model: String,
    /// Optional dimension override when the model supports it.
    pub dimensions: Option<usize>,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Attempts for rate limits and transient errors.
    pub max_retries: usize,
    /// Max inputs per request.
    pub batch_size: usize,
}

/// Blocking embeddings client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct RemoteEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: usize,
    batch_size: usize,
    id: String,
}

impl RemoteEmbedder {
    /// Builds a new client from connection settings.
    pub fn new(config: RemoteEmbedderConfig) -> Result<Self, PipelineError> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "missing remote embedder API key".into(),
            ));
        }
        if config.model.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "missing remote embedder model name".into(),
            ));
        }
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", config.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| PipelineError::InvalidInput("invalid remote API key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|err| PipelineError::Internal(format!("http client build: {err}")))?;
        let endpoint = format!("{}/embeddings", config.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            id: format!("remote-{}", config.model),
            model: config.model,
            dimensions: config.dimensions,
            max_retries: config.max_retries.max(1),
            batch_size: config.batch_size.max(1),
        })
    }

    fn request_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut attempt = 0usize;
        loop {
            let request = EmbeddingRequest {
                model: &self.model,
                input: inputs,
                dimensions: self.dimensions,
            };
            let response = self.client.post(&self.endpoint).json(&request).send();
            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let mut parsed: EmbeddingResponse = resp.json().map_err(|err| {
                            PipelineError::EmbeddingTransient(format!(
                                "malformed embeddings response: {err}"
                            ))
                        })?;
                        parsed.data.sort_by_key(|entry| entry.index);
                        if parsed.data.len() != inputs.len() {
                            return Err(PipelineError::EmbeddingTransient(format!(
                                "backend returned {} embeddings for {} inputs",
                                parsed.data.len(),
                                inputs.len()
                            )));
                        }
                        return Ok(parsed
                            .data
                            .into_iter()
                            .map(|entry| {
                                let mut vector = entry.embedding;
                                l2_normalize(&mut vector);
                                vector
                            })
                            .collect());
                    }

                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if should_retry(status) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(PipelineError::EmbeddingTransient(format!(
                        "embeddings request failed ({status}): {body}"
                    )));
                }
                Err(err) => {
                    if is_retryable_error(&err) && attempt + 1 < self.max_retries {
                        attempt += 1;
                        thread::sleep(retry_backoff(attempt));
                        continue;
                    }
                    return Err(PipelineError::EmbeddingTransient(err.to_string()));
                }
            }
        }
    }
}

impl Embedder for RemoteEmbedder {
    fn id(&self) -> &str {
        &self.id
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            vectors.extend(self.request_batch(chunk)?);
        }
        Ok(vectors)
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() || err.is_decode()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(api_key: &str) -> RemoteEmbedderConfig {
        RemoteEmbedderConfig {
            api_key: api_key.to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: None,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            batch_size: 64,
        }
    }

    #[test]
    fn rejects_blank_api_key() {
        let err = RemoteEmbedder::new(config("  ")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[test]
    fn backend_id_carries_model_name() {
        let embedder = RemoteEmbedder::new(config("key")).unwrap();
        assert_eq!(embedder.id(), "remote-text-embedding-3-small");
    }

    #[test]
    fn retryable_statuses() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::BAD_GATEWAY));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
    }
}
