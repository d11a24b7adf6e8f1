//! Model provider abstractions and implementations.
//!
//! Text generation streams fragments from an OpenAI-compatible chat API;
//! image generation is a submit-then-poll API. Both sit behind traits so the
//! HTTP layer and tests can swap in the mock implementations.

pub mod async_image;
pub mod credentials;
pub mod mock;
pub mod openai;
pub mod sse;

use async_trait::async_trait;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

pub use credentials::{Credentials, CredentialsError, CredentialsProvider};

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Content filtered")]
    ContentFiltered,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status from an upstream API.
    pub fn from_status(status: reqwest::StatusCode, body: &str, api: &str) -> Self {
        match status.as_u16() {
            401 | 403 => ProviderError::Unauthorized(format!("{} returned {}", api, status)),
            429 => ProviderError::RateLimited,
            400 | 422 => ProviderError::InvalidRequest(format!("{} {}: {}", api, status, body)),
            _ => ProviderError::ApiError(format!("{} error {}: {}", api, status, body)),
        }
    }
}

/// Reason why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Complete,
    Length,
    ContentFilter,
}

impl FinishReason {
    pub fn from_api(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Complete,
        }
    }
}

/// Stream chunk for streaming responses.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Text fragment, in order.
    Text(String),

    /// Final marker; nothing follows it.
    Complete { finish_reason: FinishReason },
}

/// Type alias for provider streams.
pub type ProviderStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Generation parameters for text requests.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    /// Temperature (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Maximum output tokens.
    pub max_tokens: Option<u32>,

    /// Optional system message sent ahead of the prompt.
    pub system_prompt: Option<String>,
}

/// Trait for streaming text generation providers.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Start a streaming generation. Fragments arrive in order and the stream
    /// ends after `StreamChunk::Complete` or the first error.
    async fn generate_stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError>;

    /// Health check.
    async fn health_check(&self) -> Result<(), ProviderError>;
}

/// State of a submitted image operation as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Done { image_base64: String },
    Failed { message: String },
}

/// Trait for submit-then-poll image generation providers.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Submit a prompt and return the provider's operation id.
    async fn submit(&self, prompt: &str, credentials: &Credentials)
        -> Result<String, ProviderError>;

    /// Query an operation once.
    async fn poll(
        &self,
        operation_id: &str,
        credentials: &Credentials,
    ) -> Result<OperationStatus, ProviderError>;
}
