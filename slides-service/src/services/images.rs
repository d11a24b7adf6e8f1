//! Image generation adapter: submit a prompt, poll the operation until it
//! settles, return the base64 image.
//!
//! Each job is an explicit state machine driven by poll outcomes:
//!
//! ```text
//! Submitted -> Polling(1) -> ... -> Polling(n) -> Done | Failed | TimedOut
//! ```
//!
//! The job ends after at most `max_attempts` polls. Cancellation is checked
//! between polls and while waiting.

use crate::services::metrics;
use crate::services::providers::{
    CredentialsError, CredentialsProvider, ImageProvider, OperationStatus, ProviderError,
};
use base64::Engine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 10,
        }
    }
}

#[derive(Error, Debug)]
pub enum ImageGenerationError {
    #[error("Image provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Image provider credentials: {0}")]
    Credentials(#[from] CredentialsError),

    #[error("Image generation failed: {0}")]
    Failed(String),

    #[error("Image generation timed out after {attempts} polls")]
    TimedOut { attempts: u32 },

    #[error("Image generation cancelled")]
    Cancelled,
}

/// Where a single generation job stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Submitted { operation_id: String },
    Polling { operation_id: String, attempt: u32 },
    Done { image_base64: String },
    Failed { message: String },
    TimedOut { attempts: u32 },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Done { .. } | JobState::Failed { .. } | JobState::TimedOut { .. }
        )
    }

    fn operation_id(&self) -> Option<&str> {
        match self {
            JobState::Submitted { operation_id } | JobState::Polling { operation_id, .. } => {
                Some(operation_id)
            }
            _ => None,
        }
    }

    fn attempts(&self) -> u32 {
        match self {
            JobState::Polling { attempt, .. } => *attempt,
            _ => 0,
        }
    }

    /// Apply the outcome of one poll.
    pub fn advance(self, status: OperationStatus, max_attempts: u32) -> JobState {
        let Some(operation_id) = self.operation_id().map(str::to_string) else {
            return self;
        };
        let attempt = self.attempts() + 1;

        match status {
            OperationStatus::Done { image_base64 } => JobState::Done { image_base64 },
            OperationStatus::Failed { message } => JobState::Failed { message },
            OperationStatus::Pending if attempt >= max_attempts => {
                JobState::TimedOut { attempts: attempt }
            }
            OperationStatus::Pending => JobState::Polling {
                operation_id,
                attempt,
            },
        }
    }
}

/// Drives image jobs against a provider.
pub struct ImageGenerator {
    provider: Arc<dyn ImageProvider>,
    credentials: Arc<dyn CredentialsProvider>,
    policy: PollPolicy,
    save_dir: Option<PathBuf>,
}

impl ImageGenerator {
    pub fn new(
        provider: Arc<dyn ImageProvider>,
        credentials: Arc<dyn CredentialsProvider>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            provider,
            credentials,
            policy,
            save_dir: None,
        }
    }

    /// Also write every decoded image into `dir`. Debug aid only.
    pub fn with_save_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.save_dir = dir;
        self
    }

    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Generate one image and return it base64-encoded.
    #[tracing::instrument(skip(self, prompt, cancel), fields(provider = self.provider.name(), prompt_len = prompt.len()))]
    pub async fn generate(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ImageGenerationError> {
        let started = Instant::now();
        let result = self.run_job(prompt, cancel).await;

        let outcome = match &result {
            Ok(_) => "generated",
            Err(ImageGenerationError::TimedOut { .. }) => "timed_out",
            Err(ImageGenerationError::Cancelled) => "cancelled",
            Err(_) => "failed",
        };
        metrics::record_image(outcome, started.elapsed());

        match &result {
            Ok(image) => {
                tracing::info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    size = image.len(),
                    "Image generated"
                );
                self.save_debug_copy(image).await;
            }
            Err(e) => tracing::warn!(error = %e, "Image generation did not succeed"),
        }
        result
    }

    async fn run_job(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ImageGenerationError> {
        if prompt.trim().is_empty() {
            return Err(ImageGenerationError::Provider(ProviderError::InvalidRequest(
                "image prompt is empty".to_string(),
            )));
        }

        if cancel.is_cancelled() {
            return Err(ImageGenerationError::Cancelled);
        }

        // Fetched once per job so an IAM refresh cannot land between polls.
        let credentials = self.credentials.credentials().await?;
        let operation_id = self.provider.submit(prompt, &credentials).await?;
        tracing::debug!(%operation_id, "Image operation submitted");

        let mut state = JobState::Submitted { operation_id };
        loop {
            let Some(operation_id) = state.operation_id().map(str::to_string) else {
                break;
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ImageGenerationError::Cancelled),
                _ = tokio::time::sleep(self.policy.interval) => {}
            }

            let status = self.provider.poll(&operation_id, &credentials).await?;
            state = state.advance(status, self.policy.max_attempts);
            metrics::record_image_poll();
        }

        match state {
            JobState::Done { image_base64 } => Ok(image_base64),
            JobState::Failed { message } => Err(ImageGenerationError::Failed(message)),
            JobState::TimedOut { attempts } => Err(ImageGenerationError::TimedOut { attempts }),
            JobState::Submitted { .. } | JobState::Polling { .. } => Err(
                ImageGenerationError::Failed("job ended in a non-terminal state".to_string()),
            ),
        }
    }

    async fn save_debug_copy(&self, image_base64: &str) {
        let Some(dir) = &self.save_dir else { return };

        let bytes = match base64::engine::general_purpose::STANDARD.decode(image_base64.trim()) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "Generated image is not valid base64, not saving");
                return;
            }
        };
        let path = dir.join(format!("{}.jpeg", uuid::Uuid::new_v4()));
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!(error = %e, dir = %dir.display(), "Cannot create image save dir");
            return;
        }
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Saved generated image"),
            Err(e) => tracing::warn!(error = %e, path = %path.display(), "Failed to save image"),
        }
    }
}
