//! Mock provider implementations for testing and offline development.

use super::{
    Credentials, FinishReason, GenerationParams, ImageProvider, OperationStatus, ProviderError,
    ProviderStream, StreamChunk, TextProvider,
};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// 1x1 transparent PNG.
pub const MOCK_IMAGE_BASE64: &str =
    "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNkYAAAAAYAAjCB0C8AAAAASUVORK5CYII=";

/// Mock text provider for testing.
///
/// Streams a fixed list of fragments, optionally failing after some of them.
pub struct MockTextProvider {
    enabled: bool,
    chunks: Option<Vec<String>>,
    fail_after: Option<usize>,
    delay: Duration,
}

impl MockTextProvider {
    /// Echo-style provider: the fragments mention the start of the prompt.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            chunks: None,
            fail_after: None,
            delay: Duration::ZERO,
        }
    }

    pub fn with_chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: Some(chunks.into_iter().map(Into::into).collect()),
            ..Self::new(true)
        }
    }

    /// Emit an error after `count` fragments instead of completing.
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    /// Pause before every fragment.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn fragments_for(&self, prompt: &str) -> Vec<String> {
        if let Some(chunks) = &self.chunks {
            return chunks.clone();
        }
        let first_line = prompt.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        vec![
            "Mock".to_string(),
            " streaming".to_string(),
            " response".to_string(),
            " for:".to_string(),
            format!(" {}", first_line.trim()),
        ]
    }
}

#[async_trait]
impl TextProvider for MockTextProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        _params: &GenerationParams,
    ) -> Result<ProviderStream, ProviderError> {
        if !self.enabled {
            return Err(ProviderError::NotConfigured(
                "Mock text provider not enabled".to_string(),
            ));
        }

        let mut items: Vec<Result<StreamChunk, ProviderError>> = Vec::new();
        for (i, fragment) in self.fragments_for(prompt).into_iter().enumerate() {
            if self.fail_after == Some(i) {
                break;
            }
            items.push(Ok(StreamChunk::Text(fragment)));
        }
        match self.fail_after {
            Some(count) if count <= items.len() => items.push(Err(ProviderError::NetworkError(
                "mock upstream closed the connection".to_string(),
            ))),
            _ => items.push(Ok(StreamChunk::Complete {
                finish_reason: FinishReason::Complete,
            })),
        }

        let delay = self.delay;
        let stream = futures::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(Box::pin(stream))
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        if self.enabled {
            Ok(())
        } else {
            Err(ProviderError::NotConfigured(
                "Mock text provider not enabled".to_string(),
            ))
        }
    }
}

/// Mock image provider for testing.
///
/// Every operation reports `Pending` for a configurable number of polls and
/// then completes with [`MOCK_IMAGE_BASE64`]. Prompts containing the failure
/// marker finish with an error instead.
pub struct MockImageProvider {
    pending_polls: u32,
    fail_marker: Option<String>,
    never_completes: bool,
    operations: DashMap<String, (String, u32)>,
    submits: AtomicU32,
    polls: AtomicU32,
}

impl MockImageProvider {
    pub fn new(pending_polls: u32) -> Self {
        Self {
            pending_polls,
            fail_marker: None,
            never_completes: false,
            operations: DashMap::new(),
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
        }
    }

    /// Operations whose prompt contains `marker` fail when they finish.
    pub fn failing_on(mut self, marker: impl Into<String>) -> Self {
        self.fail_marker = Some(marker.into());
        self
    }

    /// Operations stay pending forever.
    pub fn never_completing() -> Self {
        Self {
            never_completes: true,
            ..Self::new(0)
        }
    }

    pub fn submit_count(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn poll_count(&self) -> u32 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Operations submitted but not yet finished.
    pub fn open_operations(&self) -> usize {
        self.operations.len()
    }

    fn status_of(&self, prompt: &str, polls: u32) -> OperationStatus {
        if self.never_completes || polls <= self.pending_polls {
            return OperationStatus::Pending;
        }
        if let Some(marker) = &self.fail_marker {
            if prompt.contains(marker.as_str()) {
                return OperationStatus::Failed {
                    message: format!("mock failure for prompt '{}'", prompt),
                };
            }
        }
        OperationStatus::Done {
            image_base64: MOCK_IMAGE_BASE64.to_string(),
        }
    }
}

impl Default for MockImageProvider {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ImageProvider for MockImageProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn submit(
        &self,
        prompt: &str,
        _credentials: &Credentials,
    ) -> Result<String, ProviderError> {
        if prompt.trim().is_empty() {
            return Err(ProviderError::InvalidRequest("empty prompt".to_string()));
        }
        self.submits.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-op-{}", uuid::Uuid::new_v4());
        self.operations.insert(id.clone(), (prompt.to_string(), 0));
        Ok(id)
    }

    async fn poll(
        &self,
        operation_id: &str,
        _credentials: &Credentials,
    ) -> Result<OperationStatus, ProviderError> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let status = {
            let mut entry = self.operations.get_mut(operation_id).ok_or_else(|| {
                ProviderError::InvalidRequest(format!("unknown operation {}", operation_id))
            })?;
            let (prompt, polls) = entry.value_mut();
            *polls += 1;
            self.status_of(prompt, *polls)
        };

        // Finished operations are forgotten, like the real API expiring them.
        if status != OperationStatus::Pending {
            self.operations.remove(operation_id);
        }
        Ok(status)
    }
}
