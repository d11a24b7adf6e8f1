//! Streaming generation relay.
//!
//! Forwards provider fragments to the caller as they arrive and finishes with
//! exactly one terminal event: `Done` with the concatenated content, or
//! `Error`. The relay stops reading upstream as soon as the caller drops the
//! stream, the cancellation token fires, or the overall timeout elapses.

use crate::models::{GenerationEvent, Language, StepKind};
use crate::services::metrics;
use crate::services::providers::{GenerationParams, ProviderError, StreamChunk, TextProvider};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub type RelayStream = Pin<Box<dyn Stream<Item = GenerationEvent> + Send>>;

/// One generation to relay.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub prompt: String,
    pub step: StepKind,
    pub language: Language,
    pub params: GenerationParams,
}

#[derive(Clone)]
pub struct GenerationRelay {
    provider: Arc<dyn TextProvider>,
    timeout: Duration,
}

enum RelayFailure {
    Provider(ProviderError),
    TimedOut,
    Cancelled,
}

impl GenerationRelay {
    pub fn new(provider: Arc<dyn TextProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn provider(&self) -> &Arc<dyn TextProvider> {
        &self.provider
    }

    /// Start relaying. The returned stream is finite and always ends with a
    /// terminal event unless the caller stopped listening.
    pub fn stream(&self, request: RelayRequest, cancel: CancellationToken) -> RelayStream {
        let (tx, rx) = mpsc::channel(32);
        let provider = self.provider.clone();
        let timeout = self.timeout;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut content = String::new();
            let step = request.step.as_str();

            tracing::info!(
                step,
                language = request.language.code(),
                provider = provider.name(),
                prompt_len = request.prompt.len(),
                "Starting streamed generation"
            );

            let outcome = pump(
                provider.as_ref(),
                &request,
                &tx,
                &mut content,
                &cancel,
                tokio::time::Instant::now() + timeout,
            )
            .await;

            let (terminal, label) = match outcome {
                Ok(()) => (Some(GenerationEvent::done(content.clone(), started.elapsed())), "completed"),
                Err(RelayFailure::Provider(e)) => {
                    tracing::warn!(step, error = %e, emitted = content.len(), "Generation failed");
                    (Some(GenerationEvent::error(e)), "failed")
                }
                Err(RelayFailure::TimedOut) => {
                    tracing::warn!(step, timeout_secs = timeout.as_secs(), "Generation timed out");
                    (
                        Some(GenerationEvent::error(format!(
                            "generation timed out after {} seconds",
                            timeout.as_secs()
                        ))),
                        "timed_out",
                    )
                }
                Err(RelayFailure::Cancelled) => {
                    tracing::info!(step, emitted = content.len(), "Generation cancelled");
                    (None, "cancelled")
                }
            };

            let tokens = crate::models::generation::approx_tokens(&content);
            metrics::record_generation(step, label, tokens, started.elapsed());

            if let Some(event) = terminal {
                let _ = tx.send(event).await;
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

async fn pump(
    provider: &dyn TextProvider,
    request: &RelayRequest,
    tx: &mpsc::Sender<GenerationEvent>,
    content: &mut String,
    cancel: &CancellationToken,
    deadline: tokio::time::Instant,
) -> Result<(), RelayFailure> {
    let mut upstream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RelayFailure::Cancelled),
        _ = tx.closed() => return Err(RelayFailure::Cancelled),
        _ = tokio::time::sleep_until(deadline) => return Err(RelayFailure::TimedOut),
        started = provider.generate_stream(&request.prompt, &request.params) => {
            started.map_err(RelayFailure::Provider)?
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RelayFailure::Cancelled),
            _ = tx.closed() => return Err(RelayFailure::Cancelled),
            _ = tokio::time::sleep_until(deadline) => return Err(RelayFailure::TimedOut),
            next = upstream.next() => next,
        };

        match next {
            None | Some(Ok(StreamChunk::Complete { .. })) => return Ok(()),
            Some(Ok(StreamChunk::Text(text))) => {
                if text.is_empty() {
                    continue;
                }
                content.push_str(&text);
                if tx.send(GenerationEvent::chunk(text)).await.is_err() {
                    return Err(RelayFailure::Cancelled);
                }
            }
            Some(Err(e)) => return Err(RelayFailure::Provider(e)),
        }
    }
}

/// System message for the requested output language.
pub fn system_prompt(language: Language) -> &'static str {
    match language {
        Language::En => "You are a helpful assistant that prepares presentations. Answer in English.",
        Language::Ru => "Ты помощник, который готовит презентации. Отвечай на русском языке.",
    }
}
