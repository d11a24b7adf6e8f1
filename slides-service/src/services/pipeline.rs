//! Resolves image placeholders in a deck, one at a time.
//!
//! Placeholders are extracted once from the submitted snapshot and processed
//! sequentially; each result is substituted into the evolving document before
//! the next job starts. A failed image never aborts the batch: its
//! placeholder gets the fallback block and processing moves on.

use crate::models::{ImagePlaceholder, ImageResult};
use crate::services::images::{ImageGenerationError, ImageGenerator};
use crate::services::placeholders::{extract, substitute};
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("placeholderIndex {index} is out of range ({total} placeholders found)")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("placeholder is not present in htmlContent")]
    PlaceholderNotFound,

    #[error("Image generation cancelled")]
    Cancelled,
}

/// Outcome of resolving one placeholder.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderOutcome {
    pub index: usize,
    pub placeholder: ImagePlaceholder,
    pub result: ImageResult,
}

/// Progress after each placeholder of a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub outcome: PlaceholderOutcome,
    pub total: usize,
    pub images_generated: usize,
    pub html_content: String,
}

/// Final state of a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub html_content: String,
    pub total_placeholders: usize,
    pub images_generated: usize,
    pub images_failed: usize,
}

#[derive(Clone)]
pub struct ImagePipeline {
    generator: Arc<ImageGenerator>,
}

impl ImagePipeline {
    pub fn new(generator: Arc<ImageGenerator>) -> Self {
        Self { generator }
    }

    pub fn provider_name(&self) -> &'static str {
        self.generator.provider_name()
    }

    /// Generate the image for one descriptor, mapping failures to a result.
    /// `Err` only on cancellation.
    async fn generate(
        &self,
        placeholder: &ImagePlaceholder,
        cancel: &CancellationToken,
    ) -> Result<ImageResult, PipelineError> {
        match self.generator.generate(&placeholder.prompt, cancel).await {
            Ok(base64) => Ok(ImageResult::Generated { base64 }),
            Err(ImageGenerationError::Cancelled) => Err(PipelineError::Cancelled),
            Err(e) => Ok(ImageResult::Failed {
                error: e.to_string(),
            }),
        }
    }

    /// Resolve a caller-supplied descriptor against `html`.
    ///
    /// A descriptor that does not match any placeholder of `html` (a stale
    /// snapshot) is rejected before any image job is submitted.
    pub async fn resolve_descriptor(
        &self,
        html: &str,
        placeholder: ImagePlaceholder,
        cancel: &CancellationToken,
    ) -> Result<(String, PlaceholderOutcome), PipelineError> {
        let index = extract(html)
            .iter()
            .position(|p| p.full_match == placeholder.full_match)
            .ok_or(PipelineError::PlaceholderNotFound)?;
        let result = self.generate(&placeholder, cancel).await?;
        let updated = substitute(html, &placeholder, &result);

        Ok((
            updated,
            PlaceholderOutcome {
                index,
                placeholder,
                result,
            },
        ))
    }

    /// Resolve the `index`-th placeholder of `html`.
    pub async fn resolve_index(
        &self,
        html: &str,
        index: usize,
        cancel: &CancellationToken,
    ) -> Result<(String, PlaceholderOutcome), PipelineError> {
        let mut placeholders = extract(html);
        let total = placeholders.len();
        if index >= total {
            return Err(PipelineError::IndexOutOfRange { index, total });
        }
        let placeholder = placeholders.swap_remove(index);
        let result = self.generate(&placeholder, cancel).await?;
        let updated = substitute(html, &placeholder, &result);

        Ok((
            updated,
            PlaceholderOutcome {
                index,
                placeholder,
                result,
            },
        ))
    }

    /// Resolve every placeholder, yielding progress after each one.
    ///
    /// The stream ends early, without further items, if `cancel` fires.
    pub fn resolve_all_stream(
        &self,
        html: String,
        cancel: CancellationToken,
    ) -> impl Stream<Item = BatchProgress> + Send + 'static {
        let placeholders = extract(&html);
        let total = placeholders.len();
        let pipeline = self.clone();

        futures::stream::unfold(
            (html, placeholders.into_iter().enumerate(), 0usize),
            move |(html, mut pending, generated)| {
                let pipeline = pipeline.clone();
                let cancel = cancel.clone();
                async move {
                    let (index, placeholder) = pending.next()?;
                    let result = pipeline.generate(&placeholder, &cancel).await.ok()?;

                    let html = substitute(&html, &placeholder, &result);
                    let generated = generated + usize::from(result.is_generated());
                    let progress = BatchProgress {
                        outcome: PlaceholderOutcome {
                            index,
                            placeholder,
                            result,
                        },
                        total,
                        images_generated: generated,
                        html_content: html.clone(),
                    };
                    Some((progress, (html, pending, generated)))
                }
            },
        )
    }

    /// Resolve every placeholder and return the final document.
    pub async fn resolve_all(
        &self,
        html: String,
        cancel: CancellationToken,
    ) -> Result<BatchSummary, PipelineError> {
        use futures::StreamExt;

        let total = extract(&html).len();
        let mut summary = BatchSummary {
            html_content: html.clone(),
            total_placeholders: total,
            images_generated: 0,
            images_failed: 0,
        };

        let stream = self.resolve_all_stream(html, cancel.clone());
        futures::pin_mut!(stream);
        let mut processed = 0;
        while let Some(progress) = stream.next().await {
            processed += 1;
            if !progress.outcome.result.is_generated() {
                summary.images_failed += 1;
            }
            summary.images_generated = progress.images_generated;
            summary.html_content = progress.html_content;
        }

        if processed < total && cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(summary)
    }
}
