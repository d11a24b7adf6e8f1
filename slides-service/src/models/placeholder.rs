//! Image placeholder descriptors and per-placeholder results.

use serde::{Deserialize, Serialize};

/// Textual encoding a placeholder was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlaceholderKind {
    /// `<!-- IMAGE_PLACEHOLDER:prompt:description -->`
    Comment,
    /// `<div class="image-placeholder" data-prompt="...">...</div>`
    DivDataPrompt,
    /// `<div class="image-placeholder">prompt: description</div>`
    DivLegacy,
}

/// A marker in generated HTML where an image should be inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePlaceholder {
    /// Exact substring of the source HTML, replaced verbatim on substitution.
    pub full_match: String,
    pub prompt: String,
    pub description: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: PlaceholderKind,
    /// Byte offset of `full_match` in the snapshot it was extracted from.
    #[serde(default)]
    pub position: usize,
}

/// Outcome of generating one placeholder's image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum ImageResult {
    Generated { base64: String },
    Failed { error: String },
}

impl ImageResult {
    pub fn is_generated(&self) -> bool {
        matches!(self, ImageResult::Generated { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ImageResult::Failed { error } => Some(error),
            ImageResult::Generated { .. } => None,
        }
    }
}
