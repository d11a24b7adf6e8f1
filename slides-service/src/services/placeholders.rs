//! Finding image placeholders in generated HTML and replacing them.
//!
//! Three encodings are recognised:
//!
//! - `<!-- IMAGE_PLACEHOLDER:prompt:description -->`
//! - `<div class="image-placeholder" data-prompt="prompt">description</div>`
//! - `<div class="image-placeholder">prompt: description</div>`
//!
//! Candidates from all encodings are merged by start offset. When two
//! candidates overlap, the one that starts first wins and the other is dropped,
//! so every returned `full_match` is a disjoint substring of the input.

use crate::models::{ImagePlaceholder, ImageResult, PlaceholderKind};
use regex::Regex;
use std::sync::OnceLock;

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<!--\s*IMAGE_PLACEHOLDER\s*:(?P<body>.*?)-->").expect("valid regex")
    })
}

/// A `<div>` whose class list contains exactly `image-placeholder`.
fn div_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?is)<div\b(?P<attrs>[^>]*?\bclass\s*=\s*(?:"(?:[^"]*\s)?image-placeholder(?:\s[^"]*)?"|'(?:[^']*\s)?image-placeholder(?:\s[^']*)?')[^>]*)>(?P<inner>.*?)</div\s*>"#,
        )
        .expect("valid regex")
    })
}

fn data_prompt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\bdata-prompt\s*=\s*(?:"(?P<dq>[^"]*)"|'(?P<sq>[^']*)')"#)
            .expect("valid regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid regex"))
}

/// All placeholders in document order. Malformed markers are skipped.
pub fn extract(html: &str) -> Vec<ImagePlaceholder> {
    let mut candidates: Vec<(usize, usize, ImagePlaceholder)> = Vec::new();

    for caps in comment_re().captures_iter(html) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.name("body")) else {
            continue;
        };
        if let Some((prompt, description)) = split_comment_body(body.as_str()) {
            candidates.push((
                whole.start(),
                whole.end(),
                ImagePlaceholder {
                    full_match: whole.as_str().to_string(),
                    prompt,
                    description,
                    kind: PlaceholderKind::Comment,
                    position: whole.start(),
                },
            ));
        }
    }

    for caps in div_re().captures_iter(html) {
        let Some(whole) = caps.get(0) else { continue };
        let attrs = caps.name("attrs").map(|m| m.as_str()).unwrap_or("");
        let inner = caps.name("inner").map(|m| m.as_str()).unwrap_or("");

        if let Some((prompt, description, kind)) = parse_div(attrs, inner) {
            candidates.push((
                whole.start(),
                whole.end(),
                ImagePlaceholder {
                    full_match: whole.as_str().to_string(),
                    prompt,
                    description,
                    kind,
                    position: whole.start(),
                },
            ));
        }
    }

    // Stable sort keeps comments ahead of divs that start at the same offset.
    candidates.sort_by_key(|(start, _, _)| *start);

    let mut accepted = Vec::with_capacity(candidates.len());
    let mut covered_until = 0;
    for (start, end, placeholder) in candidates {
        if start < covered_until {
            tracing::debug!(position = start, "Dropping overlapping image placeholder");
            continue;
        }
        covered_until = end;
        accepted.push(placeholder);
    }
    accepted
}

/// `prompt:description`, split on the last colon so prompts may contain colons.
fn split_comment_body(body: &str) -> Option<(String, String)> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    let (prompt, description) = match body.rsplit_once(':') {
        Some((prompt, description)) => (prompt.trim(), description.trim()),
        None => (body, ""),
    };
    if prompt.is_empty() {
        return None;
    }
    let description = if description.is_empty() { prompt } else { description };
    Some((prompt.to_string(), description.to_string()))
}

/// Both div forms drop a leading caption label first, so a legacy
/// `Image: a red apple` uses `a red apple` as its prompt.
fn parse_div(attrs: &str, inner: &str) -> Option<(String, String, PlaceholderKind)> {
    let text = strip_label(&inner_text(inner)).to_string();

    let data_prompt = data_prompt_re().captures(attrs).and_then(|caps| {
        caps.name("dq")
            .or_else(|| caps.name("sq"))
            .map(|m| decode_entities(m.as_str()).trim().to_string())
    });

    match data_prompt {
        Some(prompt) => {
            let prompt = if prompt.is_empty() { text.clone() } else { prompt };
            if prompt.is_empty() {
                return None;
            }
            let description = if text.is_empty() { prompt.clone() } else { text };
            Some((prompt, description, PlaceholderKind::DivDataPrompt))
        }
        None => {
            if text.is_empty() {
                return None;
            }
            let (prompt, description) = match text.split_once(':') {
                Some((prompt, description)) if !prompt.trim().is_empty() => {
                    let description = description.trim();
                    let description = if description.is_empty() { prompt.trim() } else { description };
                    (prompt.trim().to_string(), description.to_string())
                }
                _ => (text.clone(), text.clone()),
            };
            Some((prompt, description, PlaceholderKind::DivLegacy))
        }
    }
}

/// Visible text of a fragment: tags removed, entities decoded, whitespace collapsed.
fn inner_text(fragment: &str) -> String {
    let without_tags = tag_re().replace_all(fragment, " ");
    decode_entities(&without_tags)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Drop a leading caption label such as `Image:`.
fn strip_label(text: &str) -> &str {
    for label in ["image:", "изображение:"] {
        let head: String = text.chars().take(label.chars().count()).collect();
        if head.to_lowercase() == label {
            return text[head.len()..].trim_start();
        }
    }
    text
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
}

/// Escape text for use in HTML content or a quoted attribute.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Replace the first occurrence of `placeholder.full_match`.
///
/// Returns `html` unchanged when the marker is no longer present, e.g. when
/// the descriptor came from an older snapshot.
pub fn substitute(html: &str, placeholder: &ImagePlaceholder, result: &ImageResult) -> String {
    if placeholder.full_match.is_empty() || !html.contains(&placeholder.full_match) {
        return html.to_string();
    }
    html.replacen(&placeholder.full_match, &render_replacement(placeholder, result), 1)
}

fn render_replacement(placeholder: &ImagePlaceholder, result: &ImageResult) -> String {
    let description = escape_html(&placeholder.description);
    match result {
        ImageResult::Generated { base64 } => format!(
            r#"<img src="data:{};base64,{}" alt="{}" class="generated-image" style="max-width: 100%; height: auto; border-radius: 8px;" />"#,
            image_mime(base64),
            escape_html(base64.trim()),
            description
        ),
        ImageResult::Failed { error } => format!(
            concat!(
                r#"<div class="image-placeholder-fallback" style="padding: 24px; border: 2px dashed #ccc; border-radius: 8px; text-align: center; color: #666;">"#,
                r#"<p>Image: {}</p>"#,
                r#"<p class="image-error" style="font-size: 0.85em; color: #c33;">{}</p>"#,
                "</div>"
            ),
            description,
            escape_html(error)
        ),
    }
}

/// Sniff the image type from the first base64 characters.
fn image_mime(base64: &str) -> &'static str {
    let head = base64.trim_start();
    if head.starts_with("iVBOR") {
        "image/png"
    } else if head.starts_with("R0lGOD") {
        "image/gif"
    } else if head.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/jpeg"
    }
}
