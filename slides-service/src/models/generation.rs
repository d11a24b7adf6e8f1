//! Generation request and streamed event models.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use validator::Validate;

/// Which step of the presentation wizard a prompt is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum StepKind {
    #[default]
    Outline,
    Speech,
    Slides,
    HtmlSlides,
}

impl StepKind {
    pub const ALL: [StepKind; 4] = [
        StepKind::Outline,
        StepKind::Speech,
        StepKind::Slides,
        StepKind::HtmlSlides,
    ];

    /// Lenient parse: anything unrecognised is treated as `outline`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "speech" => StepKind::Speech,
            "slides" => StepKind::Slides,
            "html_slides" | "htmlslides" => StepKind::HtmlSlides,
            _ => StepKind::Outline,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Outline => "outline",
            StepKind::Speech => "speech",
            StepKind::Slides => "slides",
            StepKind::HtmlSlides => "html_slides",
        }
    }
}

impl From<String> for StepKind {
    fn from(value: String) -> Self {
        StepKind::parse(&value)
    }
}

/// Prompt language. Unknown codes fall back to English.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum Language {
    #[default]
    En,
    Ru,
}

impl Language {
    pub fn parse(value: &str) -> Self {
        let code = value.trim().to_ascii_lowercase();
        if code == "ru" || code.starts_with("ru-") || code.starts_with("ru_") {
            Language::Ru
        } else {
            Language::En
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Ru => "ru",
        }
    }
}

impl From<String> for Language {
    fn from(value: String) -> Self {
        Language::parse(&value)
    }
}

/// Body of `POST /api/generate`.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    #[validate(length(min = 1, message = "Topic is required"))]
    pub topic: String,

    #[serde(default)]
    pub audience: String,

    /// Free-form label such as `"10"` or `"15 minutes"`.
    #[serde(default, alias = "durationMinutes", deserialize_with = "string_or_number")]
    pub duration: String,

    #[serde(default)]
    pub key_points: Vec<String>,

    #[serde(default, alias = "stepKind")]
    pub step_type: StepKind,

    #[serde(default)]
    pub previous_content: Option<String>,

    #[serde(default)]
    pub language: Language,
}

impl GenerationRequest {
    pub fn new(topic: impl Into<String>, step_type: StepKind) -> Self {
        Self {
            topic: topic.into(),
            audience: String::new(),
            duration: String::new(),
            key_points: Vec::new(),
            step_type,
            previous_content: None,
            language: Language::default(),
        }
    }

    /// Trim the topic and drop blank key points before validation.
    pub fn normalize(mut self) -> Self {
        self.topic = self.topic.trim().to_string();
        self.key_points = self
            .key_points
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self.previous_content = self
            .previous_content
            .filter(|c| !c.trim().is_empty());
        self
    }

    /// `html_slides` renders the slides step's output, so it cannot run without it.
    pub fn requires_previous_content(&self) -> bool {
        self.step_type == StepKind::HtmlSlides
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "duration must be a string or number, got {}",
            other
        ))),
    }
}

/// Crude token estimate used for display and session accounting: a quarter
/// of the UTF-16 length, which is what browser clients compute for the same
/// text.
pub fn approx_tokens(text: &str) -> usize {
    text.encode_utf16().count() / 4
}

/// One server-sent event of a streamed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GenerationEvent {
    Chunk {
        chunk: String,
    },
    Done {
        done: bool,
        content: String,
        #[serde(rename = "tokensUsed")]
        tokens_used: usize,
        /// Elapsed milliseconds.
        duration: u64,
    },
    Error {
        error: String,
    },
}

impl GenerationEvent {
    pub fn chunk(text: impl Into<String>) -> Self {
        GenerationEvent::Chunk { chunk: text.into() }
    }

    pub fn done(content: String, elapsed: Duration) -> Self {
        GenerationEvent::Done {
            tokens_used: approx_tokens(&content),
            content,
            done: true,
            duration: elapsed.as_millis() as u64,
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        GenerationEvent::Error {
            error: format!("Error: {}", message),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationEvent::Chunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_step_falls_back_to_outline() {
        assert_eq!(StepKind::parse("html-slides"), StepKind::HtmlSlides);
        assert_eq!(StepKind::parse("SPEECH"), StepKind::Speech);
        assert_eq!(StepKind::parse("summary"), StepKind::Outline);
        assert_eq!(StepKind::parse(""), StepKind::Outline);
    }

    #[test]
    fn test_language_parse() {
        assert_eq!(Language::parse("ru"), Language::Ru);
        assert_eq!(Language::parse("ru-RU"), Language::Ru);
        assert_eq!(Language::parse("de"), Language::En);
    }

    #[test]
    fn test_request_deserializes_camel_case_and_numeric_duration() {
        let req: GenerationRequest = serde_json::from_str(
            r#"{"topic":"Cats","duration":10,"keyPoints":["a"," ",""],"stepType":"html_slides","previousContent":"x","language":"ru"}"#,
        )
        .unwrap();
        let req = req.normalize();

        assert_eq!(req.duration, "10");
        assert_eq!(req.key_points, vec!["a".to_string()]);
        assert_eq!(req.step_type, StepKind::HtmlSlides);
        assert_eq!(req.language, Language::Ru);
        assert!(req.requires_previous_content());
    }

    #[test]
    fn test_unknown_step_type_in_json() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"topic":"Cats","stepType":"mystery"}"#).unwrap();
        assert_eq!(req.step_type, StepKind::Outline);
        assert_eq!(req.language, Language::En);
    }

    #[test]
    fn test_blank_topic_fails_validation() {
        let req = GenerationRequest::new("   ", StepKind::Outline).normalize();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_token_estimate_counts_utf16_units() {
        assert_eq!(approx_tokens("abcdefghi"), 2);
        // Each emoji is two UTF-16 units.
        assert_eq!(approx_tokens("🐱🐱"), 1);
        assert_eq!(approx_tokens("кошки"), 1);
    }

    #[test]
    fn test_done_event_shape() {
        let event = GenerationEvent::done("abcdefghi".to_string(), Duration::from_millis(42));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["done"], true);
        assert_eq!(json["content"], "abcdefghi");
        assert_eq!(json["tokensUsed"], 2);
        assert_eq!(json["duration"], 42);
        assert!(event.is_terminal());
    }

    #[test]
    fn test_event_round_trips_through_untagged_json() {
        let parsed: GenerationEvent = serde_json::from_str(r#"{"error":"Error: boom"}"#).unwrap();
        assert_eq!(
            parsed,
            GenerationEvent::Error {
                error: "Error: boom".to_string()
            }
        );
        let parsed: GenerationEvent = serde_json::from_str(r#"{"chunk":"hi"}"#).unwrap();
        assert_eq!(parsed, GenerationEvent::chunk("hi"));
    }
}
