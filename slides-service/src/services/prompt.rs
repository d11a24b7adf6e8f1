//! Prompt builder: maps a generation request to the text prompt for one step.
//!
//! Templates are Tera templates with autoescaping off. Request values go in
//! through the context, so they are inserted verbatim and never re-expanded,
//! even if they contain `{{ topic }}`-like text themselves.

use crate::models::{GenerationRequest, Language, StepKind};
use std::collections::HashSet;
use tera::{Context, Tera};

const OUTLINE_EN: &str = "\
You are an experienced presentation designer.
Create a clear outline for a presentation on the topic \"{{ topic }}\".
Audience: {{ audience }}
Duration: {{ duration }} minutes
Key points to cover:
{{ key_points }}

Return a numbered list of 6-10 sections. For every section give a short title and one or two
sentences describing what it covers. Start with an introduction and finish with a conclusion.";

const SPEECH_EN: &str = "\
You are a professional speechwriter.
Write the full speaker script for a presentation on \"{{ topic }}\".
Audience: {{ audience }}
Duration: {{ duration }} minutes
Key points:
{{ key_points }}

Follow this outline section by section:
{{ previous_content }}

Write natural spoken language, mark each section with its title, and keep the total length
appropriate for the given duration.";

const SLIDES_EN: &str = "\
You are a presentation designer turning a script into slides for \"{{ topic }}\".
Audience: {{ audience }}
Key points:
{{ key_points }}

Speaker script:
{{ previous_content }}

For every slide return:
Slide N: <title>
- 3 to 5 concise bullet points
Image: <one sentence describing a fitting illustration>

Keep bullet points short; the speaker script carries the detail.";

const HTML_SLIDES_EN: &str = "\
You are a front-end developer building an HTML slide deck about \"{{ topic }}\" for {{ audience }}.
Convert the slide content below into a single self-contained HTML document.

Slide content:
{{ previous_content }}

Requirements:
- Every slide is a <section class=\"slide\"> with a heading and a bullet list.
- Use inline CSS only, no external resources or scripts.
- Where a slide needs an illustration, insert exactly this marker on its own line:
  <!-- IMAGE_PLACEHOLDER:<detailed English prompt for an image model>:<short caption> -->
- Do not insert <img> tags yourself.
Return only the HTML.";

const OUTLINE_RU: &str = "\
Ты опытный дизайнер презентаций.
Составь понятный план презентации на тему «{{ topic }}».
Аудитория: {{ audience }}
Длительность: {{ duration }} минут
Ключевые моменты:
{{ key_points }}

Верни нумерованный список из 6-10 разделов. Для каждого раздела дай короткий заголовок и
одно-два предложения о его содержании. Начни с введения и закончи заключением.";

const SPEECH_RU: &str = "\
Ты профессиональный спичрайтер.
Напиши полный текст выступления для презентации на тему «{{ topic }}».
Аудитория: {{ audience }}
Длительность: {{ duration }} минут
Ключевые моменты:
{{ key_points }}

Следуй плану по разделам:
{{ previous_content }}

Пиши живым разговорным языком, отмечай каждый раздел его заголовком и соблюдай объём,
подходящий для указанной длительности.";

const SLIDES_RU: &str = "\
Ты дизайнер презентаций и превращаешь текст выступления в слайды на тему «{{ topic }}».
Аудитория: {{ audience }}
Ключевые моменты:
{{ key_points }}

Текст выступления:
{{ previous_content }}

Для каждого слайда верни:
Слайд N: <заголовок>
- от 3 до 5 кратких тезисов
Изображение: <одно предложение с описанием подходящей иллюстрации>

Тезисы должны быть короткими, подробности остаются в тексте выступления.";

const HTML_SLIDES_RU: &str = "\
Ты фронтенд-разработчик и собираешь HTML-презентацию на тему «{{ topic }}» для аудитории: {{ audience }}.
Преобразуй содержимое слайдов ниже в один самодостаточный HTML-документ.

Содержимое слайдов:
{{ previous_content }}

Требования:
- Каждый слайд это <section class=\"slide\"> с заголовком и списком тезисов.
- Только встроенный CSS, без внешних ресурсов и скриптов.
- Там, где слайду нужна иллюстрация, вставь отдельной строкой ровно такой маркер:
  <!-- IMAGE_PLACEHOLDER:<подробный промпт на английском для модели изображений>:<короткая подпись> -->
- Не вставляй теги <img> самостоятельно.
Верни только HTML.";

/// Template table keyed by step and language.
#[derive(Debug, Clone)]
pub struct PromptTemplates {
    tera: Tera,
    registered: HashSet<(StepKind, Language)>,
    default_language: Language,
}

impl PromptTemplates {
    /// Built-in English and Russian templates for every step.
    pub fn builtin() -> Self {
        let mut templates = Self::empty(Language::En);
        for (step, lang, body) in [
            (StepKind::Outline, Language::En, OUTLINE_EN),
            (StepKind::Speech, Language::En, SPEECH_EN),
            (StepKind::Slides, Language::En, SLIDES_EN),
            (StepKind::HtmlSlides, Language::En, HTML_SLIDES_EN),
            (StepKind::Outline, Language::Ru, OUTLINE_RU),
            (StepKind::Speech, Language::Ru, SPEECH_RU),
            (StepKind::Slides, Language::Ru, SLIDES_RU),
            (StepKind::HtmlSlides, Language::Ru, HTML_SLIDES_RU),
        ] {
            if let Err(e) = templates.insert(step, lang, body) {
                tracing::error!(
                    step = step.as_str(),
                    language = lang.code(),
                    error = %e,
                    "Built-in prompt template does not parse"
                );
            }
        }
        templates
    }

    /// An empty table; combine with [`PromptTemplates::insert`].
    ///
    /// The default language should end up with a template for every step,
    /// otherwise missing steps fall back to its outline template.
    pub fn empty(default_language: Language) -> Self {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![]);
        Self {
            tera,
            registered: HashSet::new(),
            default_language,
        }
    }

    /// Register a template, replacing any previous one for the pair.
    pub fn insert(
        &mut self,
        step: StepKind,
        language: Language,
        body: &str,
    ) -> Result<(), tera::Error> {
        self.tera.add_raw_template(&template_name(step, language), body)?;
        self.registered.insert((step, language));
        Ok(())
    }

    /// Key of the template for `(step, language)`, falling back to the
    /// default language and then to its outline.
    fn resolve(&self, step: StepKind, language: Language) -> Option<(StepKind, Language)> {
        [
            (step, language),
            (step, self.default_language),
            (StepKind::Outline, self.default_language),
        ]
        .into_iter()
        .find(|key| self.registered.contains(key))
    }

    fn render(&self, key: (StepKind, Language), context: &Context) -> Result<String, tera::Error> {
        self.tera.render(&template_name(key.0, key.1), context)
    }
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self::builtin()
    }
}

fn template_name(step: StepKind, language: Language) -> String {
    format!("{}.{}", step.as_str(), language.code())
}

/// Builds prompts from requests using a template table.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    templates: PromptTemplates,
}

impl PromptBuilder {
    pub fn new(templates: PromptTemplates) -> Self {
        Self { templates }
    }

    /// Render the prompt for `step`. Never fails: a template that does not
    /// render falls back to the default-language outline, and an empty table
    /// yields an empty prompt.
    pub fn build(&self, step: StepKind, request: &GenerationRequest) -> String {
        let context = prompt_context(request);
        let Some(key) = self.templates.resolve(step, request.language) else {
            tracing::warn!(step = step.as_str(), "No prompt template registered");
            return String::new();
        };

        match self.templates.render(key, &context) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!(
                    step = step.as_str(),
                    language = key.1.code(),
                    error = %e,
                    "Prompt template failed to render, using outline"
                );
                let outline = (StepKind::Outline, self.templates.default_language);
                if key == outline || !self.templates.registered.contains(&outline) {
                    return String::new();
                }
                self.templates.render(outline, &context).unwrap_or_default()
            }
        }
    }
}

/// Build a prompt with the built-in templates.
pub fn build_prompt(step: StepKind, request: &GenerationRequest) -> String {
    PromptBuilder::default().build(step, request)
}

fn prompt_context(request: &GenerationRequest) -> Context {
    let mut context = Context::new();
    context.insert("topic", &request.topic);
    context.insert("audience", &request.audience);
    context.insert("duration", &request.duration);
    context.insert("key_points", &format_key_points(&request.key_points));
    context.insert(
        "previous_content",
        request.previous_content.as_deref().unwrap_or(""),
    );
    context.insert("language", request.language.code());
    context
}

fn format_key_points(points: &[String]) -> String {
    points
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| format!("- {}", p))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(topic: &str, step: StepKind) -> GenerationRequest {
        let mut req = GenerationRequest::new(topic, step);
        req.audience = "students".to_string();
        req.duration = "10".to_string();
        req.key_points = vec!["history".to_string(), "  ".to_string(), "care".to_string()];
        req
    }

    #[test]
    fn test_every_step_and_language_contains_topic() {
        for step in StepKind::ALL {
            for language in [Language::En, Language::Ru] {
                let mut req = request("Cats", step);
                req.language = language;
                req.previous_content = Some("previous step output".to_string());

                let prompt = build_prompt(step, &req);
                assert!(!prompt.is_empty());
                assert!(prompt.contains("Cats"), "{:?}/{:?}", step, language);
            }
        }
    }

    #[test]
    fn test_blank_key_points_are_dropped() {
        let prompt = build_prompt(StepKind::Outline, &request("Cats", StepKind::Outline));
        assert!(prompt.contains("- history\n- care"));
        assert!(!prompt.contains("-   "));
    }

    #[test]
    fn test_previous_content_is_interpolated() {
        let mut req = request("Cats", StepKind::HtmlSlides);
        req.previous_content = Some("Slide 1: Why cats".to_string());
        let prompt = build_prompt(StepKind::HtmlSlides, &req);

        assert!(prompt.contains("Slide 1: Why cats"));
        assert!(prompt.contains("IMAGE_PLACEHOLDER"));
    }

    #[test]
    fn test_values_are_not_re_expanded_or_escaped() {
        let mut req = request("{{ audience }} & <b>cats</b>", StepKind::Outline);
        req.audience = "vets".to_string();
        let prompt = build_prompt(StepKind::Outline, &req);

        assert!(prompt.contains("\"{{ audience }} & <b>cats</b>\""));
    }

    #[test]
    fn test_builtin_table_is_complete() {
        let templates = PromptTemplates::builtin();
        for step in StepKind::ALL {
            for language in [Language::En, Language::Ru] {
                assert_eq!(templates.resolve(step, language), Some((step, language)));
            }
        }
    }

    #[test]
    fn test_missing_language_falls_back_to_default() {
        let mut templates = PromptTemplates::empty(Language::En);
        templates
            .insert(StepKind::Outline, Language::En, "EN outline {{ topic }}")
            .unwrap();
        templates
            .insert(StepKind::Speech, Language::En, "EN speech {{ topic }}")
            .unwrap();
        templates
            .insert(StepKind::Speech, Language::Ru, "RU speech {{ topic }}")
            .unwrap();
        let builder = PromptBuilder::new(templates);

        let mut req = request("Cats", StepKind::Outline);
        req.language = Language::Ru;

        assert_eq!(builder.build(StepKind::Outline, &req), "EN outline Cats");
        assert_eq!(builder.build(StepKind::Speech, &req), "RU speech Cats");
        // No slides template anywhere: outline in the default language.
        assert_eq!(builder.build(StepKind::Slides, &req), "EN outline Cats");
    }

    #[test]
    fn test_unparseable_template_is_rejected() {
        let mut templates = PromptTemplates::empty(Language::En);
        assert!(templates
            .insert(StepKind::Outline, Language::En, "{{ topic ")
            .is_err());
        assert_eq!(templates.resolve(StepKind::Outline, Language::En), None);

        let builder = PromptBuilder::new(templates);
        assert_eq!(builder.build(StepKind::Outline, &request("Cats", StepKind::Outline)), "");
    }

    #[test]
    fn test_unknown_variable_falls_back_to_outline() {
        let mut templates = PromptTemplates::empty(Language::En);
        templates
            .insert(StepKind::Outline, Language::En, "outline {{ topic }}")
            .unwrap();
        templates
            .insert(StepKind::Speech, Language::En, "speech {{ speaker_name }}")
            .unwrap();
        let builder = PromptBuilder::new(templates);

        let prompt = builder.build(StepKind::Speech, &request("Cats", StepKind::Speech));
        assert_eq!(prompt, "outline Cats");
    }
}
