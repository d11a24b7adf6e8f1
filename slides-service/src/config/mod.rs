use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Overall budget for one streamed generation; the provider transport has no
/// limit of its own.
const DEFAULT_STREAM_TIMEOUT_SECS: u64 = 300;
const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 10;
const DEFAULT_SESSION_TTL_DAYS: i64 = 7;
const DEFAULT_SESSION_MAX_ACTIONS: usize = 100;

#[derive(Debug, Clone)]
pub struct SlidesConfig {
    pub common: core_config::Config,
    pub text: TextProviderConfig,
    pub image: ImageProviderConfig,
    pub sessions: SessionConfig,
    pub rate_limit: RateLimitConfig,
    /// Browser origins allowed to call the API with credentials.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextProviderKind {
    /// OpenAI-compatible chat completions (DeepSeek, OpenAI, vLLM, ...).
    OpenAi,
    Mock,
}

#[derive(Debug, Clone)]
pub struct TextProviderConfig {
    pub kind: TextProviderKind,
    pub api_base: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageProviderKind {
    /// Submit-then-poll cloud image API.
    Async,
    Mock,
}

#[derive(Debug, Clone)]
pub struct ImageProviderConfig {
    pub kind: ImageProviderKind,
    pub api_base: String,
    pub operations_base: String,
    pub model_uri: String,
    /// Static API key. Takes precedence over the service account key.
    pub api_key: Option<String>,
    /// Service account key file exchanged for short-lived IAM tokens.
    pub service_account_key_file: Option<PathBuf>,
    pub iam_url: String,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// Debug only: write every decoded image here.
    pub save_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Mongo,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub backend: SessionBackend,
    pub mongodb_uri: Option<String>,
    pub mongodb_database: String,
    pub ttl: chrono::Duration,
    pub max_actions: usize,
    pub cookie_secure: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub generation_requests: u32,
    pub window_seconds: u64,
}

impl SlidesConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let text_kind = match get_env("TEXT_PROVIDER", Some("openai"), is_prod)?.as_str() {
            "mock" => TextProviderKind::Mock,
            "openai" => TextProviderKind::OpenAi,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown TEXT_PROVIDER '{}', expected 'openai' or 'mock'",
                    other
                )))
            }
        };
        let image_kind = match get_env("IMAGE_PROVIDER", Some("async"), is_prod)?.as_str() {
            "mock" => ImageProviderKind::Mock,
            "async" => ImageProviderKind::Async,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown IMAGE_PROVIDER '{}', expected 'async' or 'mock'",
                    other
                )))
            }
        };
        let backend = match get_env("SESSION_BACKEND", Some("memory"), is_prod)?.as_str() {
            "memory" => SessionBackend::Memory,
            "mongo" => SessionBackend::Mongo,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown SESSION_BACKEND '{}', expected 'memory' or 'mongo'",
                    other
                )))
            }
        };

        // Mock providers never touch the network, so their keys may be blank.
        let text_key_default = (text_kind == TextProviderKind::Mock).then_some("");

        let config = SlidesConfig {
            common: common_config,
            text: TextProviderConfig {
                kind: text_kind,
                api_base: get_env("TEXT_API_BASE", Some("https://api.deepseek.com/v1"), is_prod)?,
                api_key: get_env("TEXT_API_KEY", text_key_default, is_prod)?,
                model: get_env("TEXT_MODEL", Some("deepseek-chat"), is_prod)?,
                temperature: parse_env("TEXT_TEMPERATURE", 0.7)?,
                max_tokens: parse_env("TEXT_MAX_TOKENS", 4_000)?,
                stream_timeout: Duration::from_secs(parse_env("TEXT_STREAM_TIMEOUT_SECS", DEFAULT_STREAM_TIMEOUT_SECS)?),
            },
            image: ImageProviderConfig {
                kind: image_kind,
                api_base: get_env(
                    "IMAGE_API_BASE",
                    Some("https://llm.api.cloud.yandex.net/foundationModels/v1"),
                    is_prod,
                )?,
                operations_base: get_env(
                    "IMAGE_OPERATIONS_BASE",
                    Some("https://llm.api.cloud.yandex.net/operations"),
                    is_prod,
                )?,
                model_uri: get_env("IMAGE_MODEL_URI", Some(""), is_prod)?,
                api_key: optional_env("IMAGE_API_KEY"),
                service_account_key_file: optional_env("IMAGE_SA_KEY_FILE").map(PathBuf::from),
                iam_url: get_env(
                    "IMAGE_IAM_URL",
                    Some("https://iam.api.cloud.yandex.net/iam/v1/tokens"),
                    is_prod,
                )?,
                poll_interval: Duration::from_millis(parse_env("IMAGE_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?),
                max_poll_attempts: parse_env("IMAGE_MAX_POLL_ATTEMPTS", DEFAULT_MAX_POLL_ATTEMPTS)?,
                save_dir: optional_env("IMAGE_SAVE_DIR").map(PathBuf::from),
            },
            sessions: SessionConfig {
                backend,
                mongodb_uri: optional_env("MONGODB_URI"),
                mongodb_database: get_env("MONGODB_DATABASE", Some("slides_db"), is_prod)?,
                ttl: chrono::Duration::days(parse_env("SESSION_TTL_DAYS", DEFAULT_SESSION_TTL_DAYS)?),
                max_actions: parse_env("SESSION_MAX_ACTIONS", DEFAULT_SESSION_MAX_ACTIONS)?,
                cookie_secure: parse_env("SESSION_COOKIE_SECURE", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                generation_requests: parse_env("GENERATION_RATE_LIMIT", 30)?,
                window_seconds: parse_env("GENERATION_RATE_WINDOW_SECS", 60)?,
            },
            allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        };

        config.check()?;
        Ok(config)
    }

    /// Cross-field checks that a single `get_env` cannot express.
    fn check(&self) -> Result<(), AppError> {
        if self.sessions.backend == SessionBackend::Mongo && self.sessions.mongodb_uri.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MONGODB_URI is required when SESSION_BACKEND=mongo"
            )));
        }
        if self.image.kind == ImageProviderKind::Async
            && self.image.api_key.is_none()
            && self.image.service_account_key_file.is_none()
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMAGE_API_KEY or IMAGE_SA_KEY_FILE is required when IMAGE_PROVIDER=async"
            )));
        }
        if self.image.max_poll_attempts == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMAGE_MAX_POLL_ATTEMPTS must be at least 1"
            )));
        }
        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Tunables always have a default, even in production.
fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + ToString,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, Some(&default.to_string()), false)?;
    raw.trim().parse().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} has invalid value '{}': {}", key, raw, e))
    })
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}
