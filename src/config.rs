//! Configuration types for the interview core.
//!
//! Loaded from TOML; every section falls back to defaults when absent. The
//! backend URL and default model may also be overridden from the environment.

use crate::error::{ApiError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable overriding [`BackendConfig::base_url`].
pub const ENV_API_URL: &str = "VOCALIS_API_URL";
/// Environment variable overriding [`BackendConfig::default_model`].
pub const ENV_DEFAULT_MODEL: &str = "VOCALIS_DEFAULT_MODEL";

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_MODEL: &str = "llama3.2:latest";

/// Prompt used when the caller does not configure one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an experienced technical interviewer conducting a video interview.

When a candidate first joins (indicated by \"Candidate has joined the interview session\"), greet them warmly, introduce yourself as their AI interviewer, and ask them to briefly introduce themselves.

Your role is to:
- Ask relevant technical questions based on the candidate's responses
- Provide constructive feedback
- Guide the conversation naturally
- Be professional but friendly
- Focus on practical experience and problem-solving skills
- Ask follow-up questions to dive deeper into topics
- Occasionally present coding challenges or scenario-based questions

Keep your responses conversational and engaging. Each response should be 1-3 sentences typically.";

/// Languages the speech backend accepts.
pub const SUPPORTED_LANGS: &[&str] = &[
    "en", "es", "fr", "de", "it", "pt", "ru", "ja", "ko", "zh", "ar", "hi",
];
/// Regional voice variants the speech backend accepts.
pub const SUPPORTED_TLDS: &[&str] = &["com", "co.uk", "com.au", "ca", "co.in", "ie", "co.za"];

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP backend settings.
    pub backend: BackendConfig,
    /// Model and prompt settings for generation turns.
    pub session: SessionConfig,
    /// Speech synthesis settings.
    pub speech: SpeechSettings,
    /// Local audio playback settings.
    pub playback: PlaybackConfig,
}

/// HTTP backend configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL all endpoint paths are joined to.
    pub base_url: String,
    /// Model used when the session does not name one.
    pub default_model: String,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Total attempts per request (first try included).
    pub retry_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub retry_delay_ms: u64,
    /// Timeout of the health probe in milliseconds.
    pub health_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            default_model: DEFAULT_MODEL.to_owned(),
            timeout_ms: 30_000,
            retry_attempts: 3,
            retry_delay_ms: 1_000,
            health_timeout_ms: 5_000,
        }
    }
}

/// Model and prompt parameters for generation turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Model requested from the generation backend.
    pub model_name: String,
    /// Sampling temperature, `0.0..=2.0`.
    pub temperature: f32,
    /// Instructions prepended to every prompt.
    pub system_prompt: String,
    /// Upper bound on generated tokens (`num_predict`).
    pub max_output_tokens: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_MODEL.to_owned(),
            temperature: 0.7,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_owned(),
            max_output_tokens: 300,
        }
    }
}

impl SessionConfig {
    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] when a field is out of range.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ApiError::Config(format!(
                "temperature must be within 0..=2, got {}",
                self.temperature
            )));
        }
        if self.max_output_tokens == 0 {
            return Err(ApiError::Config(
                "max_output_tokens must be at least 1".to_owned(),
            ));
        }
        if self.model_name.trim().is_empty() {
            return Err(ApiError::Config("model_name must not be empty".to_owned()));
        }
        Ok(())
    }

    /// Return a copy with `update` merged in, validated.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] when the merged config is out of range.
    pub fn merged(&self, update: &SessionConfigUpdate) -> Result<Self> {
        let mut next = self.clone();
        if let Some(model) = &update.model_name {
            next.model_name.clone_from(model);
        }
        if let Some(t) = update.temperature {
            next.temperature = t;
        }
        if let Some(prompt) = &update.system_prompt {
            next.system_prompt.clone_from(prompt);
        }
        if let Some(max) = update.max_output_tokens {
            next.max_output_tokens = max;
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial update of [`SessionConfig`]; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfigUpdate {
    pub model_name: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    pub max_output_tokens: Option<u32>,
}

impl SessionConfigUpdate {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model_name = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }
}

/// Voice parameters sent with every speech request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
    /// Language code, see [`SUPPORTED_LANGS`].
    pub lang: String,
    /// Regional accent, see [`SUPPORTED_TLDS`].
    pub tld: String,
    /// Slower speech rate.
    pub slow: bool,
    /// Synthesize and play completed assistant turns automatically.
    pub auto_speak: bool,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            lang: "en".to_owned(),
            tld: "com".to_owned(),
            slow: false,
            auto_speak: true,
        }
    }
}

impl SpeechSettings {
    /// # Errors
    ///
    /// Returns [`ApiError::Config`] for an unsupported language or accent.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_LANGS.contains(&self.lang.as_str()) {
            return Err(ApiError::Config(format!(
                "unsupported speech language: {}",
                self.lang
            )));
        }
        if !SUPPORTED_TLDS.contains(&self.tld.as_str()) {
            return Err(ApiError::Config(format!(
                "unsupported speech accent: {}",
                self.tld
            )));
        }
        Ok(())
    }
}

/// Local audio playback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Player executable; discovered on `PATH` when unset.
    pub player: Option<String>,
    /// Extra arguments placed before the audio file path.
    pub player_args: Vec<String>,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ApiError::Config(e.to_string()))
    }

    /// Load from `path` when it exists, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ApiError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `<config dir>/vocalis/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("vocalis-config"))
            .join("vocalis")
            .join("config.toml")
    }

    /// Apply [`ENV_API_URL`] and [`ENV_DEFAULT_MODEL`] from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_API_URL).ok(),
            std::env::var(ENV_DEFAULT_MODEL).ok(),
        );
    }

    fn apply_overrides(&mut self, api_url: Option<String>, model: Option<String>) {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            // A session still on the stock default follows the override.
            if self.session.model_name == self.backend.default_model {
                self.session.model_name.clone_from(&model);
            }
            self.backend.default_model = model;
        }
    }

    /// # Errors
    ///
    /// Returns [`ApiError::Config`] when any section is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.backend.retry_attempts == 0 {
            return Err(ApiError::Config(
                "retry_attempts must be at least 1".to_owned(),
            ));
        }
        if self.backend.timeout_ms == 0 {
            return Err(ApiError::Config("timeout_ms must be positive".to_owned()));
        }
        reqwest::Url::parse(&self.backend.base_url)
            .map_err(|e| ApiError::Config(format!("invalid base_url: {e}")))?;
        self.session.validate()?;
        self.speech.validate()
    }
}
