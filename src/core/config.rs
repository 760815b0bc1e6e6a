use crate::errors::{RemixError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub browser: BrowserConfig,
    pub injection: RetryConfig,
    pub autoload: RetryConfig,
    pub navigation: NavigationConfig,
    pub context: ContextConfig,
    pub assistant: AssistantConfig,
}

impl Config {
    /// Load a JSON config file. Sections that are absent keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&raw)?)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            injection: RetryConfig::default(),
            autoload: RetryConfig::autoload(),
            navigation: NavigationConfig::default(),
            context: ContextConfig::default(),
            assistant: AssistantConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub args: Vec<String>,
}

/// Backoff + mutation-observation tunables for one retry cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub mutation_debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NavigationConfig {
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_html_chars: usize,
    pub fragment_max_chars: usize,
    pub outline_depth: usize,
    pub outline_root_children: usize,
    pub outline_children: usize,
    pub outline_text_preview: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub max_inspection_rounds: u32,
    pub max_inspect_selectors: usize,
    pub history_turns: usize,
    pub conversation_cap: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub bridge_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            window_width: 1280,
            window_height: 720,
            args: vec![],
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay_ms: 300,
            max_delay_ms: 3000,
            mutation_debounce_ms: 100,
        }
    }
}

impl RetryConfig {
    /// Re-establishing elements after a (soft) navigation.
    pub fn autoload() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 200,
            max_delay_ms: 3000,
            mutation_debounce_ms: 100,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.mutation_debounce_ms)
    }
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_html_chars: 30_000,
            fragment_max_chars: 8_000,
            outline_depth: 4,
            outline_root_children: 20,
            outline_children: 10,
            outline_text_preview: 60,
        }
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            max_inspection_rounds: 3,
            max_inspect_selectors: 5,
            history_turns: 20,
            conversation_cap: 50,
            temperature: 0.7,
            max_tokens: 4096,
            bridge_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    OpenRouter,
    Groq,
    Custom,
}

impl Provider {
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::OpenRouter => Some("https://openrouter.ai/api/v1"),
            Provider::Groq => Some("https://api.groq.com/openai/v1"),
            Provider::Custom => None,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::OpenRouter => "openai/gpt-4o-mini",
            Provider::Groq => "llama-3.3-70b-versatile",
            Provider::Custom => "",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Some(Provider::OpenAi),
            "openrouter" => Some(Provider::OpenRouter),
            "groq" => Some(Provider::Groq),
            "custom" => Some(Provider::Custom),
            _ => None,
        }
    }
}

/// User-level settings persisted in the key-value store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(rename = "allowElementLLMAccess", alias = "allowElementLlmAccess")]
    pub allow_element_llm_access: bool,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(RemixError::Configuration(
                "no API key configured; add one in settings".to_string(),
            ));
        }
        if self.provider == Provider::Custom
            && self.base_url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(RemixError::Configuration(
                "the custom provider needs a base URL".to_string(),
            ));
        }
        if self.effective_model().is_empty() {
            return Err(RemixError::Configuration("no model configured".to_string()));
        }
        Ok(())
    }

    pub fn effective_base_url(&self) -> Option<String> {
        match self.base_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Some(url.trim_end_matches('/').to_string()),
            _ => self.provider.default_base_url().map(str::to_string),
        }
    }

    pub fn effective_model(&self) -> String {
        if self.model.trim().is_empty() {
            self.provider.default_model().to_string()
        } else {
            self.model.trim().to_string()
        }
    }

    /// Environment overrides used by the command line front end.
    pub fn apply_env(&mut self) {
        if let Some(provider) = std::env::var("REMIX_PROVIDER")
            .ok()
            .and_then(|p| Provider::parse(&p))
        {
            self.provider = provider;
        }
        if let Ok(key) = std::env::var("REMIX_API_KEY") {
            self.api_key = key;
        }
        if let Ok(model) = std::env::var("REMIX_MODEL") {
            self.model = model;
        }
        if let Ok(base_url) = std::env::var("REMIX_BASE_URL") {
            self.base_url = Some(base_url);
        }
    }

    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.trim().chars().collect();
        if chars.len() <= 8 {
            return "*".repeat(chars.len());
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}…{tail}")
    }
}
