use parley_core::{ParleyError, ParleyResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    OpenAi,
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible.
    Groq,
    /// Local Ollama server. No API key.
    Ollama,
}

impl LlmProvider {
    fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::OpenRouter => "https://openrouter.ai/api",
            Self::Groq => "https://api.groq.com/openai",
            Self::Ollama => "http://localhost:11434",
        }
    }

    fn default_key_env(self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::Ollama => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// Inline key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub api_base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model_id: default_model_id(),
            api_key: None,
            api_key_env: None,
            api_base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl ModelConfig {
    pub fn base_url(&self) -> &str {
        match &self.api_base_url {
            Some(url) => url.trim_end_matches('/'),
            None => self.provider.default_base_url(),
        }
    }

    /// Inline key, then `api_key_env`, then the provider's conventional
    /// variable. Ollama needs none.
    pub fn resolve_api_key(&self) -> ParleyResult<Option<String>> {
        self.resolve_api_key_with(|name| std::env::var(name).ok())
    }

    fn resolve_api_key_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ParleyResult<Option<String>> {
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            return Ok(Some(key.to_string()));
        }
        let env_name = self
            .api_key_env
            .as_deref()
            .or_else(|| self.provider.default_key_env());
        match env_name {
            Some(name) => match lookup(name).filter(|k| !k.is_empty()) {
                Some(key) => Ok(Some(key)),
                None if self.provider == LlmProvider::Ollama => Ok(None),
                None => Err(ParleyError::Config(format!(
                    "model.api_key_env: environment variable {name} is not set"
                ))),
            },
            None => Ok(None),
        }
    }

    pub fn validate(&self) -> ParleyResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(ParleyError::Config("model.model_id must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ParleyError::Config(format!(
                "model.temperature must be within 0..=2, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(ParleyError::Config("model.max_tokens must be positive".into()));
        }
        Ok(())
    }
}
