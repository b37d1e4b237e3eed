// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

fn default_enabled() -> bool {
    true
}
fn default_provider() -> String {
    "openai".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_api_key() -> String {
    "ENV".to_string()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_connect_timeout_secs() -> u64 {
    4
}
fn default_temperature() -> f32 {
    0.7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Only "openai" is wired; anything else yields the disabled client.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// "ENV" means: read from OPENAI_API_KEY.
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// "mock" | "error"; set through AI_TEST_MODE.
    #[serde(default)]
    pub test_mode: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            provider: default_provider(),
            model: default_model(),
            api_key: default_api_key(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            temperature: default_temperature(),
            test_mode: None,
        }
    }
}

impl AiConfig {
    /// Normalize provider, resolve the "ENV" key sentinel and apply env overrides.
    ///
    /// A missing key is not an error: the provider then fails every call and the
    /// pipelines serve their fallbacks.
    pub fn resolve_env(&mut self) {
        self.provider = self.provider.trim().to_lowercase();

        if let Ok(v) = env::var("AI_ENABLED") {
            self.enabled = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Ok(model) = env::var("OPENAI_MODEL") {
            if !model.trim().is_empty() {
                self.model = model.trim().to_string();
            }
        }
        if let Ok(mode) = env::var("AI_TEST_MODE") {
            let mode = mode.trim().to_ascii_lowercase();
            self.test_mode = if mode.is_empty() { None } else { Some(mode) };
        }

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = match self.provider.as_str() {
                "openai" => env::var("OPENAI_API_KEY").unwrap_or_default(),
                _ => String::new(),
            };
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
        if self.connect_timeout_secs == 0 {
            self.connect_timeout_secs = default_connect_timeout_secs();
        }
    }

    /// The key to send, if any. An unresolved "ENV" sentinel counts as no key.
    pub fn usable_api_key(&self) -> Option<&str> {
        let key = self.api_key.trim();
        (!key.is_empty() && !key.eq_ignore_ascii_case("env")).then_some(key)
    }
}
