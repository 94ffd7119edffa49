use crate::error::{GeminiError, Result};
use crate::retry::RetryPolicy;
use crate::types::SafetySetting;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Validated client configuration; immutable once built.
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub safety_settings: Vec<SafetySetting>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            max_output_tokens: 2048,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            safety_settings: SafetySetting::default_set(),
        }
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub const fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replaces the default block-medium-and-above content filters. An empty
    /// list falls back to the provider's own defaults.
    pub fn with_safety_settings(mut self, safety_settings: Vec<SafetySetting>) -> Self {
        self.safety_settings = safety_settings;
        self
    }

    /// Must pass before any network operation is attempted.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(GeminiError::Config("api_key is required".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(GeminiError::Config("model is required".to_string()));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(GeminiError::Config(format!(
                "temperature must be within 0.0..=1.0, got {}",
                self.temperature
            )));
        }
        if self.max_output_tokens == 0 {
            return Err(GeminiError::Config(
                "max_output_tokens must be > 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(GeminiError::Config("timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

// The api key must never reach logs, including via Debug formatting.
impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("safety_settings", &self.safety_settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_api_key_fails_validation() {
        let err = GeminiConfig::new("").validate().unwrap_err();
        assert!(matches!(err, GeminiError::Config(_)));
    }

    #[test]
    fn out_of_range_temperature_fails_validation() {
        let err = GeminiConfig::new("k")
            .with_temperature(1.5)
            .validate()
            .unwrap_err();
        assert!(matches!(err, GeminiError::Config(_)));
    }

    #[test]
    fn zero_max_tokens_fails_validation() {
        let err = GeminiConfig::new("k")
            .with_max_output_tokens(0)
            .validate()
            .unwrap_err();
        assert!(matches!(err, GeminiError::Config(_)));
    }

    #[test]
    fn defaults_validate_once_key_is_set() {
        assert!(GeminiConfig::new("k").validate().is_ok());
    }

    #[test]
    fn debug_redacts_api_key() {
        let cfg = GeminiConfig::new("super-secret");
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }
}
