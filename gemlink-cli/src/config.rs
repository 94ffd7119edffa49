//! Gemlink configuration loader: TOML file plus environment overrides.

use gemlink_client::{GeminiConfig, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GemlinkConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Tracing filter directive, e.g. "info" or "warn,gemlink_client=debug".
    /// `RUST_LOG` takes precedence when set.
    #[serde(default)]
    pub log_filter: Option<String>,
    /// When set, logs are appended to this file in addition to stderr.
    #[serde(default)]
    pub log_file: Option<String>,
}

fn default_model() -> String {
    gemlink_client::DEFAULT_MODEL.to_string()
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_output_tokens() -> u32 {
    2048
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            timeout_secs: default_timeout_secs(),
            log_filter: None,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub gemini_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl GemlinkConfig {
    /// Load from an explicit path, else the default path when present,
    /// else defaults. Environment variables override file values either
    /// way, so a bare `GEMINI_API_KEY` is enough to run.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::read_file(&path).await?,
            None => {
                let path = default_config_path();
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    Self::read_file(&path).await?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    async fn read_file(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
        toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))
    }

    /// A set-but-unparseable numeric variable is an error, not a silent
    /// fall-through; a typo'd override must not run with the file value.
    fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(v) = std::env::var("GEMINI_API_KEY") {
            if !v.trim().is_empty() {
                self.keys.gemini_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("GEMINI_MODEL") {
            if !v.trim().is_empty() {
                self.general.model = v;
            }
        }
        if let Ok(v) = std::env::var("GEMINI_TEMPERATURE") {
            self.general.temperature = parse_env("GEMINI_TEMPERATURE", &v)?;
        }
        if let Ok(v) = std::env::var("GEMINI_MAX_TOKENS") {
            self.general.max_output_tokens = parse_env("GEMINI_MAX_TOKENS", &v)?;
        }
        if let Ok(v) = std::env::var("GEMINI_TIMEOUT_SECS") {
            self.general.timeout_secs = parse_env("GEMINI_TIMEOUT_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("GEMINI_RETRY_ATTEMPTS") {
            self.retry.attempts = parse_env("GEMINI_RETRY_ATTEMPTS", &v)?;
        }
        if let Ok(v) = std::env::var("GEMINI_LOG_LEVEL") {
            if !v.trim().is_empty() {
                self.general.log_filter = Some(v);
            }
        }
        if let Ok(v) = std::env::var("GEMINI_LOG_FILE") {
            if !v.trim().is_empty() {
                self.general.log_file = Some(v);
            }
        }
        Ok(())
    }

    /// Convert into the validated client configuration. The client re-runs
    /// validation, so invalid values fail here rather than at first call.
    pub fn into_client_config(self) -> anyhow::Result<GeminiConfig> {
        let api_key = self.keys.gemini_api_key.unwrap_or_default();
        let config = GeminiConfig::new(api_key)
            .with_model(self.general.model)
            .with_temperature(self.general.temperature)
            .with_max_output_tokens(self.general.max_output_tokens)
            .with_timeout(Duration::from_secs(self.general.timeout_secs))
            .with_retry(
                RetryPolicy::default()
                    .with_attempts(self.retry.attempts)
                    .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
                    .with_max_delay(Duration::from_millis(self.retry.max_delay_ms)),
            );
        config.validate().map_err(|e| {
            anyhow::anyhow!("{e}; set GEMINI_API_KEY or keys.gemini_api_key in the config file")
        })?;
        Ok(config)
    }
}

fn parse_env<T>(name: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid {name}={value:?}: {e}"))
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".gemlink").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gets_defaults() {
        let cfg: GemlinkConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.general.model, gemlink_client::DEFAULT_MODEL);
        assert_eq!(cfg.general.max_output_tokens, 2048);
        assert_eq!(cfg.retry.attempts, 3);
        assert!(cfg.keys.gemini_api_key.is_none());
    }

    #[test]
    fn file_values_are_parsed() {
        let cfg: GemlinkConfig = toml::from_str(
            r#"
            [general]
            model = "gemini-1.5-pro"
            temperature = 0.2
            timeout_secs = 10
            log_file = "/tmp/gemlink.log"

            [keys]
            gemini_api_key = "file-key"

            [retry]
            attempts = 5
            base_delay_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.general.model, "gemini-1.5-pro");
        assert_eq!(cfg.general.temperature, 0.2);
        assert_eq!(cfg.general.timeout_secs, 10);
        assert_eq!(cfg.general.log_file.as_deref(), Some("/tmp/gemlink.log"));
        assert_eq!(cfg.keys.gemini_api_key.as_deref(), Some("file-key"));
        assert_eq!(cfg.retry.attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 250);
        assert_eq!(cfg.retry.max_delay_ms, 30_000);
    }

    // Single test for all env handling; parallel tests must not race on
    // process-wide variables.
    #[test]
    fn env_overrides_apply_and_garbage_is_rejected() {
        let mut cfg = GemlinkConfig::default();
        unsafe {
            std::env::set_var("GEMINI_TEMPERATURE", "abc");
        }
        let err = cfg.apply_env_overrides().unwrap_err().to_string();
        assert!(err.contains("GEMINI_TEMPERATURE"));
        assert!(err.contains("abc"));
        // The file value survives the failed override.
        assert_eq!(cfg.general.temperature, default_temperature());

        unsafe {
            std::env::set_var("GEMINI_TEMPERATURE", "0.4");
            std::env::set_var("GEMINI_LOG_FILE", "/tmp/override.log");
        }
        cfg.apply_env_overrides().unwrap();
        assert_eq!(cfg.general.temperature, 0.4);
        assert_eq!(cfg.general.log_file.as_deref(), Some("/tmp/override.log"));

        unsafe {
            std::env::remove_var("GEMINI_TEMPERATURE");
            std::env::remove_var("GEMINI_LOG_FILE");
        }
    }

    #[test]
    fn missing_api_key_fails_conversion() {
        let cfg = GemlinkConfig::default();
        let err = cfg.into_client_config().unwrap_err().to_string();
        assert!(err.contains("GEMINI_API_KEY"));
    }

    #[test]
    fn conversion_carries_values_into_client_config() {
        let mut cfg = GemlinkConfig::default();
        cfg.keys.gemini_api_key = Some("k".to_string());
        cfg.general.temperature = 0.3;
        cfg.retry.attempts = 7;

        let client_cfg = cfg.into_client_config().unwrap();
        assert_eq!(client_cfg.temperature, 0.3);
        assert_eq!(client_cfg.retry.attempts, 7);
        assert_eq!(client_cfg.timeout, Duration::from_secs(30));
    }
}
