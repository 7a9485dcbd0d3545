//! Transport client configuration.
//! Loaded from BOT_TOKEN and MAX_API_URL; retry and rate-limit knobs are optional.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::error::{MaxbotError, Result};

#[derive(Clone)]
pub struct ClientConfig {
    pub token: String,
    pub base_url: String,
    /// Extra attempts after the first one for retryable failures.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Requests per second; 0 disables client-side spacing.
    pub rate_limit_rps: f64,
    pub request_timeout_secs: u64,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("max_retries", &self.max_retries)
            .field("initial_backoff_ms", &self.initial_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("rate_limit_rps", &self.rate_limit_rps)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ClientConfig {
    /// Builds a config with default retry settings.
    pub fn new(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            base_url: base_url.into(),
            max_retries: 0,
            initial_backoff_ms: 250,
            max_backoff_ms: 3000,
            rate_limit_rps: 0.0,
            request_timeout_secs: 60,
        }
    }

    /// Loads from the environment: BOT_TOKEN and MAX_API_URL are required,
    /// MAX_MAX_RETRIES and MAX_RATE_LIMIT_RPS are optional.
    pub fn from_env() -> Result<Self> {
        let token = env::var("BOT_TOKEN")
            .map_err(|_| MaxbotError::Config("BOT_TOKEN not set".to_string()))?;
        let base_url = env::var("MAX_API_URL")
            .map_err(|_| MaxbotError::Config("MAX_API_URL not set".to_string()))?;

        let mut config = Self::new(token, base_url);
        if let Ok(raw) = env::var("MAX_MAX_RETRIES") {
            config.max_retries = raw.trim().parse().map_err(|_| {
                MaxbotError::Config(format!("MAX_MAX_RETRIES is not a number: {}", raw))
            })?;
        }
        if let Ok(raw) = env::var("MAX_RATE_LIMIT_RPS") {
            config.rate_limit_rps = raw.trim().parse().map_err(|_| {
                MaxbotError::Config(format!("MAX_RATE_LIMIT_RPS is not a number: {}", raw))
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.initial_backoff_ms = initial_ms;
        self.max_backoff_ms = max_ms;
        self
    }

    pub fn with_rate_limit(mut self, rps: f64) -> Self {
        self.rate_limit_rps = rps;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(MaxbotError::Config("token must not be empty".to_string()));
        }
        if reqwest::Url::parse(&self.base_url).is_err() {
            return Err(MaxbotError::Config(format!(
                "base_url is not a valid URL: {}",
                self.base_url
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(MaxbotError::Config(
                "initial_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        if !self.rate_limit_rps.is_finite() || self.rate_limit_rps < 0.0 {
            return Err(MaxbotError::Config(
                "rate_limit_rps must be a non-negative number".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff before retry number `attempt` (0-based): `min(initial * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.initial_backoff_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    pub(crate) fn min_request_interval(&self) -> Option<Duration> {
        (self.rate_limit_rps > 0.0).then(|| Duration::from_secs_f64(1.0 / self.rate_limit_rps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_new_defaults() {
        let config = ClientConfig::new("t", "https://api.example.com");
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.initial_backoff_ms, 250);
        assert_eq!(config.max_backoff_ms, 3000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ClientConfig::new("t", "https://api.example.com");
        assert_eq!(config.backoff(0), Duration::from_millis(250));
        assert_eq!(config.backoff(1), Duration::from_millis(500));
        assert_eq!(config.backoff(3), Duration::from_millis(2000));
        assert_eq!(config.backoff(4), Duration::from_millis(3000));
        assert_eq!(config.backoff(70), Duration::from_millis(3000));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ClientConfig::new(" ", "https://api.example.com").validate().is_err());
        assert!(ClientConfig::new("t", "not a url").validate().is_err());
        assert!(ClientConfig::new("t", "https://api.example.com")
            .with_backoff(5000, 100)
            .validate()
            .is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = ClientConfig::new("secret-token", "https://api.example.com");
        let printed = format!("{:?}", config);
        assert!(!printed.contains("secret-token"));
        assert!(printed.contains("[REDACTED]"));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        env::set_var("BOT_TOKEN", "env-token");
        env::set_var("MAX_API_URL", "https://api.example.com");
        env::set_var("MAX_MAX_RETRIES", "3");
        let config = ClientConfig::from_env().unwrap();
        assert_eq!(config.token, "env-token");
        assert_eq!(config.max_retries, 3);

        env::set_var("MAX_MAX_RETRIES", "many");
        assert!(ClientConfig::from_env().is_err());

        env::remove_var("MAX_MAX_RETRIES");
        env::remove_var("BOT_TOKEN");
        assert!(ClientConfig::from_env().is_err());
        env::remove_var("MAX_API_URL");
    }
}
