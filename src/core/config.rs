use crate::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration as embedded by the host page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub user_id: Option<String>,
    pub debug: bool,
    pub timeouts: TimeoutConfig,
    pub retry: RetryPolicy,
    pub heavy_page: HeavyPageConfig,
    pub dedup: DedupConfig,
    pub anti_flash: AntiFlashConfig,
    pub hover: HoverConfig,
    pub geolocation: GeolocationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub poll_interval_ms: u64,
    pub action_delay_ms: u64,
    pub stability_quiet_ms: u64,
    pub stability_max_ms: u64,
}

/// How often and how patiently to retry a wait before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_timeout_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeavyPageConfig {
    pub script_threshold: usize,
    pub image_threshold: usize,
    pub element_threshold: usize,
    pub timeout_factor: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupConfig {
    pub trigger_window_secs: u64,
    pub click_window_secs: u64,
    pub redirect_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AntiFlashConfig {
    pub enabled: bool,
    pub max_hidden_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HoverConfig {
    /// Require the pointer to stay on the element for the trigger's
    /// configured hover duration before firing.
    pub enforce_dwell: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeolocationConfig {
    pub primary_url: String,
    pub fallback_url: String,
    pub cache_ttl_secs: i64,
    pub request_timeout_ms: u64,
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(EngineError::ConfigurationError(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(EngineError::ConfigurationError(
                "retry.backoffMultiplier must be >= 1.0".to_string(),
            ));
        }
        if self.timeouts.poll_interval_ms == 0 {
            return Err(EngineError::ConfigurationError(
                "timeouts.pollIntervalMs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }
}

impl TimeoutConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn action_delay(&self) -> Duration {
        Duration::from_millis(self.action_delay_ms)
    }
}

impl RetryPolicy {
    /// Wait budget for a zero-based attempt, scaled by `factor` on heavy pages.
    pub fn timeout_for(&self, attempt: u32, factor: f64) -> Duration {
        let ms = self.base_timeout_ms as f64 * self.backoff_multiplier.powi(attempt as i32) * factor;
        Duration::from_millis(ms as u64)
    }

    /// Pause before the attempt following `attempt`.
    pub fn backoff_for(&self, attempt: u32, factor: f64) -> Duration {
        let ms = 250.0 * self.backoff_multiplier.powi(attempt as i32 + 1) * factor;
        Duration::from_millis(ms as u64)
    }
}

impl DedupConfig {
    pub fn trigger_window(&self) -> Duration {
        Duration::from_secs(self.trigger_window_secs)
    }

    pub fn click_window(&self) -> Duration {
        Duration::from_secs(self.click_window_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            user_id: None,
            debug: false,
            timeouts: TimeoutConfig::default(),
            retry: RetryPolicy::default(),
            heavy_page: HeavyPageConfig::default(),
            dedup: DedupConfig::default(),
            anti_flash: AntiFlashConfig::default(),
            hover: HoverConfig::default(),
            geolocation: GeolocationConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            action_delay_ms: 100,
            stability_quiet_ms: 300,
            stability_max_ms: 3000,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_timeout_ms: 5000,
            backoff_multiplier: 1.5,
        }
    }
}

impl Default for HeavyPageConfig {
    fn default() -> Self {
        Self {
            script_threshold: 30,
            image_threshold: 50,
            element_threshold: 3000,
            timeout_factor: 2.0,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            trigger_window_secs: 30,
            click_window_secs: 5,
            redirect_window_secs: 10,
        }
    }
}

impl Default for AntiFlashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_hidden_ms: 3000,
        }
    }
}

impl Default for GeolocationConfig {
    fn default() -> Self {
        Self {
            primary_url: "https://ipapi.co/json/".to_string(),
            fallback_url: "http://ip-api.com/json/".to_string(),
            cache_ttl_secs: 3600,
            request_timeout_ms: 5000,
        }
    }
}
