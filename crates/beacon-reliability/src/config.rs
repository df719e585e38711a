//! Runtime settings for the reliability layer, read from `BEACON_*` variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_SYNC_URL: &str = "http://127.0.0.1:4000/api/v1/geoloc/sync";
pub const DEFAULT_FORCE_SYNC_INTERVAL_MS: u64 = 12 * 60 * 60 * 1_000;
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_LOCATION_MAX_AGE_MS: u64 = 14 * 24 * 60 * 60 * 1_000;
pub const DEFAULT_WATCHDOG_CHECK_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_HEARTBEAT_STALE_MS: u64 = 45_000;
pub const DEFAULT_RECOVERY_COOLDOWN_MS: u64 = 30_000;
pub const DEFAULT_RELOAD_GRACE_MS: u64 = 10_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_INITIAL_DELAY_MS: u64 = 300;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid platform: {0}")]
    InvalidPlatform(String),
    #[error("invalid sync url: {0}")]
    InvalidSyncUrl(String),
    #[error("invalid duration for {key}: {message}")]
    InvalidDuration { key: String, message: String },
    #[error("invalid max attempts: {0}")]
    InvalidMaxAttempts(String),
    #[error("invalid boolean for {key}: {value}")]
    InvalidBool { key: String, value: String },
}

/// Target platform, which decides how a forced location sync reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// The native agent keeps its own upload queue and can be told to flush it.
    Android,
    /// No independent upload queue; heartbeats are posted directly.
    Ios,
}

impl Platform {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }
}

#[must_use]
pub fn parse_platform(raw: &str) -> Option<Platform> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "android" => Some(Platform::Android),
        "ios" | "iphone" | "ipados" => Some(Platform::Ios),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub force_sync_interval: Duration,
    pub sync_timeout: Duration,
    pub location_max_age: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            force_sync_interval: Duration::from_millis(DEFAULT_FORCE_SYNC_INTERVAL_MS),
            sync_timeout: Duration::from_millis(DEFAULT_SYNC_TIMEOUT_MS),
            location_max_age: Duration::from_millis(DEFAULT_LOCATION_MAX_AGE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    pub stale_threshold: Duration,
    pub recovery_cooldown: Duration,
    pub reload_grace: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(DEFAULT_WATCHDOG_CHECK_INTERVAL_MS),
            stale_threshold: Duration::from_millis(DEFAULT_HEARTBEAT_STALE_MS),
            recovery_cooldown: Duration::from_millis(DEFAULT_RECOVERY_COOLDOWN_MS),
            reload_grace: Duration::from_millis(DEFAULT_RELOAD_GRACE_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub default_max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: Duration::from_millis(DEFAULT_RETRY_INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    pub platform: Platform,
    pub sync_url: String,
    pub storage_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub watchdog: WatchdogConfig,
    pub retry: RetryConfig,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            platform: Platform::Android,
            sync_url: DEFAULT_SYNC_URL.to_string(),
            storage_path: None,
            scheduler: SchedulerConfig::default(),
            watchdog: WatchdogConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ReliabilityConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; unset or blank keys use defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let platform = match read("BEACON_PLATFORM") {
            Some(raw) => parse_platform(&raw).ok_or(ConfigError::InvalidPlatform(raw))?,
            None => Platform::Android,
        };
        let sync_url = match read("BEACON_SYNC_URL") {
            Some(raw) => normalize_sync_url(&raw)?,
            None => DEFAULT_SYNC_URL.to_string(),
        };
        let storage_path = read("BEACON_STORAGE_PATH").map(PathBuf::from);

        let duration = |key: &str, default_ms: u64| -> Result<Duration, ConfigError> {
            match read(key) {
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|error| ConfigError::InvalidDuration {
                        key: key.to_string(),
                        message: error.to_string(),
                    }),
                None => Ok(Duration::from_millis(default_ms)),
            }
        };

        let scheduler = SchedulerConfig {
            force_sync_interval: duration(
                "BEACON_FORCE_SYNC_INTERVAL_MS",
                DEFAULT_FORCE_SYNC_INTERVAL_MS,
            )?,
            sync_timeout: duration("BEACON_SYNC_TIMEOUT_MS", DEFAULT_SYNC_TIMEOUT_MS)?,
            location_max_age: duration(
                "BEACON_LOCATION_MAX_AGE_MS",
                DEFAULT_LOCATION_MAX_AGE_MS,
            )?,
        };
        let watchdog = WatchdogConfig {
            check_interval: duration(
                "BEACON_WATCHDOG_CHECK_INTERVAL_MS",
                DEFAULT_WATCHDOG_CHECK_INTERVAL_MS,
            )?,
            stale_threshold: duration("BEACON_HEARTBEAT_STALE_MS", DEFAULT_HEARTBEAT_STALE_MS)?,
            recovery_cooldown: duration(
                "BEACON_RECOVERY_COOLDOWN_MS",
                DEFAULT_RECOVERY_COOLDOWN_MS,
            )?,
            reload_grace: duration("BEACON_RELOAD_GRACE_MS", DEFAULT_RELOAD_GRACE_MS)?,
        };
        let default_max_attempts = match read("BEACON_DEFAULT_MAX_ATTEMPTS") {
            Some(raw) => raw
                .parse::<u32>()
                .map(|value| value.max(1))
                .map_err(|error| ConfigError::InvalidMaxAttempts(error.to_string()))?,
            None => DEFAULT_MAX_ATTEMPTS,
        };
        let jitter = match read("BEACON_RETRY_JITTER") {
            Some(raw) => parse_bool(&raw).ok_or(ConfigError::InvalidBool {
                key: "BEACON_RETRY_JITTER".to_string(),
                value: raw,
            })?,
            None => true,
        };
        let retry = RetryConfig {
            default_max_attempts,
            initial_delay: duration(
                "BEACON_RETRY_INITIAL_DELAY_MS",
                DEFAULT_RETRY_INITIAL_DELAY_MS,
            )?,
            max_delay: duration("BEACON_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
            jitter,
        };

        Ok(Self {
            platform,
            sync_url,
            storage_path,
            scheduler,
            watchdog,
            retry,
        })
    }
}

pub fn normalize_sync_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    let Some((scheme, remainder)) = trimmed.split_once("://") else {
        return Err(ConfigError::InvalidSyncUrl(trimmed.to_string()));
    };
    if !matches!(scheme, "http" | "https") || remainder.is_empty() || remainder.starts_with('/') {
        return Err(ConfigError::InvalidSyncUrl(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ReliabilityConfig, ConfigError> {
        let values = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect::<HashMap<_, _>>();
        ReliabilityConfig::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_match_documented_timings() {
        let config = config_from(&[]).expect("default config");
        assert_eq!(config.platform, Platform::Android);
        assert_eq!(
            config.scheduler.force_sync_interval,
            Duration::from_secs(12 * 60 * 60)
        );
        assert_eq!(config.scheduler.sync_timeout, Duration::from_secs(20));
        assert_eq!(config.watchdog.check_interval, Duration::from_secs(10));
        assert_eq!(config.watchdog.stale_threshold, Duration::from_secs(45));
        assert_eq!(config.watchdog.recovery_cooldown, Duration::from_secs(30));
        assert_eq!(config.watchdog.reload_grace, Duration::from_secs(10));
        assert_eq!(config.retry.default_max_attempts, 10);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("BEACON_PLATFORM", " iOS "),
            ("BEACON_SYNC_URL", "https://alerts.example.org/api/v1/geoloc/sync"),
            ("BEACON_HEARTBEAT_STALE_MS", "60000"),
            ("BEACON_DEFAULT_MAX_ATTEMPTS", "0"),
            ("BEACON_RETRY_JITTER", "off"),
            ("BEACON_STORAGE_PATH", "/tmp/beacon.json"),
        ])
        .expect("config with overrides");
        assert_eq!(config.platform, Platform::Ios);
        assert_eq!(
            config.sync_url,
            "https://alerts.example.org/api/v1/geoloc/sync"
        );
        assert_eq!(config.watchdog.stale_threshold, Duration::from_secs(60));
        assert_eq!(config.retry.default_max_attempts, 1);
        assert!(!config.retry.jitter);
        assert_eq!(
            config.storage_path,
            Some(PathBuf::from("/tmp/beacon.json"))
        );
    }

    #[test]
    fn invalid_values_are_rejected() {
        let error = config_from(&[("BEACON_PLATFORM", "symbian")]).expect_err("bad platform");
        assert!(matches!(error, ConfigError::InvalidPlatform(_)));

        let error = config_from(&[("BEACON_SYNC_TIMEOUT_MS", "soon")]).expect_err("bad duration");
        assert!(matches!(error, ConfigError::InvalidDuration { key, .. } if key == "BEACON_SYNC_TIMEOUT_MS"));

        let error = config_from(&[("BEACON_SYNC_URL", "alerts.example.org")]).expect_err("bad url");
        assert!(matches!(error, ConfigError::InvalidSyncUrl(_)));
    }
}
