//! Environment-backed runtime configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::auth::DEFAULT_REFRESH_TIMEOUT_MS;
use crate::capabilities::{ValidatedUrl, DEFAULT_TIMEOUT_MS, MAX_TIMEOUT_MS};
use crate::gateway::ClientHeaders;
use crate::outbox::{OutboxConfig, DEFAULT_MAX_AGE_MS, DEFAULT_MAX_ENTRIES};
use crate::retry::{BackoffPolicy, DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_DELAY_MS, DEFAULT_MAX_RETRIES};

pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_APP_VERSION: &str = "1.0.0";
const DEFAULT_OTA_VERSION: &str = "none";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required setting {key}")]
    Missing { key: &'static str },

    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tuning of the queue, replay and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub max_queue_entries: usize,
    pub max_queue_age_ms: u64,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Long, to ride out a cold backend start.
    pub request_timeout_ms: u64,
    /// Must stay shorter than `request_timeout_ms` so a hung refresh frees its waiters.
    pub refresh_timeout_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_queue_entries: DEFAULT_MAX_ENTRIES,
            max_queue_age_ms: DEFAULT_MAX_AGE_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            request_timeout_ms: DEFAULT_TIMEOUT_MS,
            refresh_timeout_ms: DEFAULT_REFRESH_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
            ConfigError::InvalidValue {
                key,
                value: value.to_string(),
                reason: reason.to_owned(),
            }
        }

        if self.max_queue_entries == 0 {
            return Err(invalid("max_queue_entries", 0, "must be at least 1"));
        }
        if self.max_retries == 0 {
            return Err(invalid("max_retries", 0, "must be at least 1"));
        }
        if self.base_delay_ms == 0 {
            return Err(invalid("base_delay_ms", 0, "must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(
                "base_delay_ms",
                self.base_delay_ms,
                "must not exceed max_delay_ms",
            ));
        }
        if self.request_timeout_ms == 0 || self.request_timeout_ms > MAX_TIMEOUT_MS {
            return Err(invalid(
                "request_timeout_ms",
                self.request_timeout_ms,
                &format!("must be between 1 and {MAX_TIMEOUT_MS}"),
            ));
        }
        if self.refresh_timeout_ms == 0 || self.refresh_timeout_ms >= self.request_timeout_ms {
            return Err(invalid(
                "refresh_timeout_ms",
                self.refresh_timeout_ms,
                "must be non-zero and shorter than request_timeout_ms",
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(invalid("probe_timeout_ms", 0, "must be at least 1"));
        }
        Ok(())
    }

    pub fn outbox(&self) -> OutboxConfig {
        OutboxConfig {
            max_entries: self.max_queue_entries,
            max_age_ms: self.max_queue_age_ms,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay_ms, self.max_delay_ms, self.max_retries)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Backend behind the durable queue, session and cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageBackend {
    /// One checksummed file per key.
    #[default]
    File,
    /// A single SQLite database; needs the `sqlite` feature.
    Sqlite,
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown storage backend '{other}' (expected file or sqlite)")),
        }
    }
}

/// Everything needed to build an [`crate::client::OfflineClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: ValidatedUrl,
    pub headers: ClientHeaders,
    /// Where the file-backed store lives. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    pub storage: StorageBackend,
    /// Reachability check endpoint. Without one the host-fed connectivity flag decides.
    pub probe_url: Option<ValidatedUrl>,
    pub sync: SyncConfig,
}

impl ClientConfig {
    pub fn new(base_url: ValidatedUrl, headers: ClientHeaders) -> Self {
        Self {
            base_url,
            headers,
            data_dir: None,
            storage: StorageBackend::default(),
            probe_url: None,
            sync: SyncConfig::default(),
        }
    }

    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let url = optional_trimmed("EXPENSE_API_URL", &mut lookup).ok_or(ConfigError::Missing {
            key: "EXPENSE_API_URL",
        })?;
        let base_url = ValidatedUrl::new(url.as_str()).map_err(|e| ConfigError::InvalidValue {
            key: "EXPENSE_API_URL",
            value: url.clone(),
            reason: e.to_string(),
        })?;

        let headers = ClientHeaders {
            app_version: optional_trimmed("EXPENSE_APP_VERSION", &mut lookup)
                .unwrap_or_else(|| DEFAULT_APP_VERSION.to_owned()),
            ota_version: optional_trimmed("EXPENSE_OTA_VERSION", &mut lookup)
                .unwrap_or_else(|| DEFAULT_OTA_VERSION.to_owned()),
            platform: optional_trimmed("EXPENSE_PLATFORM", &mut lookup)
                .unwrap_or_else(|| env::consts::OS.to_owned()),
        };
        let data_dir = optional_trimmed("EXPENSE_DATA_DIR", &mut lookup).map(PathBuf::from);
        let storage = parse_or("EXPENSE_STORE", StorageBackend::default(), &mut lookup)?;
        let probe_url = optional_trimmed("EXPENSE_PROBE_URL", &mut lookup)
            .map(|url| {
                ValidatedUrl::new(url.as_str()).map_err(|e| ConfigError::InvalidValue {
                    key: "EXPENSE_PROBE_URL",
                    value: url.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            request_timeout_ms: parse_or("EXPENSE_REQUEST_TIMEOUT_MS", defaults.request_timeout_ms, &mut lookup)?,
            refresh_timeout_ms: parse_or("EXPENSE_REFRESH_TIMEOUT_MS", defaults.refresh_timeout_ms, &mut lookup)?,
            max_queue_entries: parse_or("EXPENSE_QUEUE_MAX_ENTRIES", defaults.max_queue_entries, &mut lookup)?,
            max_retries: parse_or("EXPENSE_SYNC_MAX_RETRIES", defaults.max_retries, &mut lookup)?,
            ..defaults
        };
        sync.validate()?;

        Ok(Self {
            base_url,
            headers,
            data_dir,
            storage,
            probe_url,
            sync,
        })
    }
}

fn optional_trimmed<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl FnMut(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config =
            ClientConfig::from_lookup(lookup(&[("EXPENSE_API_URL", "https://api.example.com/api")]))
                .unwrap();
        assert_eq!(config.base_url.as_str(), "https://api.example.com/api");
        assert_eq!(config.headers.app_version, "1.0.0");
        assert_eq!(config.headers.ota_version, "none");
        assert_eq!(config.headers.platform, env::consts::OS);
        assert_eq!(config.data_dir, None);
        assert_eq!(config.storage, StorageBackend::File);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("EXPENSE_API_URL", " https://api.example.com "),
            ("EXPENSE_PLATFORM", "android"),
            ("EXPENSE_DATA_DIR", "/tmp/expenses"),
            ("EXPENSE_STORE", "SQLite"),
            ("EXPENSE_PROBE_URL", "https://api.example.com/health"),
            ("EXPENSE_QUEUE_MAX_ENTRIES", "50"),
            ("EXPENSE_SYNC_MAX_RETRIES", "3"),
            ("EXPENSE_REFRESH_TIMEOUT_MS", "10000"),
        ]))
        .unwrap();
        assert_eq!(config.headers.platform, "android");
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/expenses")));
        assert_eq!(config.storage, StorageBackend::Sqlite);
        assert_eq!(
            config.probe_url.map(|u| u.host().to_owned()).as_deref(),
            Some("api.example.com")
        );
        assert_eq!(config.sync.max_queue_entries, 50);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.refresh_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn missing_url_is_an_error() {
        assert_eq!(
            ClientConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing { key: "EXPENSE_API_URL" }
        );
    }

    #[test]
    fn bad_numbers_name_the_key() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("EXPENSE_API_URL", "https://api.example.com"),
            ("EXPENSE_SYNC_MAX_RETRIES", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "EXPENSE_SYNC_MAX_RETRIES", .. }
        ));
    }

    #[test]
    fn validation_rules() {
        assert!(SyncConfig::default().validate().is_ok());
        let cases = [
            SyncConfig { max_queue_entries: 0, ..Default::default() },
            SyncConfig { max_retries: 0, ..Default::default() },
            SyncConfig { base_delay_ms: 0, ..Default::default() },
            SyncConfig { base_delay_ms: 70_000, ..Default::default() },
            SyncConfig { refresh_timeout_ms: 90_000, ..Default::default() },
        ];
        for config in cases {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }
}
