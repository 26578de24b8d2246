//! Engine configuration.
//!
//! One JSON document with a section per component. Every field has a default,
//! so an empty file (or no file) yields a working offline configuration.
//! Durations are stored as milliseconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{AutoResolvePolicy, DEFAULT_MAX_RETRIES};
use crate::util::{is_http_url, normalize_text_option};

pub const ENV_API_URL: &str = "HABITSYNC_API_URL";
pub const ENV_API_TOKEN: &str = "HABITSYNC_API_TOKEN";
pub const ENV_DB_PATH: &str = "HABITSYNC_DB_PATH";

/// Outbox processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_concurrent_requests: usize,
    /// Retry budget of each queued operation
    pub operation_max_retries: u32,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_requests: 3,
            operation_max_retries: DEFAULT_MAX_RETRIES,
            request_timeout_ms: 10_000,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    #[must_use]
    pub const fn with_operation_max_retries(mut self, max: u32) -> Self {
        self.operation_max_retries = max;
        self
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// When sync passes run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base delay of the retry backoff; also the reconnect quiet period
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Consecutive failed passes that still get an automatic retry
    pub max_retries: u32,
    /// Periodic pass while online; 0 disables it
    pub periodic_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 5_000,
            max_retry_delay_ms: 300_000,
            max_retries: 3,
            periodic_interval_ms: 300_000,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = duration_ms(delay);
        self
    }

    #[must_use]
    pub const fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay_ms = duration_ms(delay);
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub const fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval_ms = duration_ms(interval);
        self
    }

    /// Disable the periodic timer (reconnect, manual and retry triggers only)
    #[must_use]
    pub const fn without_periodic_sync(mut self) -> Self {
        self.periodic_interval_ms = 0;
        self
    }

    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub const fn periodic_interval(&self) -> Option<Duration> {
        if self.periodic_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.periodic_interval_ms))
        }
    }

    /// Backoff before retry number `consecutive_failures` (1-based), capped.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(32);
        let delay = self.retry_delay_ms.saturating_mul(1_u64 << exponent);
        Duration::from_millis(delay.min(self.max_retry_delay_ms))
    }
}

/// Reachability checks and quality scoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// URL checked for reachability; defaults to the API health endpoint
    pub reachability_url: Option<String>,
    /// Quiet period before a reachability change is published
    pub debounce_ms: u64,
    pub reachability_timeout_ms: u64,
    pub check_interval_ms: u64,
    pub history_size: usize,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            reachability_url: None,
            debounce_ms: 2_000,
            reachability_timeout_ms: 5_000,
            check_interval_ms: 30_000,
            history_size: 20,
        }
    }
}

impl ConnectivityConfig {
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = duration_ms(debounce);
        self
    }

    #[must_use]
    pub const fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn reachability_timeout(&self) -> Duration {
        Duration::from_millis(self.reachability_timeout_ms)
    }

    pub const fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Policy applied after each pass; `manual` leaves conflicts for the user
    pub auto_resolve: AutoResolvePolicy,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            auto_resolve: AutoResolvePolicy::ServerWins,
        }
    }
}

/// Integrity audit thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrityConfig {
    /// Issue count at which the store is reported corrupted
    pub corruption_threshold: usize,
    pub recovery_attempts: u32,
    /// Backups kept after pruning
    pub keep_backups: usize,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            corruption_threshold: 50,
            recovery_attempts: 3,
            keep_backups: 10,
        }
    }
}

/// Full engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub db_path: Option<PathBuf>,
    /// Defaults to a `backups` directory next to the database
    pub backup_dir: Option<PathBuf>,
    pub api_url: Option<String>,
    pub api_token: Option<String>,
    pub sync: SyncConfig,
    pub scheduler: SchedulerConfig,
    pub connectivity: ConnectivityConfig,
    pub conflicts: ConflictConfig,
    pub integrity: IntegrityConfig,
}

impl std::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut redacted = self.clone();
        redacted.api_token = redacted.api_token.map(|_| "[REDACTED]".to_string());
        match serde_json::to_string_pretty(&redacted) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file; a missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|error| {
            Error::ValidationFailed(format!(
                "failed to parse config at {}: {error}",
                path.display()
            ))
        })?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut normalized = self.clone();
        normalized.normalize();
        std::fs::write(path, serde_json::to_string_pretty(&normalized)?)?;
        Ok(())
    }

    /// Apply `HABITSYNC_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = normalize_text_option(lookup(ENV_API_URL)) {
            self.api_url = Some(url);
        }
        if let Some(token) = normalize_text_option(lookup(ENV_API_TOKEN)) {
            self.api_token = Some(token);
        }
        if let Some(path) = normalize_text_option(lookup(ENV_DB_PATH)) {
            self.db_path = Some(PathBuf::from(path));
        }
        self.normalize();
        self.validate()
    }

    /// Whether a remote is configured at all.
    pub const fn has_remote(&self) -> bool {
        self.api_url.is_some()
    }

    /// Backup directory, next to the database unless set explicitly.
    pub fn resolved_backup_dir(&self) -> Option<PathBuf> {
        self.backup_dir.clone().or_else(|| {
            self.db_path
                .as_ref()
                .and_then(|path| path.parent())
                .map(|parent| parent.join("backups"))
        })
    }

    /// Reachability target: explicit URL, else the API health endpoint.
    pub fn resolved_reachability_url(&self) -> Option<String> {
        self.connectivity.reachability_url.clone().or_else(|| {
            self.api_url
                .as_ref()
                .map(|url| format!("{}/health", url.trim_end_matches('/')))
        })
    }

    fn normalize(&mut self) {
        self.api_url = normalize_text_option(self.api_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        self.api_token = normalize_text_option(self.api_token.take());
        self.connectivity.reachability_url =
            normalize_text_option(self.connectivity.reachability_url.take());
    }

    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("api_url", &self.api_url),
            ("connectivity.reachability_url", &self.connectivity.reachability_url),
        ] {
            if let Some(url) = url {
                if !is_http_url(url) {
                    return Err(Error::ValidationFailed(format!(
                        "{name} must include http:// or https://"
                    )));
                }
            }
        }
        if self.sync.batch_size == 0 || self.sync.max_concurrent_requests == 0 {
            return Err(Error::ValidationFailed(
                "sync.batch_size and sync.max_concurrent_requests must be positive".into(),
            ));
        }
        if self.connectivity.history_size == 0 {
            return Err(Error::ValidationFailed(
                "connectivity.history_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn duration_ms(duration: Duration) -> u64 {
    let millis = duration.as_millis();
    if millis > u64::MAX as u128 {
        u64::MAX
    } else {
        millis as u64
    }
}
