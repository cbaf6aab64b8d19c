//! Tunables for the sync engine.
//!
//! Every field has a named default. Durations are written to `docket.toml`
//! as whole milliseconds under `*_ms` keys.

use core::time::Duration;
use std::fs::{read_to_string, write};

use camino::Utf8Path;
use eyre::{Result as EyreResult, WrapErr};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE: &str = "docket.toml";

/// Default number of prefetches allowed in flight at once
pub const DEFAULT_PREFETCH_MAX_CONCURRENT: usize = 3;

/// Default minimum gap between two prefetch starts (50 ms)
pub const DEFAULT_PREFETCH_MIN_SPACING_MS: u64 = 50;

/// Default delay before the single retry of a failed prefetch (500 ms)
pub const DEFAULT_PREFETCH_RETRY_DELAY_MS: u64 = 500;

/// Default age after which a resident entity is no longer fresh (30 seconds)
pub const DEFAULT_PREFETCH_FRESHNESS_SECS: u64 = 30;

/// Default first reconnect delay (500 ms), doubled per consecutive failure
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;

/// Default cap on the reconnect delay (30 seconds)
pub const DEFAULT_RECONNECT_MAX_DELAY_SECS: u64 = 30;

/// Default consecutive failed connection attempts before going offline
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 8;

/// Default number of settled mutation ids remembered for echo suppression
pub const DEFAULT_ECHO_WINDOW: usize = 256;

/// Default time a settled mutation id is remembered (60 seconds)
pub const DEFAULT_ECHO_TTL_SECS: u64 = 60;

/// Default period of the maintenance ticker (1 second)
pub const DEFAULT_MAINTENANCE_TICK_MS: u64 = 1_000;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("prefetch.max_concurrent must be at least 1")]
    ZeroPrefetchConcurrency,
    #[error("reconnect.base_delay_ms ({base:?}) exceeds reconnect.max_delay_ms ({max:?})")]
    InvalidBackoff { base: Duration, max: Duration },
    #[error("reconnect.max_attempts must be at least 1")]
    ZeroReconnectAttempts,
    #[error("echo.window must be at least 1")]
    ZeroEchoWindow,
    #[error("maintenance.tick_ms must be non-zero")]
    ZeroMaintenanceTick,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[non_exhaustive]
pub struct ConfigFile {
    #[serde(default)]
    pub sync: SyncConfig,
}

impl ConfigFile {
    #[must_use]
    pub const fn new(sync: SyncConfig) -> Self {
        Self { sync }
    }

    #[must_use]
    pub fn exists(dir: &Utf8Path) -> bool {
        dir.join(CONFIG_FILE).is_file()
    }

    pub fn load(dir: &Utf8Path) -> EyreResult<Self> {
        let path = dir.join(CONFIG_FILE);
        let content = read_to_string(&path)
            .wrap_err_with(|| format!("failed to read configuration from {path:?}"))?;

        let config: Self = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse configuration from {path:?}"))?;
        config.sync.validate()?;

        Ok(config)
    }

    pub fn save(&self, dir: &Utf8Path) -> EyreResult<()> {
        let path = dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;

        write(&path, content)
            .wrap_err_with(|| format!("failed to write configuration to {path:?}"))?;

        Ok(())
    }
}

/// All tunables of the sync engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub prefetch: PrefetchConfig,
    pub reconnect: ReconnectConfig,
    pub echo: EchoConfig,
    pub maintenance: MaintenanceConfig,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch.max_concurrent == 0 {
            return Err(ConfigError::ZeroPrefetchConcurrency);
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(ConfigError::InvalidBackoff {
                base: self.reconnect.base_delay,
                max: self.reconnect.max_delay,
            });
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ZeroReconnectAttempts);
        }
        if self.echo.window == 0 {
            return Err(ConfigError::ZeroEchoWindow);
        }
        if self.maintenance.tick.is_zero() {
            return Err(ConfigError::ZeroMaintenanceTick);
        }
        Ok(())
    }
}

/// Speculative prefetch scheduling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub max_concurrent: usize,
    #[serde(rename = "min_spacing_ms", with = "serde_duration")]
    pub min_spacing: Duration,
    #[serde(rename = "retry_delay_ms", with = "serde_duration")]
    pub retry_delay: Duration,
    /// Entities loaded more recently than this are not prefetched again.
    #[serde(rename = "freshness_ms", with = "serde_duration")]
    pub freshness: Duration,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_PREFETCH_MAX_CONCURRENT,
            min_spacing: Duration::from_millis(DEFAULT_PREFETCH_MIN_SPACING_MS),
            retry_delay: Duration::from_millis(DEFAULT_PREFETCH_RETRY_DELAY_MS),
            freshness: Duration::from_secs(DEFAULT_PREFETCH_FRESHNESS_SECS),
        }
    }
}

/// Push channel reconnection backoff.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(rename = "base_delay_ms", with = "serde_duration")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "serde_duration")]
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectConfig {
    /// Delay before the next attempt after `failures` consecutive failures:
    /// `base * 2^(failures - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RECONNECT_MAX_DELAY_SECS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

/// Recently settled mutation ids kept for echo suppression.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EchoConfig {
    pub window: usize,
    #[serde(rename = "ttl_ms", with = "serde_duration")]
    pub ttl: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_ECHO_WINDOW,
            ttl: Duration::from_secs(DEFAULT_ECHO_TTL_SECS),
        }
    }
}

/// Background upkeep of subscribed views.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[serde(rename = "tick_ms", with = "serde_duration")]
    pub tick: Duration,
    /// Revalidate subscribed views that stayed stale longer than this,
    /// without waiting for a read. Disabled when absent.
    #[serde(
        rename = "max_staleness_ms",
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_staleness: Option<Duration>,
    /// Recompute every scalar view from the authority on this period.
    #[serde(
        rename = "scalar_recompute_interval_ms",
        with = "serde_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub scalar_recompute_interval: Option<Duration>,
}

impl MaintenanceConfig {
    /// Whether the maintenance ticker has anything to do.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.max_staleness.is_some() || self.scalar_recompute_interval.is_some()
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(DEFAULT_MAINTENANCE_TICK_MS),
            max_staleness: None,
            scalar_recompute_interval: None,
        }
    }
}

mod serde_duration {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod serde_duration_opt {
    use core::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(duration) => super::serde_duration::serialize(duration, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|millis| millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert_eq!(config.validate(), Ok(()), "defaults must validate");
        assert_eq!(config.prefetch.max_concurrent, 3);
        assert_eq!(config.prefetch.min_spacing, Duration::from_millis(50));
        assert!(!config.maintenance.is_enabled(), "maintenance is opt-in");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let reconnect = ReconnectConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        };

        let delays: Vec<_> = (1..=6).map(|failures| reconnect.delay_for(failures)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 800, 1_000, 1_000].map(Duration::from_millis),
            "doubling until the cap"
        );
        assert_eq!(
            reconnect.delay_for(u32::MAX),
            Duration::from_millis(1_000),
            "huge failure counts stay capped"
        );
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = SyncConfig::default();
        config.reconnect.base_delay = Duration::from_secs(60);

        assert!(
            matches!(config.validate(), Err(ConfigError::InvalidBackoff { .. })),
            "base above max"
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ConfigFile = toml::from_str(
            r"
            [sync.prefetch]
            max_concurrent = 5

            [sync.maintenance]
            max_staleness_ms = 10000
            ",
        )
        .expect("valid toml");

        assert_eq!(config.sync.prefetch.max_concurrent, 5);
        assert_eq!(
            config.sync.prefetch.retry_delay,
            Duration::from_millis(DEFAULT_PREFETCH_RETRY_DELAY_MS),
            "unspecified keys keep their defaults"
        );
        assert_eq!(
            config.sync.maintenance.max_staleness,
            Some(Duration::from_secs(10))
        );
        assert_eq!(config.sync.maintenance.scalar_recompute_interval, None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new("docket-config").expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).expect("utf-8 temp path");

        let mut sync = SyncConfig::default();
        sync.echo.window = 32;
        sync.maintenance.scalar_recompute_interval = Some(Duration::from_secs(120));

        assert!(!ConfigFile::exists(&path), "nothing written yet");
        ConfigFile::new(sync.clone()).save(&path).expect("saved");
        assert!(ConfigFile::exists(&path), "file written");

        let loaded = ConfigFile::load(&path).expect("loaded");
        assert_eq!(loaded.sync, sync);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = TempDir::new("docket-config").expect("temp dir");
        let path = Utf8PathBuf::from_path_buf(dir.path().to_owned()).expect("utf-8 temp path");
        write(path.join(CONFIG_FILE), "[sync.echo]\nwindow = 0\n").expect("written");

        assert!(ConfigFile::load(&path).is_err(), "zero echo window");
    }
}
