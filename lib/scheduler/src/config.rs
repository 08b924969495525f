//! Agent configuration.
//!
//! Loaded via the `config` crate from built-in defaults, an optional file
//! and `WORKWEAVE__`-prefixed environment variables, in that order. Nested
//! keys use `__`, e.g. `WORKWEAVE__POLLER__WORKERS=8`.

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use workweave_carrier::{CarrierConfig, RetryPolicy};

const ENV_PREFIX: &str = "WORKWEAVE";

/// Settings of one agent's worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_period_secs")]
    pub poll_period_secs: u64,
    /// Items claimed per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_workers() -> usize {
    4
}

fn default_poll_period_secs() -> u64 {
    10
}

fn default_batch_size() -> usize {
    50
}

fn default_enabled() -> bool {
    true
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_period_secs: default_poll_period_secs(),
            batch_size: default_batch_size(),
            enabled: default_enabled(),
        }
    }
}

impl AgentSettings {
    #[must_use]
    pub fn poll_period(&self) -> Duration {
        Duration::from_secs(self.poll_period_secs)
    }
}

/// Configuration of every agent and the carrier they share.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentConfig {
    /// Largest content update batch committed in one transaction.
    #[serde(default = "default_max_updates_per_round")]
    pub max_updates_per_round: usize,
    #[serde(default = "default_poll_jobs_chunk_size")]
    pub poll_jobs_chunk_size: usize,
    /// Seconds during which an actuated operator request is not repeated.
    #[serde(default = "default_operation_quiet_period_secs")]
    pub operation_quiet_period_secs: i64,
    /// Seconds after which a claimed item may be claimed again.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: i64,
    #[serde(default = "default_max_update_retries")]
    pub max_update_retries: u32,
    #[serde(default = "default_max_polling_retries")]
    pub max_polling_retries: u32,
    #[serde(default = "default_storage_conflict_attempts")]
    pub storage_conflict_attempts: u32,
    #[serde(default = "default_storage_conflict_backoff_ms")]
    pub storage_conflict_backoff_ms: u64,
    /// Lets every workflow fall back to a warning on dependency cycles.
    #[serde(default)]
    pub allow_dependency_cycles: bool,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_fanout_limit")]
    pub fanout_limit: usize,
    #[serde(default = "default_fanout_progress_interval_secs")]
    pub fanout_progress_interval_secs: u64,
    #[serde(default = "default_require_ext_reconciled")]
    pub require_ext_reconciled: bool,

    #[serde(default)]
    pub clerk: AgentSettings,
    #[serde(default)]
    pub submitter: AgentSettings,
    #[serde(default)]
    pub poller: AgentSettings,
    #[serde(default)]
    pub trigger: AgentSettings,
    #[serde(default)]
    pub finisher: AgentSettings,
}

fn default_max_updates_per_round() -> usize {
    2000
}

fn default_poll_jobs_chunk_size() -> usize {
    2000
}

fn default_operation_quiet_period_secs() -> i64 {
    120
}

fn default_lock_lease_secs() -> i64 {
    600
}

fn default_max_update_retries() -> u32 {
    3
}

fn default_max_polling_retries() -> u32 {
    5
}

fn default_storage_conflict_attempts() -> u32 {
    5
}

fn default_storage_conflict_backoff_ms() -> u64 {
    100
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_fanout_limit() -> usize {
    8
}

fn default_fanout_progress_interval_secs() -> u64 {
    30
}

fn default_require_ext_reconciled() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_updates_per_round: default_max_updates_per_round(),
            poll_jobs_chunk_size: default_poll_jobs_chunk_size(),
            operation_quiet_period_secs: default_operation_quiet_period_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            max_update_retries: default_max_update_retries(),
            max_polling_retries: default_max_polling_retries(),
            storage_conflict_attempts: default_storage_conflict_attempts(),
            storage_conflict_backoff_ms: default_storage_conflict_backoff_ms(),
            allow_dependency_cycles: false,
            cache_ttl_secs: default_cache_ttl_secs(),
            fanout_limit: default_fanout_limit(),
            fanout_progress_interval_secs: default_fanout_progress_interval_secs(),
            require_ext_reconciled: default_require_ext_reconciled(),
            clerk: AgentSettings::default(),
            submitter: AgentSettings::default(),
            poller: AgentSettings::default(),
            trigger: AgentSettings::default(),
            finisher: AgentSettings::default(),
        }
    }
}

impl AgentConfig {
    /// Loads configuration from an optional file and the environment.
    ///
    /// The file format follows its extension (TOML, JSON or YAML).
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read, a value does not
    /// deserialize, or a value is out of range.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: Self = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let pools = [
            ("clerk", &self.clerk),
            ("submitter", &self.submitter),
            ("poller", &self.poller),
            ("trigger", &self.trigger),
            ("finisher", &self.finisher),
        ];
        for (name, settings) in pools {
            if settings.workers == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("{name}.workers"),
                    reason: "must be at least 1".to_string(),
                });
            }
            if settings.poll_period_secs == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("{name}.poll_period_secs"),
                    reason: "must be at least 1".to_string(),
                });
            }
        }
        if self.lock_lease_secs <= 0 {
            return Err(ConfigError::Invalid {
                field: "lock_lease_secs".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.storage_conflict_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "storage_conflict_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn lock_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_lease_secs)
    }

    /// The carrier settings carried by this configuration.
    #[must_use]
    pub fn carrier_config(&self) -> CarrierConfig {
        let defaults = CarrierConfig::default();
        CarrierConfig {
            max_updates_per_round: self.max_updates_per_round,
            poll_jobs_chunk_size: self.poll_jobs_chunk_size,
            operation_quiet_period_secs: self.operation_quiet_period_secs,
            max_update_retries: self.max_update_retries,
            max_polling_retries: self.max_polling_retries,
            conflict_retry: RetryPolicy {
                max_attempts: self.storage_conflict_attempts,
                initial_backoff_ms: self.storage_conflict_backoff_ms,
                ..defaults.conflict_retry
            },
            cache_ttl_secs: self.cache_ttl_secs,
            fanout_limit: self.fanout_limit,
            fanout_progress_interval_secs: self.fanout_progress_interval_secs,
            require_ext_reconciled: self.require_ext_reconciled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::default();
        assert_eq!(config.max_updates_per_round, 2000);
        assert_eq!(config.lock_lease_secs, 600);
        assert_eq!(config.operation_quiet_period_secs, 120);
        assert!(!config.allow_dependency_cycles);
        assert_eq!(config.poller.workers, 4);
        assert_eq!(config.poller.poll_period(), Duration::from_secs(10));
        assert_eq!(config.clerk.batch_size, 50);
        assert_eq!(config.carrier_config(), CarrierConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "lock_lease_secs = 30\nmax_polling_retries = 2\n\n[submitter]\nworkers = 2\nenabled = false"
        )
        .unwrap();

        let config = AgentConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.lock_lease(), chrono::Duration::seconds(30));
        assert_eq!(config.submitter.workers, 2);
        assert!(!config.submitter.enabled);
        assert_eq!(config.submitter.batch_size, 50);
        assert_eq!(config.carrier_config().max_polling_retries, 2);
    }

    #[test]
    fn environment_overrides_nested_keys() {
        // SAFETY: no other test reads this variable.
        unsafe { std::env::set_var("WORKWEAVE__FINISHER__BATCH_SIZE", "7") };
        let config = AgentConfig::load(None).unwrap();
        unsafe { std::env::remove_var("WORKWEAVE__FINISHER__BATCH_SIZE") };
        assert_eq!(config.finisher.batch_size, 7);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"trigger": {{"workers": 0}}}}"#).unwrap();

        let err = AgentConfig::load(Some(file.path())).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                field: "trigger.workers".to_string(),
                reason: "must be at least 1".to_string(),
            }
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = AgentConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }
}
