//! Runtime configuration for the relay, the backlog monitor and the inbox.
//!
//! Every config has sensible defaults, `with_*` builder methods, serde
//! support (durations as seconds) and an environment loader reading
//! `OUTPOST_*` variables.

use std::{fmt, str::FromStr, time::Duration};

use serde::Deserialize;
use tracing_error::SpanTrace;

use crate::{backoff::Backoff, outbox::Partition};

const DAY: u64 = 24 * 60 * 60;

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Maximum rows claimed per cycle.
    pub batch_size: usize,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Failed attempts after which a row is dead-lettered.
    pub max_retries: i32,
    /// How long a claimed row stays invisible to other relays.
    #[serde(with = "duration_secs")]
    pub claim_lease: Duration,
    pub backoff: Backoff,
    /// Published rows older than this are purged; `None` keeps them forever.
    #[serde(with = "option_duration_secs")]
    pub retention: Option<Duration>,
    #[serde(with = "duration_secs")]
    pub retention_sweep_interval: Duration,
    pub partition: Partition,
    pub topic_prefix: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_retries: 5,
            claim_lease: Duration::from_secs(30),
            backoff: Backoff::default(),
            retention: Some(Duration::from_secs(7 * DAY)),
            retention_sweep_interval: Duration::from_secs(60 * 60),
            partition: Partition::all(),
            topic_prefix: None,
        }
    }
}

impl RelayConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Restrict the relay to one partition slot out of `total`.
    pub fn with_partitions(mut self, total: u32, partition_id: u32) -> Self {
        self.partition = Partition {
            id: partition_id,
            total,
        };
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    /// Load from the process environment, starting from the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup, starting from the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse(&lookup, "OUTPOST_RELAY_BATCH_SIZE")? {
            config.batch_size = v;
        }
        if let Some(v) = parse_secs(&lookup, "OUTPOST_RELAY_POLL_INTERVAL_SECS")? {
            config.poll_interval = v;
        }
        if let Some(v) = parse(&lookup, "OUTPOST_RELAY_MAX_RETRIES")? {
            config.max_retries = v;
        }
        if let Some(v) = parse_secs(&lookup, "OUTPOST_RELAY_CLAIM_LEASE_SECS")? {
            config.claim_lease = v;
        }
        if let Some(v) = parse_secs(&lookup, "OUTPOST_RELAY_BACKOFF_BASE_SECS")? {
            config.backoff.base = v;
        }
        if let Some(v) = parse_secs(&lookup, "OUTPOST_RELAY_BACKOFF_MAX_SECS")? {
            config.backoff.max = v;
        }
        if let Some(v) = parse(&lookup, "OUTPOST_RELAY_BACKOFF_JITTER")? {
            config.backoff.jitter = v;
        }
        if let Some(retention) = parse_days(&lookup, "OUTPOST_RELAY_RETENTION_DAYS")? {
            config.retention = (!retention.is_zero()).then_some(retention);
        }
        if let Some(v) = parse(&lookup, "OUTPOST_RELAY_PARTITION")? {
            config.partition = v;
        }
        if let Some(v) = lookup("OUTPOST_TOPIC_PREFIX").filter(|v| !v.is_empty()) {
            config.topic_prefix = Some(v);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than zero"));
        }
        if self.max_retries <= 0 {
            return Err(ConfigError::invalid("max_retries", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid("poll_interval", "must be greater than zero"));
        }
        if self.claim_lease.is_zero() {
            return Err(ConfigError::invalid("claim_lease", "must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(ConfigError::invalid("backoff.jitter", "must be within [0, 1]"));
        }
        if self.backoff.base > self.backoff.max {
            return Err(ConfigError::invalid("backoff.base", "must not exceed backoff.max"));
        }
        self.partition
            .check()
            .map_err(|reason| ConfigError::invalid("partition", reason))
    }
}

/// Backlog monitor thresholds and evaluation interval.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    pub warning_count: u64,
    #[serde(with = "duration_secs")]
    pub warning_age: Duration,
    pub critical_count: u64,
    #[serde(with = "duration_secs")]
    pub critical_age: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            warning_count: 100,
            warning_age: Duration::from_secs(5 * 60),
            critical_count: 1000,
            critical_age: Duration::from_secs(30 * 60),
        }
    }
}

impl MonitorConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_warning(mut self, count: u64, age: Duration) -> Self {
        self.warning_count = count;
        self.warning_age = age;
        self
    }

    pub fn with_critical(mut self, count: u64, age: Duration) -> Self {
        self.critical_count = count;
        self.critical_age = age;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = parse_secs(&lookup, "OUTPOST_MONITOR_INTERVAL_SECS")? {
            config.interval = v;
        }
        if let Some(v) = parse(&lookup, "OUTPOST_MONITOR_WARNING_COUNT")? {
            config.warning_count = v;
        }
        if let Some(v) = parse_secs(&lookup, "OUTPOST_MONITOR_WARNING_AGE_SECS")? {
            config.warning_age = v;
        }
        if let Some(v) = parse(&lookup, "OUTPOST_MONITOR_CRITICAL_COUNT")? {
            config.critical_count = v;
        }
        if let Some(v) = parse_secs(&lookup, "OUTPOST_MONITOR_CRITICAL_AGE_SECS")? {
            config.critical_age = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("interval", "must be greater than zero"));
        }
        if self.warning_count > self.critical_count {
            return Err(ConfigError::invalid(
                "warning_count",
                "must not exceed critical_count",
            ));
        }
        if self.warning_age > self.critical_age {
            return Err(ConfigError::invalid("warning_age", "must not exceed critical_age"));
        }
        Ok(())
    }
}

/// Idempotent consumer settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    /// Name recorded in the ledger; events are deduplicated per processor.
    pub processor_name: String,
    /// Number of concurrent lanes; one aggregate always maps to one lane.
    pub lanes: usize,
    /// Local attempts per delivery before it is handed back for redelivery.
    pub max_attempts: u32,
    pub backoff: Backoff,
    #[serde(with = "duration_secs")]
    pub ledger_retention: Duration,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            processor_name: "default".to_owned(),
            lanes: 8,
            max_attempts: 3,
            backoff: Backoff::new(Duration::from_millis(100), Duration::from_secs(30)),
            ledger_retention: Duration::from_secs(7 * DAY),
        }
    }
}

impl InboxConfig {
    pub fn new(processor_name: impl Into<String>) -> Self {
        Self {
            processor_name: processor_name.into(),
            ..Self::default()
        }
    }

    pub fn with_lanes(mut self, lanes: usize) -> Self {
        self.lanes = lanes;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_ledger_retention(mut self, retention: Duration) -> Self {
        self.ledger_retention = retention;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("OUTPOST_INBOX_PROCESSOR") {
            config.processor_name = v;
        }
        if let Some(v) = parse(&lookup, "OUTPOST_INBOX_LANES")? {
            config.lanes = v;
        }
        if let Some(v) = parse(&lookup, "OUTPOST_INBOX_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(retention) = parse_days(&lookup, "OUTPOST_INBOX_RETENTION_DAYS")? {
            config.ledger_retention = retention;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.processor_name.trim().is_empty() {
            return Err(ConfigError::invalid("processor_name", "cannot be empty"));
        }
        if self.lanes == 0 {
            return Err(ConfigError::invalid("lanes", "must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than zero"));
        }
        Ok(())
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("cannot parse {raw:?}: {e}"))),
    }
}

fn parse_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<f64>(lookup, key)? {
        None => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
    }
}

fn parse_days(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    match parse::<u64>(lookup, key)? {
        None => Ok(None),
        Some(days) => days
            .checked_mul(DAY)
            .map(|secs| Some(Duration::from_secs(secs)))
            .ok_or_else(|| ConfigError::invalid(key, format!("{days} days is out of range"))),
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    context: SpanTrace,
    kind: ConfigErrorKind,
}

/// Kinds of configuration errors.
#[derive(Debug)]
pub enum ConfigErrorKind {
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: ConfigErrorKind::Invalid {
                key: key.into(),
                reason: reason.into(),
            },
        }
    }

    pub fn kind(&self) -> &ConfigErrorKind {
        &self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ConfigErrorKind::Invalid { key, reason } => {
                writeln!(f, "Invalid configuration for {key}: {reason}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ConfigError {}

/// Serde adapter for durations expressed as (fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, de::Error};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

pub(crate) mod option_duration_secs {
    use serde::{Deserialize, Deserializer, de::Error};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| Duration::try_from_secs_f64(secs).map_err(D::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn relay_defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retention, Some(Duration::from_secs(7 * DAY)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn relay_config_reads_environment_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("OUTPOST_RELAY_BATCH_SIZE", "25"),
            ("OUTPOST_RELAY_POLL_INTERVAL_SECS", "0.25"),
            ("OUTPOST_RELAY_MAX_RETRIES", "8"),
            ("OUTPOST_RELAY_RETENTION_DAYS", "0"),
            ("OUTPOST_RELAY_PARTITION", "1/4"),
            ("OUTPOST_TOPIC_PREFIX", "nova"),
        ]))
        .unwrap();

        assert_eq!(config.batch_size, 25);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.max_retries, 8);
        assert_eq!(config.retention, None);
        assert_eq!(config.partition, Partition { id: 1, total: 4 });
        assert_eq!(config.topic_prefix.as_deref(), Some("nova"));
    }

    #[test]
    fn relay_config_rejects_bad_values() {
        let err = RelayConfig::from_lookup(lookup(&[("OUTPOST_RELAY_BATCH_SIZE", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ConfigErrorKind::Invalid { key, .. } if key == "OUTPOST_RELAY_BATCH_SIZE"
        ));

        let err = RelayConfig::from_lookup(lookup(&[("OUTPOST_RELAY_PARTITION", "4/4")]))
            .unwrap_err();
        assert!(matches!(err.kind(), ConfigErrorKind::Invalid { key, .. } if key == "partition"));

        assert!(RelayConfig::default().with_max_retries(0).validate().is_err());
        assert!(RelayConfig::default().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn retention_days_out_of_range_are_rejected() {
        let err = RelayConfig::from_lookup(lookup(&[(
            "OUTPOST_RELAY_RETENTION_DAYS",
            "300000000000000",
        )]))
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            ConfigErrorKind::Invalid { key, .. } if key == "OUTPOST_RELAY_RETENTION_DAYS"
        ));

        let days = u64::MAX.to_string();
        let err =
            InboxConfig::from_lookup(lookup(&[("OUTPOST_INBOX_RETENTION_DAYS", days.as_str())]))
                .unwrap_err();
        assert!(matches!(
            err.kind(),
            ConfigErrorKind::Invalid { key, .. } if key == "OUTPOST_INBOX_RETENTION_DAYS"
        ));

        let config =
            InboxConfig::from_lookup(lookup(&[("OUTPOST_INBOX_RETENTION_DAYS", "30")])).unwrap();
        assert_eq!(config.ledger_retention, Duration::from_secs(30 * DAY));
    }

    #[test]
    fn monitor_thresholds_must_be_ordered() {
        let config = MonitorConfig::default().with_warning(2000, Duration::from_secs(60));
        assert!(config.validate().is_err());

        let config = MonitorConfig::from_lookup(lookup(&[
            ("OUTPOST_MONITOR_WARNING_COUNT", "10"),
            ("OUTPOST_MONITOR_CRITICAL_AGE_SECS", "600"),
        ]))
        .unwrap();
        assert_eq!(config.warning_count, 10);
        assert_eq!(config.critical_age, Duration::from_secs(600));
    }

    #[test]
    fn inbox_config_deserializes_with_defaults() {
        let config: InboxConfig = serde_json::from_value(serde_json::json!({
            "processor_name": "follower-counter",
            "lanes": 4,
            "ledger_retention": 3600.0,
        }))
        .unwrap();

        assert_eq!(config.processor_name, "follower-counter");
        assert_eq!(config.lanes, 4);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.ledger_retention, Duration::from_secs(3600));
        assert!(InboxConfig::new(" ").validate().is_err());
    }
}
