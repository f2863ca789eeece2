//! Recognised configuration options. Loading config from files or the environment is out
//! of scope; callers build a `Config` directly.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Billing mode for the backing table, used only by the table provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingMode {
    OnDemand,
    Provisioned {
        read_capacity_units: i64,
        write_capacity_units: i64,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub consumer_group: String,
    pub consumer_id: String,
    pub stream_name: String,
    pub stream_created_on: DateTime<Utc>,

    /// Recorded into every `ConsumerEntry` this worker registers; identifies the
    /// running process to a human reading the document, nothing more.
    pub app_name: String,
    pub host: String,

    /// Selects shared-shards (`true`) vs. per-consumer shard bookkeeping (`false`).
    pub use_auto_shard_assignment: bool,
    /// Selects server-side fan-out mode.
    pub use_enhanced_fan_out: bool,

    heartbeat_period: Duration,
    heartbeat_failure_timeout: Duration,

    /// Default shard lease length used by callers of `lockShardLease`.
    pub lease_duration: Duration,

    pub table_name: String,
    pub tags: Vec<(String, String)>,
    pub billing_mode: BillingMode,
}

impl Config {
    /// Builds a `Config`, enforcing the invariant that the heartbeat failure threshold is
    /// at least 3x the heartbeat period so a transient network blip can't evict
    /// a live consumer before its next beat even has a chance to land.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer_group: impl Into<String>,
        consumer_id: impl Into<String>,
        stream_name: impl Into<String>,
        stream_created_on: DateTime<Utc>,
        app_name: impl Into<String>,
        host: impl Into<String>,
        use_auto_shard_assignment: bool,
        use_enhanced_fan_out: bool,
        heartbeat_period: Duration,
        heartbeat_failure_timeout: Duration,
        lease_duration: Duration,
        table_name: impl Into<String>,
        tags: Vec<(String, String)>,
        billing_mode: BillingMode,
    ) -> Result<Config, ConfigError> {
        if heartbeat_failure_timeout < heartbeat_period * 3 {
            return Err(ConfigError::HeartbeatThresholdTooLow {
                timeout_ms: heartbeat_failure_timeout.as_millis() as u64,
                period_ms: heartbeat_period.as_millis() as u64,
            });
        }
        Ok(Config {
            consumer_group: consumer_group.into(),
            consumer_id: consumer_id.into(),
            stream_name: stream_name.into(),
            stream_created_on,
            app_name: app_name.into(),
            host: host.into(),
            use_auto_shard_assignment,
            use_enhanced_fan_out,
            heartbeat_period,
            heartbeat_failure_timeout,
            lease_duration,
            table_name: table_name.into(),
            tags,
            billing_mode,
        })
    }

    pub fn heartbeat_period(&self) -> Duration {
        self.heartbeat_period
    }

    pub fn heartbeat_failure_timeout(&self) -> Duration {
        self.heartbeat_failure_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_build(period: Duration, timeout: Duration) -> Result<Config, ConfigError> {
        Config::new(
            "group",
            "consumer",
            "stream",
            Utc::now(),
            "test-app",
            "test-host",
            true,
            false,
            period,
            timeout,
            Duration::from_secs(10),
            "table",
            vec![],
            BillingMode::OnDemand,
        )
    }

    #[test]
    fn rejects_threshold_below_3x_period() {
        let err = try_build(Duration::from_secs(10), Duration::from_secs(29)).unwrap_err();
        assert_eq!(
            err,
            ConfigError::HeartbeatThresholdTooLow {
                timeout_ms: 29_000,
                period_ms: 10_000,
            }
        );
    }

    #[test]
    fn accepts_exactly_3x_period() {
        assert!(try_build(Duration::from_secs(10), Duration::from_secs(30)).is_ok());
    }
}
