//! Backlog health monitoring.
//!
//! The [`BacklogMonitor`] reads outbox figures on an interval and classifies
//! them against the thresholds of a [`MonitorConfig`]. A growing backlog
//! means the relay is down or the bus is rejecting events, which would
//! otherwise go unnoticed since writers never block on publication.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::MonitorConfig,
    outbox::{BacklogStats, InspectBacklog, Outbox, OutboxError},
    poller::PollerBuilder,
};

/// Backlog health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Health {
    Ok,
    Warning,
    Critical,
}

/// Classify a backlog. A threshold is breached when the figure is strictly
/// greater than it; the worst breached level wins.
pub fn classify(config: &MonitorConfig, unpublished: u64, oldest_age: Option<Duration>) -> Health {
    let age = oldest_age.unwrap_or_default();
    if unpublished > config.critical_count || age > config.critical_age {
        Health::Critical
    } else if unpublished > config.warning_count || age > config.warning_age {
        Health::Warning
    } else {
        Health::Ok
    }
}

/// Snapshot of the outbox backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BacklogStatus {
    pub unpublished_count: u64,
    /// Age of the oldest unpublished row; `None` when the backlog is empty.
    pub oldest_age_seconds: Option<u64>,
    pub dead_lettered_count: u64,
    pub health: Health,
}

impl BacklogStatus {
    fn from_stats(config: &MonitorConfig, stats: BacklogStats) -> Self {
        let oldest_age = stats
            .oldest_unpublished_at
            .map(|at| (Utc::now() - at).to_std().unwrap_or_default());
        Self {
            unpublished_count: stats.unpublished_count,
            oldest_age_seconds: oldest_age.map(|age| age.as_secs()),
            dead_lettered_count: stats.dead_lettered_count,
            health: classify(config, stats.unpublished_count, oldest_age),
        }
    }
}

/// Periodic backlog check.
pub struct BacklogMonitor<D> {
    outbox: Outbox<D>,
    config: MonitorConfig,
    max_retries: i32,
    status: Option<watch::Sender<Option<BacklogStatus>>>,
    #[cfg(feature = "metrics")]
    metrics: Option<crate::metrics::OutboxMetrics>,
}

impl<D> BacklogMonitor<D>
where
    D: InspectBacklog + Send + Sync,
{
    pub fn new(store: D, config: MonitorConfig) -> Self {
        Self {
            outbox: Outbox::new(store),
            config,
            max_retries: crate::config::RelayConfig::default().max_retries,
            status: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Refresh the backlog gauges of `metrics` on every check.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: crate::metrics::OutboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Retry ceiling used to tell pending rows from dead-lettered ones; keep
    /// it equal to the relay's.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Publish every status to a watch channel, e.g. for a health endpoint.
    pub fn subscribe(&mut self) -> watch::Receiver<Option<BacklogStatus>> {
        match &self.status {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = watch::channel(None);
                self.status = Some(tx);
                rx
            }
        }
    }

    /// Read the backlog once.
    pub async fn status(&self) -> Result<BacklogStatus, OutboxError> {
        let stats = self.outbox.backlog_stats(self.max_retries).await?;
        Ok(BacklogStatus::from_stats(&self.config, stats))
    }

    /// Check the backlog every interval until `cancel` fires.
    ///
    /// Health transitions are logged: warning and critical levels at the
    /// matching severity, the return to ok at info.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) {
        let mut poller = PollerBuilder::new(self.config.interval).build();
        let mut previous = Health::Ok;

        while poller.tick(&cancel).await {
            let status = match self.status().await {
                Ok(status) => status,
                Err(error) => {
                    tracing::error!(%error, "Cannot read outbox backlog");
                    continue;
                }
            };

            match status.health {
                Health::Critical => tracing::error!(
                    unpublished = status.unpublished_count,
                    oldest_age_seconds = status.oldest_age_seconds,
                    dead_lettered = status.dead_lettered_count,
                    "Outbox backlog critical"
                ),
                Health::Warning => tracing::warn!(
                    unpublished = status.unpublished_count,
                    oldest_age_seconds = status.oldest_age_seconds,
                    dead_lettered = status.dead_lettered_count,
                    "Outbox backlog growing"
                ),
                Health::Ok if previous != Health::Ok => {
                    tracing::info!(
                        unpublished = status.unpublished_count,
                        "Outbox backlog recovered"
                    )
                }
                Health::Ok => {
                    tracing::debug!(unpublished = status.unpublished_count, "Outbox backlog ok")
                }
            }
            previous = status.health;

            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record(&status);
            }

            if let Some(tx) = &self.status {
                tx.send_replace(Some(status));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NewEvent, outbox::inmemory::InMemoryOutbox};
    use serde_json::json;

    fn config() -> MonitorConfig {
        MonitorConfig::default()
            .with_warning(2, Duration::from_secs(60))
            .with_critical(4, Duration::from_secs(600))
    }

    #[test]
    fn thresholds_are_exclusive() {
        let config = config();
        assert_eq!(classify(&config, 0, None), Health::Ok);
        assert_eq!(classify(&config, 2, None), Health::Ok);
        assert_eq!(classify(&config, 3, None), Health::Warning);
        assert_eq!(classify(&config, 5, None), Health::Critical);
        assert_eq!(classify(&config, 1, Some(Duration::from_secs(60))), Health::Ok);
        assert_eq!(classify(&config, 1, Some(Duration::from_secs(61))), Health::Warning);
        assert_eq!(classify(&config, 1, Some(Duration::from_secs(601))), Health::Critical);
    }

    #[test]
    fn status_serializes_for_health_endpoints() {
        let status = BacklogStatus {
            unpublished_count: 3,
            oldest_age_seconds: Some(12),
            dead_lettered_count: 1,
            health: Health::Warning,
        };
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "unpublished_count": 3,
                "oldest_age_seconds": 12,
                "dead_lettered_count": 1,
                "health": "WARNING"
            })
        );
    }

    #[tokio::test]
    async fn status_reflects_the_outbox() {
        let store = InMemoryOutbox::default();
        let monitor = BacklogMonitor::new(store.clone(), config());
        assert_eq!(monitor.status().await.unwrap().health, Health::Ok);
        assert_eq!(monitor.status().await.unwrap().oldest_age_seconds, None);

        let outbox = Outbox::new(store.clone());
        let mut tx = store.begin();
        let events = (0..3).map(|i| NewEvent::new("User", i, "UserDeleted", json!({})));
        outbox.append_events(&mut tx, events).await.unwrap();
        tx.commit().await;

        let status = monitor.status().await.unwrap();
        assert_eq!(status.unpublished_count, 3);
        assert_eq!(status.health, Health::Warning);
        assert!(status.oldest_age_seconds.is_some());
    }

    #[tokio::test]
    async fn run_publishes_to_subscribers() {
        let store = InMemoryOutbox::default();
        let mut monitor =
            BacklogMonitor::new(store, config().with_interval(Duration::from_millis(10)));
        let mut rx = monitor.subscribe();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().as_ref().map(|s| s.health), Some(Health::Ok));

        cancel.cancel();
        handle.await.unwrap();
    }
}
