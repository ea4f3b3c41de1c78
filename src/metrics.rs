//! Prometheus metrics for the outbox.
//!
//! [`OutboxMetrics`] holds the backlog gauges, refreshed by a
//! [`BacklogMonitor`](crate::BacklogMonitor) through `with_metrics`, and the
//! publication counters, driven by a relay through [`MetricsHook`].

use chrono::{DateTime, Utc};
use prometheus::{IntCounter, IntGauge, Registry, core::Collector};

use crate::{
    event::DomainEvent,
    monitor::BacklogStatus,
    relay::{DefaultRelayHook, RelayHook, RelayRunError},
    transport::TransportError,
};

/// Outbox gauges and counters.
#[derive(Debug, Clone)]
pub struct OutboxMetrics {
    pending: IntGauge,
    oldest_pending_age_seconds: IntGauge,
    dead_lettered: IntGauge,
    published: IntCounter,
    publish_failures: IntCounter,
    dead_lettered_total: IntCounter,
}

impl OutboxMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        Ok(Self {
            pending: IntGauge::new(
                "outbox_pending_count",
                "Number of unpublished outbox events currently pending",
            )?,
            oldest_pending_age_seconds: IntGauge::new(
                "outbox_oldest_pending_age_seconds",
                "Age in seconds of the oldest pending outbox event",
            )?,
            dead_lettered: IntGauge::new(
                "outbox_dead_lettered_count",
                "Number of outbox events quarantined in the dead letter state",
            )?,
            published: IntCounter::new(
                "outbox_published_total",
                "Total number of outbox events marked as published",
            )?,
            publish_failures: IntCounter::new(
                "outbox_publish_failures_total",
                "Total number of transient publish failures",
            )?,
            dead_lettered_total: IntCounter::new(
                "outbox_dead_lettered_total",
                "Total number of outbox events dead-lettered by this process",
            )?,
        })
    }

    /// Register every metric with `registry`.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        let collectors: [Box<dyn Collector>; 6] = [
            Box::new(self.pending.clone()),
            Box::new(self.oldest_pending_age_seconds.clone()),
            Box::new(self.dead_lettered.clone()),
            Box::new(self.published.clone()),
            Box::new(self.publish_failures.clone()),
            Box::new(self.dead_lettered_total.clone()),
        ];
        for collector in collectors {
            registry.register(collector)?;
        }
        Ok(())
    }

    /// Set the backlog gauges from a monitor reading. An empty backlog has
    /// an oldest age of zero.
    pub fn record(&self, status: &BacklogStatus) {
        self.pending.set(saturating_i64(status.unpublished_count));
        self.oldest_pending_age_seconds
            .set(saturating_i64(status.oldest_age_seconds.unwrap_or(0)));
        self.dead_lettered.set(saturating_i64(status.dead_lettered_count));
    }
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Relay hook counting publications before handing every call to `inner`.
#[derive(Debug, Clone)]
pub struct MetricsHook<HK = DefaultRelayHook> {
    metrics: OutboxMetrics,
    inner: HK,
}

impl MetricsHook<DefaultRelayHook> {
    pub fn new(metrics: OutboxMetrics) -> Self {
        Self::wrap(metrics, DefaultRelayHook)
    }
}

impl<HK: RelayHook> MetricsHook<HK> {
    pub fn wrap(metrics: OutboxMetrics, inner: HK) -> Self {
        Self { metrics, inner }
    }
}

impl<HK: RelayHook> RelayHook for MetricsHook<HK> {
    fn on_startup(&self) {
        self.inner.on_startup();
    }

    fn on_shutdown(&self) {
        self.inner.on_shutdown();
    }

    fn on_batch_claimed(&self, size: usize) {
        self.inner.on_batch_claimed(size);
    }

    fn on_published(&self, event: &DomainEvent) {
        self.metrics.published.inc();
        self.inner.on_published(event);
    }

    fn on_publish_failed(
        &self,
        event: &DomainEvent,
        error: &TransportError,
        next_attempt: DateTime<Utc>,
    ) {
        self.metrics.publish_failures.inc();
        self.inner.on_publish_failed(event, error, next_attempt);
    }

    fn on_dead_lettered(&self, event: &DomainEvent, reason: &str) {
        self.metrics.dead_lettered_total.inc();
        self.inner.on_dead_lettered(event, reason);
    }

    fn on_claims_released(&self, count: u64) {
        self.inner.on_claims_released(count);
    }

    fn on_cycle_error(&self, error: &RelayRunError) {
        self.inner.on_cycle_error(error);
    }

    fn on_retention_purged(&self, count: u64) {
        self.inner.on_retention_purged(count);
    }
}
