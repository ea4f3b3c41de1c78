//! Relay loop for delivering outbox events through a transport.
//!
//! This module implements the *outbox relay* that:
//!
//! - Claims batches of pending events from the outbox
//! - Publishes them through a [`Transport`], keyed by partition key
//! - Marks them published, schedules retries with backoff, or dead-letters them
//! - Exposes lifecycle hooks for observability and customization
//!
//! Several relays may run against the same outbox; claims are leased so no
//! row is handed to two relays at once. The relay runs until its
//! [`CancellationToken`] is triggered, then releases the rows it still holds.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Utc};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::{
    config::{ConfigError, RelayConfig},
    event::{DomainEvent, EventEnvelope},
    outbox::{AdministerEvents, ClaimEvents, ClaimRequest, Retry, deadline},
    poller::PollerBuilder,
    transport::{Publication, TopicNaming, Transport, TransportError},
};

/// Counters for a single relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub published: usize,
    /// Transient failures rescheduled with backoff.
    pub retried: usize,
    pub dead_lettered: usize,
    /// Claimed rows handed back untouched.
    pub released: usize,
}

/// Outbox relay.
///
/// Generic parameters:
/// - `D`: Outbox store
/// - `T`: Transport service type
/// - `HK`: Hook implementation for lifecycle events
pub struct Relay<D, T, HK = DefaultRelayHook> {
    store: D,
    transport: Transport<T>,
    config: RelayConfig,
    naming: TopicNaming,
    hook: HK,
    wake: Option<Arc<Notify>>,
}

impl<D, T> Relay<D, T, DefaultRelayHook> {
    /// Create a new relay with the default hook implementation.
    ///
    /// Fails if `config` does not pass [`RelayConfig::validate`].
    pub fn new(
        store: D,
        transport: Transport<T>,
        config: RelayConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let naming = match &config.topic_prefix {
            Some(prefix) => TopicNaming::with_prefix(prefix.clone()),
            None => TopicNaming::new(),
        };
        Ok(Self {
            store,
            transport,
            config,
            naming,
            hook: DefaultRelayHook,
            wake: None,
        })
    }
}

impl<D, T, HK> Relay<D, T, HK>
where
    D: ClaimEvents + AdministerEvents + Send + Sync,
    HK: RelayHook,
    T: Service<Publication<EventEnvelope>> + Clone + Send + 'static,
    T::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    /// Replace the relay hook while keeping all other generics unchanged.
    pub fn with_hook<HK2: RelayHook>(self, hook: HK2) -> Relay<D, T, HK2> {
        Relay {
            store: self.store,
            transport: self.transport,
            config: self.config,
            naming: self.naming,
            hook,
            wake: self.wake,
        }
    }

    pub fn with_topic_naming(mut self, naming: TopicNaming) -> Self {
        self.naming = naming;
        self
    }

    /// Start a cycle as soon as `notify` fires instead of waiting for the
    /// next poll tick.
    pub fn wake_on(mut self, notify: Arc<Notify>) -> Self {
        self.wake = Some(notify);
        self
    }

    /// Run the relay loop until `cancel` fires.
    ///
    /// Each wake-up drains the outbox in batches for as long as full batches
    /// come back. Failed cycles are reported to the hook and retried on the
    /// next tick. When retention is configured, published rows past it are
    /// purged once per sweep interval.
    #[tracing::instrument(skip_all, fields(partition = ?self.config.partition))]
    pub async fn run(mut self, cancel: CancellationToken) {
        self.hook.on_startup();

        let mut poller = PollerBuilder::new(self.config.poll_interval)
            .wake_on(self.wake.clone())
            .build();
        let mut last_sweep: Option<Instant> = None;

        while poller.tick(&cancel).await {
            loop {
                let full_batch = self.config.batch_size.max(1);
                match self.run_once(&cancel).await {
                    Ok(report) if report.claimed >= full_batch => {
                        if cancel.is_cancelled() {
                            break;
                        }
                    }
                    Ok(_) => break,
                    Err(error) => {
                        self.hook.on_cycle_error(&error);
                        break;
                    }
                }
            }

            if !cancel.is_cancelled() {
                self.sweep_retention(&mut last_sweep).await;
            }
        }

        self.hook.on_shutdown();
    }

    /// Claim one batch and publish it.
    ///
    /// Rows are published in `(created_at, id)` order. Once a partition key
    /// fails transiently, its later rows in the batch are released untouched
    /// so they are never published ahead of it. If `cancel` fires, the
    /// in-flight publish completes and the rest of the batch is released.
    #[tracing::instrument(skip_all)]
    pub async fn run_once(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, RelayRunError> {
        let claimed = self
            .store
            .claim(ClaimRequest {
                limit: self.config.batch_size,
                max_retries: self.config.max_retries,
                lease: self.config.claim_lease,
                partition: self.config.partition,
            })
            .await
            .map_err(|e| RelayRunError::storage(e.into()))?;

        let mut report = BatchReport {
            claimed: claimed.len(),
            ..BatchReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        self.hook.on_batch_claimed(claimed.len());

        let mut blocked: HashSet<String> = HashSet::new();
        let mut to_release = Vec::new();
        let mut rows = claimed.into_iter();

        while let Some(event) = rows.next() {
            if cancel.is_cancelled() {
                to_release.push(event.id);
                to_release.extend(rows.by_ref().map(|e| e.id));
                break;
            }
            if blocked.contains(&event.partition_key) {
                to_release.push(event.id);
                continue;
            }

            if let Err(error) = self.deliver(&event, &mut blocked, &mut report).await {
                to_release.extend(rows.map(|e| e.id));
                self.release(&to_release, &mut report).await;
                return Err(error);
            }
        }

        if !to_release.is_empty() {
            self.release(&to_release, &mut report).await;
        }
        Ok(report)
    }

    #[tracing::instrument(
        skip_all,
        fields(
            id = event.id,
            event_id = %event.event_id,
            aggregate_id = %event.aggregate_id,
            retry_count = event.retry_count
        )
    )]
    async fn deliver(
        &mut self,
        event: &DomainEvent,
        blocked: &mut HashSet<String>,
        report: &mut BatchReport,
    ) -> Result<(), RelayRunError> {
        let publication = Publication::from_event(event, &self.naming);

        match self.transport.send(publication).await {
            Ok(()) => {
                self.store
                    .mark_published(event.id)
                    .await
                    .map_err(|e| RelayRunError::storage(e.into()))?;
                report.published += 1;
                self.hook.on_published(event);
            }
            Err(error) if error.is_permanent() => {
                let reason = error.to_string();
                self.store
                    .mark_dead_lettered(event.id, &reason)
                    .await
                    .map_err(|e| RelayRunError::storage(e.into()))?;
                report.dead_lettered += 1;
                self.hook.on_dead_lettered(event, &reason);
            }
            Err(error) => {
                blocked.insert(event.partition_key.clone());
                let reason = error.to_string();
                let attempt = event.retry_count.saturating_add(1);

                if attempt >= self.config.max_retries {
                    self.store
                        .mark_failed(event.id, &reason, Retry::Exhausted)
                        .await
                        .map_err(|e| RelayRunError::storage(e.into()))?;
                    report.dead_lettered += 1;
                    self.hook.on_dead_lettered(event, &reason);
                } else {
                    let delay = self.config.backoff.delay(event.retry_count.max(0) as u32);
                    let next_attempt = deadline(delay);
                    self.store
                        .mark_failed(event.id, &reason, Retry::At(next_attempt))
                        .await
                        .map_err(|e| RelayRunError::storage(e.into()))?;
                    report.retried += 1;
                    self.hook.on_publish_failed(event, &error, next_attempt);
                }
            }
        }
        Ok(())
    }

    async fn release(&self, ids: &[i64], report: &mut BatchReport) {
        match self.store.release(ids).await {
            Ok(count) => {
                report.released += ids.len();
                self.hook.on_claims_released(count);
            }
            // Unreleased rows become claimable again once their lease expires.
            Err(e) => self.hook.on_cycle_error(&RelayRunError::storage(e.into())),
        }
    }

    async fn sweep_retention(&self, last_sweep: &mut Option<Instant>) {
        let Some(retention) = self.config.retention else {
            return;
        };
        if last_sweep.is_some_and(|at| at.elapsed() < self.config.retention_sweep_interval) {
            return;
        }
        *last_sweep = Some(Instant::now());

        match self.store.purge_published_older_than(retention).await {
            Ok(count) => self.hook.on_retention_purged(count),
            Err(e) => self.hook.on_cycle_error(&RelayRunError::storage(e.into())),
        }
    }
}

/// Error returned when a relay cycle fails.
#[derive(Debug)]
pub struct RelayRunError {
    context: tracing_error::SpanTrace,
    kind: RelayRunErrorKind,
}

impl RelayRunError {
    fn storage(error: tower::BoxError) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: RelayRunErrorKind::Storage(error),
        }
    }

    pub fn kind(&self) -> &RelayRunErrorKind {
        &self.kind
    }
}

/// Classification of relay runtime errors.
#[derive(Debug)]
pub enum RelayRunErrorKind {
    /// The outbox could not be read or updated.
    Storage(tower::BoxError),
}

impl std::fmt::Display for RelayRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RelayRunErrorKind::Storage(err) => writeln!(f, "Outbox storage error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for RelayRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            RelayRunErrorKind::Storage(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing relay lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait RelayHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_batch_claimed(&self, size: usize);
    fn on_published(&self, event: &DomainEvent);
    fn on_publish_failed(
        &self,
        event: &DomainEvent,
        error: &TransportError,
        next_attempt: DateTime<Utc>,
    );
    fn on_dead_lettered(&self, event: &DomainEvent, reason: &str);
    fn on_claims_released(&self, count: u64);
    fn on_cycle_error(&self, error: &RelayRunError);
    fn on_retention_purged(&self, count: u64);
}

/// Default relay hook implementation.
///
/// Logs lifecycle events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRelayHook;

impl RelayHook for DefaultRelayHook {
    fn on_startup(&self) {
        tracing::info!("Relay is starting up");
    }

    fn on_shutdown(&self) {
        tracing::info!("Relay is shutting down");
    }

    fn on_batch_claimed(&self, size: usize) {
        tracing::debug!(size, "Batch claimed");
    }

    fn on_published(&self, event: &DomainEvent) {
        tracing::debug!(id = event.id, event_type = %event.event_type, "Event published");
    }

    fn on_publish_failed(
        &self,
        event: &DomainEvent,
        error: &TransportError,
        next_attempt: DateTime<Utc>,
    ) {
        tracing::warn!(
            id = event.id,
            retry_count = event.retry_count + 1,
            %next_attempt,
            ?error,
            "Publish failed, retry scheduled"
        );
    }

    fn on_dead_lettered(&self, event: &DomainEvent, reason: &str) {
        tracing::error!(
            id = event.id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            reason,
            "Event dead-lettered"
        );
    }

    fn on_claims_released(&self, count: u64) {
        tracing::debug!(count, "Claims released");
    }

    fn on_cycle_error(&self, error: &RelayRunError) {
        tracing::error!(?error, "Relay cycle failed");
    }

    fn on_retention_purged(&self, count: u64) {
        if count > 0 {
            tracing::info!(count, "Published events purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::NewEvent,
        outbox::{InspectBacklog, inmemory::InMemoryOutbox},
        transport::{InMemory, Sender},
    };
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Fails the first `failures` sends for aggregate "bad", permanently if asked.
    #[derive(Clone)]
    struct Flaky {
        inner: InMemory<EventEnvelope>,
        failures: Arc<AtomicUsize>,
        permanent: bool,
    }

    #[async_trait::async_trait]
    impl Sender<EventEnvelope> for Flaky {
        type Error = TransportError;

        async fn send(
            &mut self,
            publication: Publication<EventEnvelope>,
        ) -> Result<(), Self::Error> {
            if publication.key == "bad"
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(if self.permanent {
                    TransportError::permanent("malformed payload")
                } else {
                    TransportError::transient("broker unavailable")
                });
            }
            let _ = self.inner.send(publication).await;
            Ok(())
        }
    }

    fn flaky(failures: usize, permanent: bool) -> (Flaky, InMemory<EventEnvelope>) {
        let bus = InMemory::default();
        let sender = Flaky {
            inner: bus.clone(),
            failures: Arc::new(AtomicUsize::new(failures)),
            permanent,
        };
        (sender, bus)
    }

    fn config() -> RelayConfig {
        RelayConfig::default()
            .with_max_retries(3)
            .with_backoff(crate::backoff::Backoff::new(Duration::ZERO, Duration::ZERO))
    }

    async fn seed(store: &InMemoryOutbox, keys: &[&str]) -> Vec<i64> {
        let mut tx = store.begin();
        let events: Vec<_> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| NewEvent::new("User", *key, "UserUpdated", json!({ "seq": i })))
            .collect();
        let ids = crate::Outbox::new(store.clone())
            .append_events(&mut tx, events)
            .await
            .unwrap();
        tx.commit().await;
        ids
    }

    #[test]
    fn rejects_invalid_config() {
        let store = InMemoryOutbox::default();
        let bus = InMemory::<EventEnvelope>::default();
        let Err(err) = Relay::new(store, Transport::new(bus), config().with_batch_size(0)) else {
            panic!("a zero batch size must be rejected");
        };
        assert!(matches!(
            err.kind(),
            crate::config::ConfigErrorKind::Invalid { key, .. } if key == "batch_size"
        ));
    }

    #[tokio::test]
    async fn publishes_in_order_and_marks_rows() {
        let store = InMemoryOutbox::default();
        let bus = InMemory::<EventEnvelope>::default();
        let ids = seed(&store, &["1", "2", "1"]).await;

        let mut relay = Relay::new(store.clone(), Transport::new(bus.clone()), config()).unwrap();
        let report = relay.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.published, 3);
        let sent: Vec<_> = bus
            .sent_messages()
            .await
            .into_iter()
            .map(|p| p.payload.payload["seq"].as_u64().unwrap())
            .collect();
        assert_eq!(sent, vec![0, 1, 2]);
        for id in ids {
            assert!(store.get(id).await.unwrap().unwrap().published_at.is_some());
        }
    }

    #[tokio::test]
    async fn transient_failure_holds_back_the_rest_of_the_aggregate() {
        let store = InMemoryOutbox::default();
        let (sender, bus) = flaky(1, false);
        let ids = seed(&store, &["bad", "bad", "good"]).await;

        let mut relay = Relay::new(store.clone(), Transport::new(sender), config()).unwrap();
        let report = relay.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            BatchReport { claimed: 3, published: 1, retried: 1, dead_lettered: 0, released: 1 }
        );

        let failed = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.as_deref().unwrap().contains("broker unavailable"));
        assert_eq!(store.get(ids[1]).await.unwrap().unwrap().retry_count, 0);

        // Zero backoff: the failed row is due again, and its sibling follows it.
        let report = relay.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.published, 2);
        let order: Vec<_> = bus
            .sent_messages()
            .await
            .into_iter()
            .map(|p| p.payload.payload["seq"].clone())
            .collect();
        assert_eq!(order, vec![json!(2), json!(0), json!(1)]);
    }

    #[tokio::test]
    async fn permanent_failure_dead_letters_without_spending_retries() {
        let store = InMemoryOutbox::default();
        let (sender, _bus) = flaky(1, true);
        let ids = seed(&store, &["bad", "bad"]).await;

        let mut relay = Relay::new(store.clone(), Transport::new(sender), config()).unwrap();
        let report = relay.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.published, 1);

        let dead = store.get(ids[0]).await.unwrap().unwrap();
        assert!(dead.dead_lettered_at.is_some());
        assert_eq!(dead.retry_count, 0);
    }

    #[tokio::test]
    async fn retry_ceiling_quarantines_the_row() {
        let store = InMemoryOutbox::default();
        let (sender, _bus) = flaky(usize::MAX, false);
        let ids = seed(&store, &["bad"]).await;

        let mut relay = Relay::new(store.clone(), Transport::new(sender), config()).unwrap();
        for _ in 0..3 {
            relay.run_once(&CancellationToken::new()).await.unwrap();
        }

        let row = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 3);
        assert!(row.is_dead_lettered(3));
        assert_eq!(relay.run_once(&CancellationToken::new()).await.unwrap().claimed, 0);
        assert_eq!(store.backlog_stats(3).await.unwrap().dead_lettered_count, 1);
    }

    #[tokio::test]
    async fn cancelled_cycle_releases_its_claims() {
        let store = InMemoryOutbox::default();
        seed(&store, &["1", "2"]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let bus = InMemory::<EventEnvelope>::default();
        let mut relay = Relay::new(store.clone(), Transport::new(bus), config()).unwrap();
        let report = relay.run_once(&cancel).await.unwrap();
        assert_eq!(report.released, 2);
        assert_eq!(report.published, 0);

        let report = relay.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.published, 2);
    }

    #[tokio::test]
    async fn run_drains_and_stops_on_cancel() {
        let store = InMemoryOutbox::default();
        let bus = InMemory::<EventEnvelope>::default();
        seed(&store, &["1", "2", "3", "4", "5"]).await;

        let cancel = CancellationToken::new();
        let relay = Relay::new(
            store.clone(),
            Transport::new(bus.clone()),
            config().with_batch_size(2).with_poll_interval(Duration::from_millis(10)),
        )
        .unwrap()
        .wake_on(store.notifier());
        let handle = tokio::spawn(relay.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.sent_messages().await.len() < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.backlog_stats(3).await.unwrap().unpublished_count, 0);
    }
}
