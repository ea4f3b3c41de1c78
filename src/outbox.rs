//! Outbox abstractions and backend drivers.
//!
//! This module implements the *event writer* side of the transactional
//! outbox: an event is appended in the same transaction as the business
//! mutation it describes, so committing the transaction records the event
//! and rolling it back leaves no trace of it.
//!
//! Delivery is handled separately by the [`Relay`](crate::Relay), which
//! claims pending rows through [`ClaimEvents`].
//!
//! ## Components
//!
//! - [`Outbox`]: High-level façade over an outbox backend
//! - [`AppendEvents`]: Insert events within a caller-owned transaction
//! - [`ClaimEvents`]: Claim batches and record delivery outcomes
//! - [`InspectBacklog`]: Aggregate backlog figures for monitoring
//! - [`AdministerEvents`]: Dead-letter inspection, requeue and retention
//!
//! Concrete implementations are provided by backend modules such as
//! [`inmemory`] and [`sqlx`] (feature-gated).

pub mod inmemory;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::{hash::BuildHasher, str::FromStr, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use tracing_error::SpanTrace;

use crate::event::{DomainEvent, NewEvent};

/// Error returned by outbox operations.
///
/// Wraps the underlying backend error and captures a tracing span backtrace
/// for improved diagnostics.
#[derive(Debug)]
pub struct OutboxError {
    context: SpanTrace,
    kind: OutboxErrorKind,
}

/// Kinds of outbox errors.
#[derive(Debug)]
pub enum OutboxErrorKind {
    /// The backend failed to read or write.
    Storage(tower::BoxError),
    /// The payload could not be serialized.
    Serialization(serde_json::Error),
    /// No row with this id (or not in a state the operation applies to).
    NotFound(i64),
    /// The event was rejected before reaching storage.
    InvalidEvent(String),
}

impl OutboxError {
    pub(crate) fn storage(err: impl Into<tower::BoxError>) -> Self {
        Self::new(OutboxErrorKind::Storage(err.into()))
    }

    fn new(kind: OutboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &OutboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for OutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OutboxErrorKind::Storage(err) => writeln!(f, "Storage error: {err}"),
            OutboxErrorKind::Serialization(err) => writeln!(f, "Serialization error: {err}"),
            OutboxErrorKind::NotFound(id) => writeln!(f, "Outbox event {id} not found"),
            OutboxErrorKind::InvalidEvent(reason) => writeln!(f, "Invalid event: {reason}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for OutboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            OutboxErrorKind::Storage(err) => Some(err.as_ref()),
            OutboxErrorKind::Serialization(err) => Some(err),
            OutboxErrorKind::NotFound(_) | OutboxErrorKind::InvalidEvent(_) => None,
        }
    }
}

/// A relay's share of the outbox.
///
/// Every row carries a non-negative hash of its partition key; a relay
/// configured with `Partition { id, total }` only claims rows whose hash
/// modulo `total` equals `id`. Since the hash derives from the partition
/// key, one aggregate always lands in one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: u32,
    pub total: u32,
}

impl Partition {
    /// The whole outbox.
    pub const fn all() -> Self {
        Self { id: 0, total: 1 }
    }

    pub fn contains(&self, partition_hash: i32) -> bool {
        self.total <= 1
            || i64::from(partition_hash).rem_euclid(i64::from(self.total)) == i64::from(self.id)
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.total == 0 {
            return Err("total must be greater than zero".to_owned());
        }
        if self.id >= self.total {
            return Err(format!("id {} out of range for {} partitions", self.id, self.total));
        }
        Ok(())
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::all()
    }
}

/// Parses `"<id>/<total>"`, e.g. `"1/4"`.
impl FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, total) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <id>/<total>, got {s:?}"))?;
        let id = id.trim().parse().map_err(|e| format!("bad partition id: {e}"))?;
        let total = total.trim().parse().map_err(|e| format!("bad partition total: {e}"))?;
        Ok(Self { id, total })
    }
}

/// Hash used by in-process backends to place a partition key in a slot.
pub(crate) fn calculate_partition(key: &str) -> i32 {
    let state = ahash::RandomState::with_seeds(0x6f75, 0x7470, 0x6f73, 0x74);
    let hash = BuildHasher::hash_one(&state, key);
    (hash & i32::MAX as u64) as i32
}

/// Parameters of a single claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest {
    /// Maximum number of rows to claim.
    pub limit: usize,
    /// Rows that failed this many times are dead-lettered and never claimed.
    pub max_retries: i32,
    /// How long claimed rows stay invisible to other claims.
    pub lease: Duration,
    pub partition: Partition,
}

/// What to do with a row after a transient publish failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Make the row claimable again at this instant.
    At(DateTime<Utc>),
    /// The retry budget is spent; quarantine the row.
    Exhausted,
}

/// Backlog figures reported by [`InspectBacklog`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BacklogStats {
    /// Unpublished rows that are still eligible for delivery.
    pub unpublished_count: u64,
    pub oldest_unpublished_at: Option<DateTime<Utc>>,
    pub dead_lettered_count: u64,
}

/// `now + delay`, saturating instead of overflowing.
pub(crate) fn deadline(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// High-level façade over an outbox backend.
///
/// `Outbox` provides a stable API for appending events and administering the
/// outbox while delegating persistence to the underlying backend.
#[derive(Debug, Clone)]
pub struct Outbox<D>(D);

impl<D> Outbox<D> {
    /// Create a new outbox backed by the given backend implementation.
    pub fn new(driver: D) -> Self {
        Self(driver)
    }

    pub fn driver(&self) -> &D {
        &self.0
    }

    /// Append one event within the caller's transaction.
    ///
    /// Nothing is committed or rolled back here: the event becomes durable
    /// exactly when the caller commits `tx`. Returns the row id.
    #[instrument(skip_all, fields(aggregate_type = %aggregate_type, event_type = %event_type))]
    pub async fn append_event(
        &self,
        tx: &mut D::Transaction<'_>,
        aggregate_type: &str,
        aggregate_id: impl ToString,
        event_type: &str,
        payload: impl Serialize,
    ) -> Result<i64, OutboxError>
    where
        D: AppendEvents,
    {
        let payload = serde_json::to_value(payload)
            .map_err(|e| OutboxError::new(OutboxErrorKind::Serialization(e)))?;
        let event = NewEvent::new(aggregate_type, aggregate_id, event_type, payload);
        let ids = self.append_events(tx, [event]).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| OutboxError::storage("backend returned no id for appended event"))
    }

    /// Append a batch of events within the caller's transaction.
    ///
    /// The whole batch is validated first; one invalid event rejects all of
    /// them without touching storage.
    #[instrument(skip_all)]
    pub async fn append_events(
        &self,
        tx: &mut D::Transaction<'_>,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> Result<Vec<i64>, OutboxError>
    where
        D: AppendEvents,
    {
        let events: Vec<NewEvent> = events.into_iter().collect();
        for event in &events {
            event
                .validate()
                .map_err(|reason| OutboxError::new(OutboxErrorKind::InvalidEvent(reason)))?;
        }
        if events.is_empty() {
            return Ok(Vec::new());
        }

        let ids = self.0.append(events, tx).await.map_err(OutboxError::storage)?;
        tracing::debug!(count = ids.len(), "Events appended to outbox");
        Ok(ids)
    }

    #[instrument(skip(self))]
    pub async fn backlog_stats(&self, max_retries: i32) -> Result<BacklogStats, OutboxError>
    where
        D: InspectBacklog,
    {
        self.0
            .backlog_stats(max_retries)
            .await
            .map_err(OutboxError::storage)
    }

    /// Dead-lettered rows, oldest first.
    #[instrument(skip(self))]
    pub async fn list_dead_lettered(
        &self,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, OutboxError>
    where
        D: AdministerEvents,
    {
        self.0
            .list_dead_lettered(max_retries, limit)
            .await
            .map_err(OutboxError::storage)
    }

    /// Reset an unpublished row so the relay picks it up again.
    #[instrument(skip(self))]
    pub async fn requeue(&self, id: i64) -> Result<(), OutboxError>
    where
        D: AdministerEvents,
    {
        let requeued = self.0.requeue(id).await.map_err(OutboxError::storage)?;
        if !requeued {
            return Err(OutboxError::new(OutboxErrorKind::NotFound(id)));
        }
        tracing::info!(id, "Outbox event requeued");
        Ok(())
    }

    /// Delete published rows older than `older_than`. Unpublished rows are
    /// never touched.
    #[instrument(skip(self))]
    pub async fn purge_published_older_than(&self, older_than: Duration) -> Result<u64, OutboxError>
    where
        D: AdministerEvents,
    {
        self.0
            .purge_published_older_than(older_than)
            .await
            .map_err(OutboxError::storage)
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<DomainEvent, OutboxError>
    where
        D: AdministerEvents,
    {
        self.0
            .get(id)
            .await
            .map_err(OutboxError::storage)?
            .ok_or_else(|| OutboxError::new(OutboxErrorKind::NotFound(id)))
    }
}

/// Trait for inserting events into the outbox.
///
/// Implementations must insert through the given transaction so the event
/// shares the fate of the caller's business mutation.
#[async_trait::async_trait]
pub trait AppendEvents {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;
    /// Transaction type used for atomic insertion.
    type Transaction<'a>;

    /// Insert a batch of validated events, returning their row ids in order.
    async fn append(
        &self,
        events: Vec<NewEvent>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<Vec<i64>, Self::Error>;
}

/// Trait for claiming pending events and recording delivery outcomes.
///
/// Every state transition is a single atomic write that leaves published
/// rows untouched; the returned `bool` reports whether a row was changed.
#[async_trait::async_trait]
pub trait ClaimEvents {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Lease up to `request.limit` of the oldest eligible rows.
    ///
    /// A row is eligible when it is unpublished, not dead-lettered, below the
    /// retry ceiling, not under lease or backoff, inside the partition slot,
    /// and no older unpublished row with the same partition key is currently
    /// leased or backing off. Rows come back ordered by `(created_at, id)`.
    /// Rows leased by a concurrent claim are skipped, never returned twice.
    async fn claim(&self, request: ClaimRequest) -> Result<Vec<DomainEvent>, Self::Error>;

    async fn mark_published(&self, id: i64) -> Result<bool, Self::Error>;

    /// Count a failed attempt and reschedule or quarantine the row.
    async fn mark_failed(&self, id: i64, error: &str, retry: Retry) -> Result<bool, Self::Error>;

    /// Quarantine the row without touching its retry count.
    async fn mark_dead_lettered(&self, id: i64, error: &str) -> Result<bool, Self::Error>;

    /// Return leased rows to the pool immediately.
    async fn release(&self, ids: &[i64]) -> Result<u64, Self::Error>;
}

/// Trait for reading backlog figures.
#[async_trait::async_trait]
pub trait InspectBacklog {
    type Error: Into<tower::BoxError>;

    async fn backlog_stats(&self, max_retries: i32) -> Result<BacklogStats, Self::Error>;
}

/// Trait for operator actions on the outbox.
#[async_trait::async_trait]
pub trait AdministerEvents {
    type Error: Into<tower::BoxError>;

    async fn list_dead_lettered(
        &self,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, Self::Error>;

    /// Clear the retry count and quarantine of an unpublished row.
    async fn requeue(&self, id: i64) -> Result<bool, Self::Error>;

    async fn purge_published_older_than(&self, older_than: Duration) -> Result<u64, Self::Error>;

    async fn get(&self, id: i64) -> Result<Option<DomainEvent>, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::inmemory::InMemoryOutbox;
    use serde_json::json;

    #[test]
    fn partition_slots_cover_every_hash_once() {
        let slots: Vec<_> = (0..4).map(|id| Partition { id, total: 4 }).collect();
        for key in ["1", "42", "user-7", "tenant-3"] {
            let hash = calculate_partition(key);
            assert!(hash >= 0);
            assert_eq!(slots.iter().filter(|slot| slot.contains(hash)).count(), 1);
        }
        assert!(Partition::all().contains(calculate_partition("anything")));
    }

    #[test]
    fn partition_parses_and_checks() {
        let partition: Partition = "2/3".parse().unwrap();
        assert_eq!(partition, Partition { id: 2, total: 3 });
        assert!(partition.check().is_ok());
        assert!("3/3".parse::<Partition>().unwrap().check().is_err());
        assert!("3".parse::<Partition>().is_err());
    }

    #[tokio::test]
    async fn append_event_is_visible_only_after_commit() {
        let store = InMemoryOutbox::default();
        let outbox = Outbox::new(store.clone());

        let mut tx = store.begin();
        let id = outbox
            .append_event(&mut tx, "User", 42, "UserDeleted", json!({ "user_id": 42 }))
            .await
            .unwrap();
        assert!(store.events().await.is_empty());

        tx.commit().await;
        let event = outbox.get(id).await.unwrap();
        assert_eq!(event.aggregate_id, "42");
        assert_eq!(event.partition_key, "42");
        assert_eq!(event.retry_count, 0);
    }

    #[tokio::test]
    async fn invalid_events_are_rejected_before_storage() {
        let store = InMemoryOutbox::default();
        let outbox = Outbox::new(store.clone());

        let mut tx = store.begin();
        let err = outbox
            .append_events(
                &mut tx,
                [
                    NewEvent::new("User", "1", "UserDeleted", json!({})),
                    NewEvent::new("User", "", "UserDeleted", json!({})),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), OutboxErrorKind::InvalidEvent(_)));

        tx.commit().await;
        assert!(store.events().await.is_empty());
    }

    #[tokio::test]
    async fn requeue_of_unknown_row_is_not_found() {
        let outbox = Outbox::new(InMemoryOutbox::default());
        let err = outbox.requeue(99).await.unwrap_err();
        assert!(matches!(err.kind(), OutboxErrorKind::NotFound(99)));
    }
}
