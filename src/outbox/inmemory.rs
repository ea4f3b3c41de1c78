use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::sync::{Mutex, Notify};

use crate::{
    event::{DomainEvent, NewEvent},
    outbox::{
        AdministerEvents, AppendEvents, BacklogStats, ClaimEvents, ClaimRequest, InspectBacklog,
        Retry, calculate_partition, deadline,
    },
};

/// An in-memory outbox for testing or local usage.
///
/// Rows live in a `BTreeMap` keyed by id. Appends go through an
/// [`InMemoryTransaction`] and only become visible on
/// [`commit`](InMemoryTransaction::commit); claims follow the same
/// eligibility, ordering and leasing rules as the Postgres backend.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    rows: BTreeMap<i64, DomainEvent>,
}

impl InMemoryOutbox {
    /// Start a transaction that events can be appended to.
    pub fn begin(&self) -> InMemoryTransaction {
        InMemoryTransaction {
            store: self.clone(),
            pending: Vec::new(),
            deferred: Vec::new(),
        }
    }

    /// Signal fired after every commit that inserted events.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Snapshot of all committed rows, ordered by id.
    pub async fn events(&self) -> Vec<DomainEvent> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    fn owns(&self, tx: &InMemoryTransaction) -> bool {
        Arc::ptr_eq(&self.state, &tx.store.state)
    }
}

/// Unit of work against an [`InMemoryOutbox`].
///
/// Dropping the transaction without committing discards everything that was
/// appended or deferred in it, mirroring a database rollback.
pub struct InMemoryTransaction {
    store: InMemoryOutbox,
    pending: Vec<DomainEvent>,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl InMemoryTransaction {
    /// Register a state change that must happen atomically with the appended
    /// events, e.g. the business mutation itself.
    pub fn defer(&mut self, mutation: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(mutation));
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply deferred mutations and make appended events visible.
    pub async fn commit(self) {
        let inserted = !self.pending.is_empty();
        {
            let mut state = self.store.state.lock().await;
            for event in self.pending {
                state.rows.insert(event.id, event);
            }
            for mutation in self.deferred {
                mutation();
            }
        }
        if inserted {
            self.store.notify.notify_one();
        }
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl AppendEvents for InMemoryOutbox {
    type Error = InMemoryOutboxError;
    type Transaction<'a> = InMemoryTransaction;

    async fn append(
        &self,
        events: Vec<NewEvent>,
        tx: &mut Self::Transaction<'_>,
    ) -> Result<Vec<i64>, Self::Error> {
        if !self.owns(tx) {
            return Err(InMemoryOutboxError::foreign_transaction());
        }

        let mut state = self.state.lock().await;
        let created_at = Utc::now();
        let mut ids = Vec::with_capacity(events.len());
        for event in events {
            state.next_id += 1;
            let id = state.next_id;
            tx.pending.push(event.into_domain_event(id, created_at));
            ids.push(id);
        }
        Ok(ids)
    }
}

fn is_pending(row: &DomainEvent, max_retries: i32) -> bool {
    row.published_at.is_none() && row.dead_lettered_at.is_none() && row.retry_count < max_retries
}

#[async_trait]
impl ClaimEvents for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn claim(&self, request: ClaimRequest) -> Result<Vec<DomainEvent>, Self::Error> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let waiting: Vec<(&str, _)> = state
            .rows
            .values()
            .filter(|row| is_pending(row, request.max_retries) && row.next_attempt_at > now)
            .map(|row| (row.partition_key.as_str(), (row.created_at, row.id)))
            .collect();

        let mut candidates: Vec<_> = state
            .rows
            .values()
            .filter(|row| is_pending(row, request.max_retries) && row.next_attempt_at <= now)
            .filter(|row| request.partition.contains(calculate_partition(&row.partition_key)))
            .filter(|row| {
                !waiting.iter().any(|(key, position)| {
                    *key == row.partition_key && *position < (row.created_at, row.id)
                })
            })
            .map(|row| (row.created_at, row.id))
            .collect();
        candidates.sort();
        candidates.truncate(request.limit);

        let lease_until = deadline(request.lease);
        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(row) = state.rows.get_mut(&id) {
                row.next_attempt_at = lease_until;
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: i64) -> Result<bool, Self::Error> {
        Ok(self.update_unpublished(id, |row| {
            row.published_at = Some(Utc::now());
        })
        .await)
    }

    async fn mark_failed(&self, id: i64, error: &str, retry: Retry) -> Result<bool, Self::Error> {
        Ok(self.update_unpublished(id, |row| {
            let now = Utc::now();
            row.retry_count += 1;
            row.last_error = Some(error.to_owned());
            match retry {
                Retry::At(at) => row.next_attempt_at = at,
                Retry::Exhausted => {
                    row.next_attempt_at = now;
                    row.dead_lettered_at = Some(now);
                }
            }
        })
        .await)
    }

    async fn mark_dead_lettered(&self, id: i64, error: &str) -> Result<bool, Self::Error> {
        Ok(self.update_unpublished(id, |row| {
            let now = Utc::now();
            row.last_error = Some(error.to_owned());
            row.next_attempt_at = now;
            row.dead_lettered_at = Some(now);
        })
        .await)
    }

    async fn release(&self, ids: &[i64]) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut released = 0;
        for id in ids {
            if let Some(row) = state.rows.get_mut(id) {
                if row.published_at.is_none() {
                    row.next_attempt_at = now;
                    released += 1;
                }
            }
        }
        Ok(released)
    }
}

impl InMemoryOutbox {
    async fn update_unpublished(&self, id: i64, update: impl FnOnce(&mut DomainEvent)) -> bool {
        let mut state = self.state.lock().await;
        match state.rows.get_mut(&id) {
            Some(row) if row.published_at.is_none() => {
                update(row);
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl InspectBacklog for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn backlog_stats(&self, max_retries: i32) -> Result<BacklogStats, Self::Error> {
        let state = self.state.lock().await;
        let mut stats = BacklogStats::default();
        for row in state.rows.values().filter(|row| row.published_at.is_none()) {
            if row.is_dead_lettered(max_retries) {
                stats.dead_lettered_count += 1;
            } else {
                stats.unpublished_count += 1;
                stats.oldest_unpublished_at = Some(match stats.oldest_unpublished_at {
                    Some(oldest) => oldest.min(row.created_at),
                    None => row.created_at,
                });
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl AdministerEvents for InMemoryOutbox {
    type Error = InMemoryOutboxError;

    async fn list_dead_lettered(
        &self,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, Self::Error> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .values()
            .filter(|row| row.published_at.is_none() && row.is_dead_lettered(max_retries))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn requeue(&self, id: i64) -> Result<bool, Self::Error> {
        let requeued = self
            .update_unpublished(id, |row| {
                row.retry_count = 0;
                row.dead_lettered_at = None;
                row.next_attempt_at = Utc::now();
            })
            .await;
        if requeued {
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    async fn purge_published_older_than(&self, older_than: Duration) -> Result<u64, Self::Error> {
        let mut state = self.state.lock().await;
        let cutoff = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = state.rows.len();
        state
            .rows
            .retain(|_, row| row.published_at.is_none_or(|at| at >= cutoff));
        Ok((before - state.rows.len()) as u64)
    }

    async fn get(&self, id: i64) -> Result<Option<DomainEvent>, Self::Error> {
        Ok(self.state.lock().await.rows.get(&id).cloned())
    }
}

/// Error type for `InMemoryOutbox` operations.
#[derive(Debug)]
pub struct InMemoryOutboxError {
    kind: InMemoryOutboxErrorKind,
}

impl InMemoryOutboxError {
    fn foreign_transaction() -> Self {
        Self {
            kind: InMemoryOutboxErrorKind::ForeignTransaction,
        }
    }
}

impl std::fmt::Display for InMemoryOutboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryOutboxErrorKind::ForeignTransaction => {
                write!(f, "Transaction belongs to a different in-memory outbox")
            }
        }
    }
}

impl std::error::Error for InMemoryOutboxError {}

#[derive(Debug)]
enum InMemoryOutboxErrorKind {
    ForeignTransaction,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::Partition;
    use serde_json::json;

    fn request(limit: usize) -> ClaimRequest {
        ClaimRequest {
            limit,
            max_retries: 3,
            lease: Duration::from_secs(30),
            partition: Partition::all(),
        }
    }

    async fn seed(store: &InMemoryOutbox, events: Vec<NewEvent>) -> Vec<i64> {
        let mut tx = store.begin();
        let ids = store.append(events, &mut tx).await.unwrap();
        tx.commit().await;
        ids
    }

    fn user_event(id: &str) -> NewEvent {
        NewEvent::new("User", id, "UserUpdated", json!({ "id": id }))
    }

    #[tokio::test]
    async fn rollback_discards_events_and_deferred_mutations() {
        let store = InMemoryOutbox::default();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut tx = store.begin();
        store.append(vec![user_event("1")], &mut tx).await.unwrap();
        let flag_in_tx = Arc::clone(&flag);
        tx.defer(move || flag_in_tx.store(true, std::sync::atomic::Ordering::SeqCst));
        drop(tx);

        assert!(store.events().await.is_empty());
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn claimed_rows_are_leased() {
        let store = InMemoryOutbox::default();
        seed(&store, vec![user_event("1"), user_event("2")]).await;

        let first = store.claim(request(10)).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(store.claim(request(10)).await.unwrap().is_empty());

        store.release(&[first[0].id]).await.unwrap();
        let again = store.claim(request(10)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
    }

    #[tokio::test]
    async fn younger_sibling_waits_for_backing_off_row() {
        let store = InMemoryOutbox::default();
        let ids = seed(&store, vec![user_event("1"), user_event("1"), user_event("2")]).await;

        let claimed = store.claim(request(1)).await.unwrap();
        assert_eq!(claimed[0].id, ids[0]);
        store
            .mark_failed(ids[0], "broker down", Retry::At(deadline(Duration::from_secs(60))))
            .await
            .unwrap();

        let claimed: Vec<_> = store
            .claim(request(10))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(claimed, vec![ids[2]]);
    }

    #[tokio::test]
    async fn published_rows_are_never_mutated_again() {
        let store = InMemoryOutbox::default();
        let ids = seed(&store, vec![user_event("1")]).await;

        assert!(store.mark_published(ids[0]).await.unwrap());
        assert!(!store.mark_published(ids[0]).await.unwrap());
        assert!(!store.mark_failed(ids[0], "late", Retry::Exhausted).await.unwrap());
        assert!(!store.requeue(ids[0]).await.unwrap());

        let row = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(row.retry_count, 0);
        assert!(row.last_error.is_none());
    }

    #[tokio::test]
    async fn dead_letter_and_requeue() {
        let store = InMemoryOutbox::default();
        let ids = seed(&store, vec![user_event("1"), user_event("2")]).await;

        store.mark_dead_lettered(ids[0], "malformed").await.unwrap();
        let stats = store.backlog_stats(3).await.unwrap();
        assert_eq!(stats.unpublished_count, 1);
        assert_eq!(stats.dead_lettered_count, 1);

        let dead = store.list_dead_lettered(3, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 0);
        assert_eq!(dead[0].last_error.as_deref(), Some("malformed"));

        assert!(store.requeue(ids[0]).await.unwrap());
        assert!(store.list_dead_lettered(3, 10).await.unwrap().is_empty());
        assert_eq!(store.backlog_stats(3).await.unwrap().unpublished_count, 2);
    }

    #[tokio::test]
    async fn purge_only_removes_old_published_rows() {
        let store = InMemoryOutbox::default();
        let ids = seed(&store, vec![user_event("1"), user_event("2")]).await;
        store.mark_published(ids[0]).await.unwrap();

        assert_eq!(store.purge_published_older_than(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(store.purge_published_older_than(Duration::ZERO).await.unwrap(), 1);

        let remaining: Vec<_> = store.events().await.into_iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![ids[1]]);
    }

    #[tokio::test]
    async fn foreign_transactions_are_rejected() {
        let store = InMemoryOutbox::default();
        let other = InMemoryOutbox::default();

        let mut tx = other.begin();
        assert!(store.append(vec![user_event("1")], &mut tx).await.is_err());
    }
}
