use std::{
    collections::{HashMap, HashSet},
    convert::Infallible,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    event::EventEnvelope,
    inbox::{Ledger, ProcessedEvent},
};

type Key = (String, Uuid);

/// In-memory processed-event ledger.
///
/// Records are reserved on [`try_record`](Ledger::try_record) and become
/// visible to other transactions on commit. A second transaction recording
/// the same key waits until the first one commits or rolls back, which is
/// how a unique index behaves in a database.
#[derive(Clone, Default)]
pub struct InMemoryLedger {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    released: Notify,
}

#[derive(Default)]
struct State {
    processed: HashMap<Key, ProcessedEvent>,
    in_flight: HashSet<Key>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InMemoryLedger {
    /// All committed records, oldest first.
    pub fn records(&self) -> Vec<ProcessedEvent> {
        let mut records: Vec<_> = self.inner.lock().processed.values().cloned().collect();
        records.sort_by_key(|r| r.processed_at);
        records
    }
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("processed", &self.inner.lock().processed.len())
            .finish()
    }
}

/// Transaction of an [`InMemoryLedger`].
///
/// Side effects registered with [`defer`](Self::defer) run on commit, under
/// the same lock that publishes the ledger records. Dropping the transaction
/// discards both.
pub struct InMemoryLedgerTransaction {
    inner: Arc<Inner>,
    reserved: Vec<(Key, String)>,
    deferred: Vec<Box<dyn FnOnce() + Send>>,
}

impl InMemoryLedgerTransaction {
    pub fn defer(&mut self, effect: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(effect));
    }
}

impl Drop for InMemoryLedgerTransaction {
    fn drop(&mut self) {
        if self.reserved.is_empty() {
            return;
        }
        {
            let mut state = self.inner.lock();
            for (key, _) in self.reserved.drain(..) {
                state.in_flight.remove(&key);
            }
        }
        self.inner.released.notify_waiters();
    }
}

#[async_trait::async_trait]
impl Ledger for InMemoryLedger {
    type Error = Infallible;
    type Transaction = InMemoryLedgerTransaction;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryLedgerTransaction {
            inner: Arc::clone(&self.inner),
            reserved: Vec::new(),
            deferred: Vec::new(),
        })
    }

    async fn try_record(
        &self,
        tx: &mut Self::Transaction,
        processor: &str,
        envelope: &EventEnvelope,
    ) -> Result<bool, Self::Error> {
        let key = (processor.to_owned(), envelope.event_id);
        if tx.reserved.iter().any(|(reserved, _)| *reserved == key) {
            return Ok(false);
        }

        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if state.processed.contains_key(&key) {
                    return Ok(false);
                }
                if state.in_flight.insert(key.clone()) {
                    tx.reserved.push((key, envelope.event_type.clone()));
                    return Ok(true);
                }
            }

            released.await;
        }
    }

    async fn commit(&self, mut tx: Self::Transaction) -> Result<(), Self::Error> {
        {
            let mut state = self.inner.lock();
            let now = Utc::now();
            for ((processor_name, event_id), event_type) in tx.reserved.drain(..) {
                let key = (processor_name.clone(), event_id);
                state.in_flight.remove(&key);
                state.processed.insert(
                    key,
                    ProcessedEvent {
                        processor_name,
                        event_id,
                        event_type,
                        processed_at: now,
                    },
                );
            }
            for effect in tx.deferred.drain(..) {
                effect();
            }
        }
        self.inner.released.notify_waiters();
        Ok(())
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        drop(tx);
        Ok(())
    }

    async fn is_processed(&self, processor: &str, event_id: Uuid) -> Result<bool, Self::Error> {
        Ok(self
            .inner
            .lock()
            .processed
            .contains_key(&(processor.to_owned(), event_id)))
    }

    async fn purge_older_than(
        &self,
        processor: &str,
        older_than: Duration,
    ) -> Result<u64, Self::Error> {
        let cutoff = TimeDelta::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut state = self.inner.lock();
        let before = state.processed.len();
        state
            .processed
            .retain(|(name, _), record| name != processor || record.processed_at >= cutoff);
        Ok((before - state.processed.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            aggregate_type: "User".to_owned(),
            aggregate_id: "1".to_owned(),
            event_type: "UserDeleted".to_owned(),
            payload: json!({}),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_are_unique_per_processor() {
        let ledger = InMemoryLedger::default();
        let event = envelope();

        let mut tx = ledger.begin().await.unwrap();
        assert!(ledger.try_record(&mut tx, "content", &event).await.unwrap());
        assert!(!ledger.try_record(&mut tx, "content", &event).await.unwrap());
        assert!(ledger.try_record(&mut tx, "search", &event).await.unwrap());
        ledger.commit(tx).await.unwrap();

        let mut tx = ledger.begin().await.unwrap();
        assert!(!ledger.try_record(&mut tx, "content", &event).await.unwrap());
        assert_eq!(ledger.records().len(), 2);
    }

    #[tokio::test]
    async fn rollback_discards_records_and_effects() {
        let ledger = InMemoryLedger::default();
        let event = envelope();
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut tx = ledger.begin().await.unwrap();
        assert!(ledger.try_record(&mut tx, "content", &event).await.unwrap());
        let flag = Arc::clone(&ran);
        tx.defer(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
        ledger.rollback(tx).await.unwrap();

        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!ledger.is_processed("content", event.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_record_waits_for_the_first_transaction() {
        let ledger = InMemoryLedger::default();
        let event = envelope();

        let mut first = ledger.begin().await.unwrap();
        assert!(ledger.try_record(&mut first, "content", &event).await.unwrap());

        let waiter = {
            let ledger = ledger.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let mut second = ledger.begin().await.unwrap();
                ledger.try_record(&mut second, "content", &event).await.unwrap()
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ledger.commit(first).await.unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn purge_keeps_recent_records() {
        let ledger = InMemoryLedger::default();
        let mut tx = ledger.begin().await.unwrap();
        ledger.try_record(&mut tx, "content", &envelope()).await.unwrap();
        ledger.commit(tx).await.unwrap();

        let purged = ledger
            .purge_older_than("content", Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(purged, 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let purged = ledger.purge_older_than("content", Duration::ZERO).await.unwrap();
        assert_eq!(purged, 1);
    }
}
