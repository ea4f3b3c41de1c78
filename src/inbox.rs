//! Idempotent consumption of published events.
//!
//! The bus delivers at least once, so a consumer sees some events more than
//! once. The [`Inbox`] makes side effects happen once per logical event: the
//! event id is recorded in a processed-event [`Ledger`] inside the same
//! transaction as the side effect. If the record already exists, the event
//! is acknowledged without running the handler again.
//!
//! ## Example
//!
//! ```rust
//! use outpost::inbox::{EventHandler, HandlerRegistry, Inbox, Outcome, inmemory::*};
//! use outpost::{EventEnvelope, InboxConfig};
//!
//! struct DeletePosts;
//!
//! #[async_trait::async_trait]
//! impl EventHandler<InMemoryLedgerTransaction> for DeletePosts {
//!     async fn handle(
//!         &self,
//!         envelope: &EventEnvelope,
//!         tx: &mut InMemoryLedgerTransaction,
//!     ) -> Result<(), tower::BoxError> {
//!         let user = envelope.aggregate_id.clone();
//!         tx.defer(move || println!("soft-deleting posts of user {user}"));
//!         Ok(())
//!     }
//! }
//!
//! # tokio_test_block_on(async {
//! let registry = HandlerRegistry::builder()
//!     .register("UserDeleted", DeletePosts)
//!     .build()?;
//! let inbox = Inbox::new(InMemoryLedger::default(), registry, InboxConfig::new("content"));
//!
//! let envelope: EventEnvelope = serde_json::from_value(serde_json::json!({
//!     "event_id": "7b0e6f7c-3f5c-4a57-9b8a-0d1b6f0f4c11",
//!     "aggregate_type": "User",
//!     "aggregate_id": "42",
//!     "event_type": "UserDeleted",
//!     "payload": {},
//!     "created_at": "2024-01-01T00:00:00Z"
//! }))?;
//! assert_eq!(inbox.on_message(&envelope).await, Outcome::Processed);
//! assert_eq!(inbox.on_message(&envelope).await, Outcome::Skipped);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # })?;
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod inmemory;
mod registry;

#[cfg(feature = "sqlx")]
pub mod sqlx;

use std::{collections::HashSet, hash::BuildHasher, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    config::InboxConfig,
    event::EventEnvelope,
    transport::{Publication, RawPayload},
};

pub use registry::{EventHandler, HandlerRegistry, HandlerRegistryBuilder};

const LANE_CAPACITY: usize = 64;

/// Result of handling one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The side effect ran and committed together with the ledger record.
    Processed,
    /// Nothing to do: already processed, no handler, or not a valid event.
    /// Acknowledge the message.
    Skipped,
    /// The message must be delivered again.
    Redeliver,
}

/// A row of the processed-event ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    pub processor_name: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

/// Processed-event ledger.
///
/// Uniqueness on `(processor, event_id)` is the only gate for side effects:
/// [`try_record`](Ledger::try_record) returns `false` when the pair already
/// exists. Records become visible to other transactions on
/// [`commit`](Ledger::commit); dropping a transaction rolls it back.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Transaction shared by the ledger record and the side effect.
    type Transaction: Send;

    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Record the event for `processor`. Returns `false` if it was already
    /// recorded. A concurrent, uncommitted record of the same event makes
    /// this call wait for that transaction to finish.
    async fn try_record(
        &self,
        tx: &mut Self::Transaction,
        processor: &str,
        envelope: &EventEnvelope,
    ) -> Result<bool, Self::Error>;

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), Self::Error>;

    async fn is_processed(&self, processor: &str, event_id: Uuid) -> Result<bool, Self::Error>;

    /// Delete records of `processor` older than `older_than`.
    async fn purge_older_than(
        &self,
        processor: &str,
        older_than: Duration,
    ) -> Result<u64, Self::Error>;
}

/// A message handed to [`Inbox::consume`].
#[derive(Debug)]
pub struct Delivery {
    pub envelope: EventEnvelope,
    key: Option<String>,
    ack: Option<oneshot::Sender<Outcome>>,
}

impl Delivery {
    pub fn new(envelope: EventEnvelope) -> Self {
        Self {
            envelope,
            key: None,
            ack: None,
        }
    }

    /// Decode a JSON-encoded [`EventEnvelope`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, InboxError> {
        let envelope =
            serde_json::from_slice(bytes).map_err(|e| InboxError::new(InboxErrorKind::Decode(e)))?;
        Ok(Self::new(envelope))
    }

    /// Ordering key; defaults to the aggregate.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Receive the final outcome once the delivery has been handled, e.g. to
    /// commit a broker offset or nack the message.
    pub fn with_ack(mut self) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        self.ack = Some(tx);
        (self, rx)
    }

    fn lane_key(&self) -> String {
        match &self.key {
            Some(key) => key.clone(),
            None => format!("{}:{}", self.envelope.aggregate_type, self.envelope.aggregate_id),
        }
    }

    fn acknowledge(self, outcome: Outcome) {
        if let Some(ack) = self.ack {
            let _ = ack.send(outcome);
        }
    }
}

impl From<Publication<EventEnvelope>> for Delivery {
    fn from(publication: Publication<EventEnvelope>) -> Self {
        Self::new(publication.payload).with_key(publication.key)
    }
}

impl TryFrom<Publication<RawPayload>> for Delivery {
    type Error = InboxError;

    fn try_from(publication: Publication<RawPayload>) -> Result<Self, Self::Error> {
        Ok(Self::from_json(publication.payload.as_bytes())?.with_key(publication.key))
    }
}

/// Idempotent consumer.
///
/// Dispatches each event to the handler registered for its `event_type`,
/// inside a ledger transaction that also records the event id.
pub struct Inbox<L: Ledger, HK = DefaultInboxHook> {
    ledger: L,
    registry: HandlerRegistry<L::Transaction>,
    config: InboxConfig,
    hook: HK,
}

impl<L: Ledger> Inbox<L, DefaultInboxHook> {
    /// Create a new inbox with the default hook implementation.
    pub fn new(ledger: L, registry: HandlerRegistry<L::Transaction>, config: InboxConfig) -> Self {
        Self {
            ledger,
            registry,
            config,
            hook: DefaultInboxHook,
        }
    }
}

impl<L, HK> Inbox<L, HK>
where
    L: Ledger,
    HK: InboxHook,
{
    /// Replace the inbox hook.
    pub fn with_hook<HK2: InboxHook>(self, hook: HK2) -> Inbox<L, HK2> {
        Inbox {
            ledger: self.ledger,
            registry: self.registry,
            config: self.config,
            hook,
        }
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn processor_name(&self) -> &str {
        &self.config.processor_name
    }

    /// Handle one event.
    ///
    /// - nil event id or unknown event type: [`Outcome::Skipped`], ledger untouched
    /// - already recorded for this processor: [`Outcome::Skipped`]
    /// - handler and ledger record committed: [`Outcome::Processed`]
    /// - handler or ledger failure: rolled back, [`Outcome::Redeliver`]
    #[tracing::instrument(
        skip_all,
        fields(
            processor = %self.config.processor_name,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type
        )
    )]
    pub async fn on_message(&self, envelope: &EventEnvelope) -> Outcome {
        if envelope.event_id.is_nil() {
            self.hook.on_rejected(envelope, "nil event id");
            return Outcome::Skipped;
        }
        let Some(handler) = self.registry.get(&envelope.event_type) else {
            self.hook.on_unhandled(envelope);
            return Outcome::Skipped;
        };

        let mut tx = match self.ledger.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                self.ledger_error(e);
                return Outcome::Redeliver;
            }
        };

        match self
            .ledger
            .try_record(&mut tx, &self.config.processor_name, envelope)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.rollback(tx).await;
                self.hook.on_duplicate(envelope);
                return Outcome::Skipped;
            }
            Err(e) => {
                self.rollback(tx).await;
                self.ledger_error(e);
                return Outcome::Redeliver;
            }
        }

        if let Err(error) = handler.handle(envelope, &mut tx).await {
            self.rollback(tx).await;
            self.hook.on_handler_error(envelope, error.as_ref());
            return Outcome::Redeliver;
        }

        match self.ledger.commit(tx).await {
            Ok(()) => {
                self.hook.on_processed(envelope);
                Outcome::Processed
            }
            Err(e) => {
                self.ledger_error(e);
                Outcome::Redeliver
            }
        }
    }

    fn ledger_error(&self, error: L::Error) {
        let error: tower::BoxError = error.into();
        self.hook.on_ledger_error(error.as_ref());
    }

    async fn rollback(&self, tx: L::Transaction) {
        if let Err(e) = self.ledger.rollback(tx).await {
            self.ledger_error(e);
        }
    }

    /// Delete ledger records older than the configured retention.
    pub async fn purge_processed(&self) -> Result<u64, InboxError> {
        self.ledger
            .purge_older_than(&self.config.processor_name, self.config.ledger_retention)
            .await
            .map_err(|e| InboxError::new(InboxErrorKind::Ledger(e.into())))
    }

    /// Consume a subscription until it ends or `cancel` fires.
    ///
    /// Deliveries are spread over `lanes` workers by ordering key, so events
    /// of one aggregate are handled one at a time in delivery order while
    /// different aggregates proceed concurrently. A delivery that resolves
    /// to [`Outcome::Redeliver`] is retried with backoff up to
    /// `max_attempts` times before its outcome is reported. From then on the
    /// ordering key is held back: its later deliveries are acknowledged
    /// [`Outcome::Redeliver`] unhandled until `consume` returns, so no event
    /// of that key is processed ahead of the one that failed.
    pub async fn consume<S>(self: Arc<Self>, mut stream: S, cancel: CancellationToken)
    where
        S: Stream<Item = Delivery> + Unpin + Send,
        L: 'static,
        HK: 'static,
    {
        let lane_count = self.config.lanes.max(1);
        let mut lanes = Vec::with_capacity(lane_count);
        let mut workers = JoinSet::new();
        for _ in 0..lane_count {
            let (tx, mut rx) = mpsc::channel::<Delivery>(LANE_CAPACITY);
            let inbox = Arc::clone(&self);
            let cancel = cancel.clone();
            workers.spawn(async move {
                let mut held_back = HashSet::new();
                while let Some(delivery) = rx.recv().await {
                    let key = delivery.lane_key();
                    if held_back.contains(&key) {
                        inbox.hook.on_held_back(&delivery.envelope, &key);
                        delivery.acknowledge(Outcome::Redeliver);
                        continue;
                    }
                    if inbox.deliver(delivery, &cancel).await == Outcome::Redeliver
                        && !cancel.is_cancelled()
                    {
                        held_back.insert(key);
                    }
                }
            });
            lanes.push(tx);
        }

        let hasher = ahash::RandomState::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => {
                    let Some(delivery) = next else { break };
                    let hash = BuildHasher::hash_one(&hasher, delivery.lane_key());
                    let lane = (hash % lanes.len() as u64) as usize;
                    if lanes[lane].send(delivery).await.is_err() {
                        break;
                    }
                }
            }
        }

        drop(lanes);
        while workers.join_next().await.is_some() {}
    }

    async fn deliver(&self, delivery: Delivery, cancel: &CancellationToken) -> Outcome {
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                delivery.acknowledge(Outcome::Redeliver);
                return Outcome::Redeliver;
            }

            let outcome = self.on_message(&delivery.envelope).await;
            attempts += 1;
            if outcome != Outcome::Redeliver {
                delivery.acknowledge(outcome);
                return outcome;
            }
            if attempts >= self.config.max_attempts {
                self.hook.on_redelivery(&delivery.envelope, attempts);
                delivery.acknowledge(outcome);
                return outcome;
            }

            let delay = self.config.backoff.delay(attempts - 1);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Inbox errors.
#[derive(Debug)]
pub struct InboxError {
    context: SpanTrace,
    kind: InboxErrorKind,
}

/// Kinds of inbox errors.
#[derive(Debug)]
pub enum InboxErrorKind {
    /// A message could not be decoded into an envelope.
    Decode(serde_json::Error),
    /// Two handlers were registered for the same event type.
    DuplicateHandler(String),
    Ledger(tower::BoxError),
}

impl InboxError {
    pub(crate) fn new(kind: InboxErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &InboxErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for InboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InboxErrorKind::Decode(err) => writeln!(f, "Cannot decode event envelope: {err}"),
            InboxErrorKind::DuplicateHandler(event_type) => {
                writeln!(f, "Handler for {event_type} registered twice")
            }
            InboxErrorKind::Ledger(err) => writeln!(f, "Ledger error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InboxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            InboxErrorKind::Decode(err) => Some(err),
            InboxErrorKind::DuplicateHandler(_) => None,
            InboxErrorKind::Ledger(err) => Some(err.as_ref()),
        }
    }
}

/// Hook trait for observing inbox activity.
pub trait InboxHook: Send + Sync {
    fn on_processed(&self, envelope: &EventEnvelope);
    fn on_duplicate(&self, envelope: &EventEnvelope);
    fn on_unhandled(&self, envelope: &EventEnvelope);
    fn on_rejected(&self, envelope: &EventEnvelope, reason: &str);
    fn on_handler_error(
        &self,
        envelope: &EventEnvelope,
        error: &(dyn std::error::Error + Send + Sync),
    );
    fn on_ledger_error(&self, error: &(dyn std::error::Error + Send + Sync));
    /// The delivery still failed after `attempts` local attempts.
    fn on_redelivery(&self, envelope: &EventEnvelope, attempts: u32);
    /// An earlier event of `key` was handed back, so this one is too.
    fn on_held_back(&self, envelope: &EventEnvelope, key: &str);
}

/// Default inbox hook implementation.
///
/// Logs events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultInboxHook;

impl InboxHook for DefaultInboxHook {
    fn on_processed(&self, _envelope: &EventEnvelope) {
        tracing::debug!("Event processed");
    }

    fn on_duplicate(&self, _envelope: &EventEnvelope) {
        tracing::info!("Duplicate event skipped");
    }

    fn on_unhandled(&self, _envelope: &EventEnvelope) {
        tracing::warn!("No handler registered, event skipped");
    }

    fn on_rejected(&self, _envelope: &EventEnvelope, reason: &str) {
        tracing::error!(reason, "Event rejected");
    }

    fn on_handler_error(
        &self,
        _envelope: &EventEnvelope,
        error: &(dyn std::error::Error + Send + Sync),
    ) {
        tracing::warn!(%error, "Handler failed, transaction rolled back");
    }

    fn on_ledger_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        tracing::error!(%error, "Ledger error");
    }

    fn on_redelivery(&self, envelope: &EventEnvelope, attempts: u32) {
        tracing::error!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            attempts,
            "Event handed back for redelivery"
        );
    }

    fn on_held_back(&self, envelope: &EventEnvelope, key: &str) {
        tracing::warn!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            key,
            "Event held back behind an earlier failure"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::inmemory::{InMemoryLedger, InMemoryLedgerTransaction};
    use serde_json::json;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    fn envelope(event_type: &str, aggregate_id: &str) -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            aggregate_type: "User".to_owned(),
            aggregate_id: aggregate_id.to_owned(),
            event_type: event_type.to_owned(),
            payload: json!({}),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    /// Counts committed side effects; fails the first `failures` calls.
    struct Counter {
        committed: Arc<AtomicUsize>,
        failures: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventHandler<InMemoryLedgerTransaction> for Counter {
        async fn handle(
            &self,
            _envelope: &EventEnvelope,
            tx: &mut InMemoryLedgerTransaction,
        ) -> Result<(), tower::BoxError> {
            let committed = Arc::clone(&self.committed);
            tx.defer(move || {
                committed.fetch_add(1, Ordering::SeqCst);
            });
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err("downstream unavailable".into());
            }
            Ok(())
        }
    }

    fn inbox(failures: usize) -> (Inbox<InMemoryLedger>, Arc<AtomicUsize>) {
        let committed = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::builder()
            .register(
                "UserDeleted",
                Counter {
                    committed: Arc::clone(&committed),
                    failures: AtomicUsize::new(failures),
                },
            )
            .build()
            .unwrap();
        let config = InboxConfig::new("content")
            .with_backoff(crate::backoff::Backoff::new(Duration::ZERO, Duration::ZERO));
        (Inbox::new(InMemoryLedger::default(), registry, config), committed)
    }

    #[tokio::test]
    async fn duplicate_delivery_runs_the_side_effect_once() {
        let (inbox, committed) = inbox(0);
        let event = envelope("UserDeleted", "1");

        assert_eq!(inbox.on_message(&event).await, Outcome::Processed);
        assert_eq!(inbox.on_message(&event).await, Outcome::Skipped);
        assert_eq!(committed.load(Ordering::SeqCst), 1);
        assert!(inbox.ledger().is_processed("content", event.event_id).await.unwrap());
        assert_eq!(inbox.ledger().records().len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_the_ledger_record() {
        let (inbox, committed) = inbox(1);
        let event = envelope("UserDeleted", "1");

        assert_eq!(inbox.on_message(&event).await, Outcome::Redeliver);
        assert_eq!(committed.load(Ordering::SeqCst), 0);
        assert!(!inbox.ledger().is_processed("content", event.event_id).await.unwrap());

        assert_eq!(inbox.on_message(&event).await, Outcome::Processed);
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_types_and_nil_ids_are_skipped_without_recording() {
        let (inbox, _) = inbox(0);

        let unknown = envelope("UserRenamed", "1");
        assert_eq!(inbox.on_message(&unknown).await, Outcome::Skipped);

        let mut nil = envelope("UserDeleted", "1");
        nil.event_id = Uuid::nil();
        assert_eq!(inbox.on_message(&nil).await, Outcome::Skipped);

        assert!(inbox.ledger().records().is_empty());
    }

    #[tokio::test]
    async fn consume_retries_and_acknowledges() {
        let (inbox, committed) = inbox(2);
        let inbox = Arc::new(inbox.with_hook(DefaultInboxHook));

        let event = envelope("UserDeleted", "1");
        let (first, first_ack) = Delivery::new(event.clone()).with_ack();
        let (second, second_ack) = Delivery::new(event).with_ack();

        let cancel = CancellationToken::new();
        let stream = tokio_stream::iter(vec![first, second]);
        Arc::clone(&inbox).consume(stream, cancel).await;

        assert_eq!(first_ack.await.unwrap(), Outcome::Processed);
        assert_eq!(second_ack.await.unwrap(), Outcome::Skipped);
        assert_eq!(committed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn same_aggregate_is_handled_in_delivery_order() {
        struct Recorder(Arc<Mutex<Vec<String>>>);

        #[async_trait::async_trait]
        impl EventHandler<InMemoryLedgerTransaction> for Recorder {
            async fn handle(
                &self,
                envelope: &EventEnvelope,
                _tx: &mut InMemoryLedgerTransaction,
            ) -> Result<(), tower::BoxError> {
                tokio::task::yield_now().await;
                self.0
                    .lock()
                    .unwrap()
                    .push(format!("{}:{}", envelope.aggregate_id, envelope.payload["seq"]));
                Ok(())
            }
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::builder()
            .register("UserUpdated", Recorder(Arc::clone(&seen)))
            .build()
            .unwrap();
        let inbox = Arc::new(Inbox::new(
            InMemoryLedger::default(),
            registry,
            InboxConfig::new("search").with_lanes(4),
        ));

        let deliveries: Vec<_> = (0..30)
            .map(|i| {
                let mut event = envelope("UserUpdated", &(i % 3).to_string());
                event.payload = json!({ "seq": i });
                Delivery::new(event)
            })
            .collect();
        inbox
            .consume(tokio_stream::iter(deliveries), CancellationToken::new())
            .await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 30);
        for aggregate in ["0", "1", "2"] {
            let order: Vec<u64> = seen
                .iter()
                .filter_map(|entry| entry.strip_prefix(&format!("{aggregate}:")))
                .map(|seq| seq.parse().unwrap())
                .collect();
            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(order, sorted);
        }
    }

    #[tokio::test]
    async fn failed_event_holds_back_the_rest_of_its_aggregate() {
        struct FailsOnFlag(Arc<Mutex<Vec<String>>>);

        #[async_trait::async_trait]
        impl EventHandler<InMemoryLedgerTransaction> for FailsOnFlag {
            async fn handle(
                &self,
                envelope: &EventEnvelope,
                tx: &mut InMemoryLedgerTransaction,
            ) -> Result<(), tower::BoxError> {
                if envelope.event_type == "PostFlagged" {
                    return Err("moderation service unavailable".into());
                }
                let applied = Arc::clone(&self.0);
                let entry = format!("{}:{}", envelope.aggregate_id, envelope.event_type);
                tx.defer(move || applied.lock().unwrap().push(entry));
                Ok(())
            }
        }

        let applied = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::builder()
            .register("PostFlagged", FailsOnFlag(Arc::clone(&applied)))
            .register("PostDeleted", FailsOnFlag(Arc::clone(&applied)))
            .build()
            .unwrap();
        let config = InboxConfig::new("moderation")
            .with_lanes(1)
            .with_max_attempts(2)
            .with_backoff(crate::backoff::Backoff::new(Duration::ZERO, Duration::ZERO));
        let inbox = Arc::new(Inbox::new(InMemoryLedger::default(), registry, config));

        let (flagged, flagged_ack) = Delivery::new(envelope("PostFlagged", "1")).with_ack();
        let (deleted, deleted_ack) = Delivery::new(envelope("PostDeleted", "1")).with_ack();
        let (other, other_ack) = Delivery::new(envelope("PostDeleted", "2")).with_ack();
        Arc::clone(&inbox)
            .consume(tokio_stream::iter(vec![flagged, deleted, other]), CancellationToken::new())
            .await;

        assert_eq!(flagged_ack.await.unwrap(), Outcome::Redeliver);
        assert_eq!(deleted_ack.await.unwrap(), Outcome::Redeliver);
        assert_eq!(other_ack.await.unwrap(), Outcome::Processed);
        assert_eq!(*applied.lock().unwrap(), vec!["2:PostDeleted".to_owned()]);
    }

    #[test]
    fn deliveries_decode_from_json_publications() {
        let event = envelope("UserDeleted", "9");
        let publication = Publication {
            topic: "user.events".to_owned(),
            key: "9".to_owned(),
            headers: Vec::new(),
            payload: RawPayload::from(serde_json::to_vec(&event).unwrap()),
        };
        let delivery = Delivery::try_from(publication).unwrap();
        assert_eq!(delivery.envelope, event);
        assert_eq!(delivery.lane_key(), "9");

        let err = Delivery::from_json(b"not json").unwrap_err();
        assert!(matches!(err.kind(), InboxErrorKind::Decode(_)));
    }
}
