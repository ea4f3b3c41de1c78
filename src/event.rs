//! Event records flowing through the outbox and the inbox.
//!
//! - [`NewEvent`] is what a business transaction appends.
//! - [`DomainEvent`] is the durable outbox row, including its delivery state.
//! - [`EventEnvelope`] is the wire format published to the bus and received
//!   by consumers.
//!
//! ## Example
//!
//! ```rust
//! use outpost::NewEvent;
//!
//! let event = NewEvent::new(
//!     "User",
//!     "42",
//!     "UserDeleted",
//!     serde_json::json!({ "user_id": 42 }),
//! )
//! .with_partition_key("tenant-7");
//!
//! assert_eq!(event.partition_key(), "tenant-7");
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAX_FIELD_LEN: usize = 255;

/// An event about to be appended to the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub(crate) event_id: Uuid,
    pub(crate) aggregate_type: String,
    pub(crate) aggregate_id: String,
    pub(crate) event_type: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) metadata: Option<serde_json::Value>,
    pub(crate) partition_key: Option<String>,
}

impl NewEvent {
    /// Create a new event for the given aggregate.
    ///
    /// A fresh `event_id` is generated; it identifies the logical event for
    /// the whole of its life, including consumer-side deduplication.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl ToString,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.into(),
            payload,
            metadata: None,
            partition_key: None,
        }
    }

    /// Create a new event from any serializable payload.
    pub fn from_serialize<T: Serialize>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl ToString,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(aggregate_type, aggregate_id, event_type, payload))
    }

    /// Route the event with an explicit partition key instead of the aggregate id.
    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Attach metadata such as a correlation id.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Key used for routing and per-aggregate ordering.
    pub fn partition_key(&self) -> &str {
        self.partition_key.as_deref().unwrap_or(&self.aggregate_id)
    }

    /// Check the structural fields before the event reaches storage.
    pub(crate) fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("aggregate_type", self.aggregate_type.as_str()),
            ("aggregate_id", self.aggregate_id.as_str()),
            ("event_type", self.event_type.as_str()),
            ("partition_key", self.partition_key()),
        ] {
            if value.is_empty() {
                return Err(format!("{name} cannot be empty"));
            }
            let chars = value.chars().count();
            if chars > MAX_FIELD_LEN {
                return Err(format!("{name} too long: {chars} characters (max {MAX_FIELD_LEN})"));
            }
        }
        Ok(())
    }

    /// Materialize the row as a backend would store it.
    pub(crate) fn into_domain_event(self, id: i64, created_at: DateTime<Utc>) -> DomainEvent {
        let partition_key = self.partition_key().to_owned();
        DomainEvent {
            id,
            event_id: self.event_id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            metadata: self.metadata,
            partition_key,
            created_at,
            published_at: None,
            retry_count: 0,
            last_error: None,
            next_attempt_at: created_at,
            dead_lettered_at: None,
        }
    }
}

/// Delivery state of an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventState {
    /// Waiting for (another) publish attempt.
    Pending,
    /// Accepted by the bus; terminal.
    Published,
    /// Excluded from delivery until an operator requeues it.
    DeadLettered,
}

/// A durable outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Monotonically increasing sequence number.
    pub id: i64,
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: Option<serde_json::Value>,
    pub partition_key: String,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    /// Earliest time the row may be claimed again (backoff or claim lease).
    pub next_attempt_at: DateTime<Utc>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl DomainEvent {
    pub fn state(&self, max_retries: i32) -> EventState {
        if self.published_at.is_some() {
            EventState::Published
        } else if self.dead_lettered_at.is_some() || self.retry_count >= max_retries {
            EventState::DeadLettered
        } else {
            EventState::Pending
        }
    }

    pub fn is_dead_lettered(&self, max_retries: i32) -> bool {
        self.state(max_retries) == EventState::DeadLettered
    }

    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            event_type: self.event_type.clone(),
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
        }
    }

    /// Correlation id carried in the metadata, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("correlation_id"))
            .and_then(|v| v.as_str())
    }
}

/// Structural envelope published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
