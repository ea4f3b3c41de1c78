use std::{collections::HashMap, sync::Arc};

use crate::{
    event::EventEnvelope,
    inbox::{InboxError, InboxErrorKind},
};

/// Side effect run for one event type.
///
/// The handler receives the ledger transaction the event id was recorded
/// in; whatever it writes through that transaction commits together with
/// the ledger row, or not at all.
#[async_trait::async_trait]
pub trait EventHandler<Tx>: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope, tx: &mut Tx) -> Result<(), tower::BoxError>;
}

/// Static map from event type to handler, built once at startup.
pub struct HandlerRegistry<Tx> {
    handlers: HashMap<String, Arc<dyn EventHandler<Tx>>>,
}

impl<Tx> HandlerRegistry<Tx> {
    pub fn builder() -> HandlerRegistryBuilder<Tx> {
        HandlerRegistryBuilder {
            handlers: HashMap::new(),
            duplicates: Vec::new(),
        }
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn EventHandler<Tx>>> {
        self.handlers.get(event_type)
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl<Tx> Clone for HandlerRegistry<Tx> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

/// Collects handlers; [`build`](Self::build) rejects event types registered
/// twice.
pub struct HandlerRegistryBuilder<Tx> {
    handlers: HashMap<String, Arc<dyn EventHandler<Tx>>>,
    duplicates: Vec<String>,
}

impl<Tx> HandlerRegistryBuilder<Tx> {
    pub fn register(
        mut self,
        event_type: impl Into<String>,
        handler: impl EventHandler<Tx> + 'static,
    ) -> Self {
        let event_type = event_type.into();
        if self.handlers.contains_key(&event_type) {
            self.duplicates.push(event_type);
        } else {
            self.handlers.insert(event_type, Arc::new(handler));
        }
        self
    }

    pub fn build(self) -> Result<HandlerRegistry<Tx>, InboxError> {
        if let Some(event_type) = self.duplicates.into_iter().next() {
            return Err(InboxError::new(InboxErrorKind::DuplicateHandler(event_type)));
        }
        Ok(HandlerRegistry {
            handlers: self.handlers,
        })
    }
}
