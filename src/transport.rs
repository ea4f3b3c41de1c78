//! Transport abstractions and sender backends.
//!
//! This module defines a Tower-compatible transport layer used to publish
//! outbox events to a message bus (in-memory, Kafka).
//!
//! Every event becomes a [`Publication`]: a topic derived from the aggregate
//! type, the partition key as message key, a handful of string headers and
//! the [`EventEnvelope`] as payload. Backends only acknowledge or fail; a
//! failure is classified as transient (retried with backoff) or permanent
//! (dead-lettered immediately).
//!
//! ## Key components
//!
//! - [`Transport`]: Public-facing wrapper implementing `tower::Service`
//! - [`SenderService`]: Adapter from a [`Sender`] to a Tower service
//! - [`Sender`]: Trait implemented by concrete sender backends
//! - [`TransportError`]: Unified error type with tracing context

mod inmemory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub mod layers;

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tower::{Service, ServiceExt};
use tracing_error::SpanTrace;

use crate::event::{DomainEvent, EventEnvelope};

pub use inmemory::InMemory;

/// A message on its way to the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication<P> {
    pub topic: String,
    /// Routing and ordering key, the event's partition key.
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: P,
}

impl<P> Publication<P> {
    /// Replace the payload, keeping routing information.
    pub fn map<Q>(self, f: impl FnOnce(P) -> Q) -> Publication<Q> {
        Publication {
            topic: self.topic,
            key: self.key,
            headers: self.headers,
            payload: f(self.payload),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

impl Publication<EventEnvelope> {
    /// Build the publication for an outbox row.
    pub fn from_event(event: &DomainEvent, naming: &TopicNaming) -> Self {
        let mut headers = vec![
            ("event_id".to_owned(), event.event_id.to_string()),
            ("event_type".to_owned(), event.event_type.clone()),
            ("aggregate_type".to_owned(), event.aggregate_type.clone()),
            ("aggregate_id".to_owned(), event.aggregate_id.clone()),
            ("created_at".to_owned(), event.created_at.to_rfc3339()),
        ];
        if let Some(correlation_id) = event.correlation_id() {
            headers.push(("correlation_id".to_owned(), correlation_id.to_owned()));
        }

        Self {
            topic: naming.topic_for(&event.aggregate_type),
            key: event.partition_key.clone(),
            headers,
            payload: event.envelope(),
        }
    }
}

/// Maps aggregate types to topic names: `{prefix}.{aggregate_type}.events`,
/// lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicNaming {
    prefix: Option<String>,
}

impl TopicNaming {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    pub fn topic_for(&self, aggregate_type: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}.{aggregate_type}.events"),
            None => format!("{aggregate_type}.events"),
        }
        .to_lowercase()
    }
}

/// Generic Tower-compatible transport wrapper.
///
/// `Transport` is the main entry point for publishing. It wraps an
/// underlying Tower `Service` and:
///
/// - Normalizes errors into [`TransportError`], keeping the permanent or
///   transient classification of errors raised further down the stack
/// - Supports Tower middleware via layers
/// - Provides a convenience [`send`](Transport::send) API
///
/// Typically constructed from a concrete [`Sender`] implementation.
#[derive(Clone, Debug)]
pub struct Transport<S> {
    service: S,
}

impl<D> Transport<SenderService<D>> {
    /// Create a new transport from a concrete sender backend.
    ///
    /// The sender will be wrapped in a [`SenderService`] to make it
    /// Tower-compatible.
    pub fn new(driver: D) -> Self {
        Self {
            service: SenderService::new(driver),
        }
    }
}

impl<S> Transport<S> {
    /// Apply a Tower layer to the transport.
    ///
    /// This enables composition with middleware such as serialization,
    /// timeouts, buffering, or tracing.
    pub fn layer<L>(self, layer: L) -> Transport<L::Service>
    where
        L: tower::Layer<S>,
    {
        Transport {
            service: layer.layer(self.service),
        }
    }

    /// Publish through the transport, waiting for the backend's ack.
    pub async fn send<R>(&self, req: R) -> Result<(), TransportError>
    where
        S: Service<R> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<tower::BoxError>,
        R: Send + 'static,
    {
        self.clone().oneshot(req).await
    }
}

/// Tower `Service` implementation for `Transport`.
///
/// Delegates readiness and request handling to the inner service while mapping
/// all errors into [`TransportError`].
impl<R, S> Service<R> for Transport<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    R: Send + 'static,
{
    type Response = ();
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service
            .poll_ready(cx)
            .map_err(|e| TransportError::classify(e.into()))
    }

    fn call(&mut self, req: R) -> Self::Future {
        // Keep the instance that was polled ready; leave a fresh clone behind.
        let clone = self.service.clone();
        let mut service = std::mem::replace(&mut self.service, clone);

        Box::pin(async move {
            service
                .call(req)
                .await
                .map_err(|e| TransportError::classify(e.into()))?;
            Ok(())
        })
    }
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - Whether retrying can help
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The bus may accept the message later (timeouts, unavailable broker).
    Transient(tower::BoxError),
    /// The message itself is unacceptable (malformed, oversized).
    Permanent(tower::BoxError),
}

impl TransportError {
    pub fn transient(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Transient(err.into()),
        }
    }

    pub fn permanent(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Permanent(err.into()),
        }
    }

    /// Recover a `TransportError` raised deeper in the stack, or treat an
    /// unclassified error as transient.
    pub fn classify(err: tower::BoxError) -> Self {
        match err.downcast::<TransportError>() {
            Ok(err) => *err,
            Err(err) => Self::transient(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self.kind, TransportErrorKind::Permanent(_))
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Transient(err) => writeln!(f, "Transient transport error: {err}"),
            TransportErrorKind::Permanent(err) => writeln!(f, "Permanent transport error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Transient(err) => Some(err.as_ref()),
            TransportErrorKind::Permanent(err) => Some(err.as_ref()),
        }
    }
}

/// Tower service adapter for a [`Sender`] backend.
///
/// This type bridges the [`Sender`] trait with Tower’s `Service` abstraction.
#[derive(Clone, Debug)]
pub struct SenderService<D> {
    sender: D,
}

impl<D> SenderService<D> {
    /// Create a new sender service from a backend.
    pub fn new(sender: D) -> Self {
        Self { sender }
    }
}

/// `tower::Service` implementation delegating to a [`Sender`].
impl<P, D> Service<Publication<P>> for SenderService<D>
where
    P: Send + 'static,
    D: Sender<P> + Clone + Send + 'static,
{
    type Response = ();
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Publication<P>) -> Self::Future {
        let mut sender = self.sender.clone();
        Box::pin(async move {
            sender.send(req).await.map_err(Into::into)?;
            Ok(())
        })
    }
}

/// Trait implemented by concrete sender backends.
///
/// A sender delivers a [`Publication`] to an external system and resolves
/// once the system has acknowledged it. Errors that should not be retried
/// are returned as [`TransportError::permanent`].
#[async_trait::async_trait]
pub trait Sender<P> {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Send a publication using the underlying transport.
    async fn send(&mut self, publication: Publication<P>) -> Result<(), Self::Error>;
}

/// Wrapper type for raw byte payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload(Vec<u8>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}
