#![doc = include_str!("../README.md")]

pub mod backoff;
pub mod config;
pub mod event;
pub mod inbox;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod monitor;
pub mod outbox;
mod poller;
pub mod relay;
pub mod transport;

#[doc(inline)]
pub use event::{DomainEvent, EventEnvelope, EventState, NewEvent};

#[doc(inline)]
pub use config::{ConfigError, ConfigErrorKind, InboxConfig, MonitorConfig, RelayConfig};

#[doc(inline)]
pub use outbox::{BacklogStats, Outbox, OutboxError, OutboxErrorKind, Partition};

#[doc(inline)]
pub use relay::{BatchReport, DefaultRelayHook, Relay, RelayHook, RelayRunError, RelayRunErrorKind};

#[doc(inline)]
pub use inbox::{Delivery, Inbox, InboxError, InboxErrorKind, Outcome};

#[doc(inline)]
pub use monitor::{BacklogMonitor, BacklogStatus, Health};

#[doc(inline)]
pub use transport::{Publication, Transport, TransportError, TransportErrorKind};
