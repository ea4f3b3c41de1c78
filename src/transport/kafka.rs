use async_trait::async_trait;
use rdkafka::{
    ClientConfig,
    error::{KafkaError, RDKafkaErrorCode},
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord},
};
use std::time::Duration;

use crate::transport::{Publication, RawPayload, Sender, TransportError};

/// Kafka transport sender.
///
/// Publishes to the publication's topic with its key and headers using a
/// `FutureProducer`, and resolves once the broker has acknowledged the write.
/// Broker rejections of the message itself (oversized, corrupt) are
/// permanent; everything else is retried by the relay.
#[derive(Clone)]
pub struct Kafka {
    /// Kafka producer handle
    producer: FutureProducer,
    /// Timeout for sending messages
    timeout: Duration,
}

impl Kafka {
    /// Create a new Kafka sender using the given `FutureProducer`.
    ///
    /// Default timeout is 5 seconds.
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }

    /// Create a sender with [`idempotent_config`] for the given brokers.
    pub fn connect(bootstrap_servers: &str) -> Result<Self, KafkaError> {
        Ok(Self::new(idempotent_config(bootstrap_servers).create()?))
    }

    /// Set a custom timeout for sending messages.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Producer settings that keep broker-side retries from duplicating or
/// reordering messages of one partition.
pub fn idempotent_config(bootstrap_servers: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", bootstrap_servers)
        .set("enable.idempotence", "true")
        .set("acks", "all")
        .set("max.in.flight.requests.per.connection", "5");
    config
}

#[async_trait]
impl Sender<RawPayload> for Kafka {
    type Error = TransportError;

    /// Send a message to Kafka.
    ///
    /// Maps the `Publication` fields as follows:
    /// - `topic` → Kafka topic
    /// - `key` → Kafka message key
    /// - `headers` → Kafka message headers
    /// - `payload` → message payload
    #[tracing::instrument(skip_all, fields(topic = %publication.topic))]
    async fn send(&mut self, publication: Publication<RawPayload>) -> Result<(), Self::Error> {
        let capacity = publication.headers.len();
        let headers = publication.headers.iter().fold(
            OwnedHeaders::new_with_capacity(capacity),
            |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value.as_str()),
                })
            },
        );

        let record = FutureRecord::to(&publication.topic)
            .payload(publication.payload.as_bytes())
            .key(publication.key.as_str())
            .headers(headers);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| classify(e))?;

        Ok(())
    }
}

fn classify(error: KafkaError) -> TransportError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::InvalidMessageSize
            | RDKafkaErrorCode::InvalidMessage
            | RDKafkaErrorCode::BadMessage
            | RDKafkaErrorCode::InvalidRecord
            | RDKafkaErrorCode::RecordListTooLarge,
        ) => TransportError::permanent(error),
        _ => TransportError::transient(error),
    }
}
