use std::{convert::Infallible, sync::Arc};

use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::transport::{Publication, Sender};

type Subscriber<P> = (Vec<String>, mpsc::UnboundedSender<Publication<P>>);

/// In-memory message bus for testing or local pipelines.
///
/// Every publication is recorded and fanned out to the subscribers of its
/// topic. It is useful for:
/// - Unit and integration testing
/// - Simulating message delivery without a real broker
/// - Wiring an [`Inbox`](crate::Inbox) to a relay inside one process
///
/// ## Type Parameters
///
/// - `P`: type of the publication payload
pub struct InMemory<P> {
    sent: Arc<Mutex<Vec<Publication<P>>>>,
    subscribers: Arc<Mutex<Vec<Subscriber<P>>>>,
}

impl<P: Clone> InMemory<P> {
    /// Return a copy of every publication accepted so far, in order.
    pub async fn sent_messages(&self) -> Vec<Publication<P>> {
        self.sent.lock().await.clone()
    }

    /// Receive every publication on `topics` from now on. An empty list
    /// subscribes to all topics.
    pub async fn subscribe<T: Into<String>>(
        &self,
        topics: impl IntoIterator<Item = T>,
    ) -> UnboundedReceiverStream<Publication<P>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let topics = topics.into_iter().map(Into::into).collect();
        self.subscribers.lock().await.push((topics, tx));
        UnboundedReceiverStream::new(rx)
    }
}

impl<P> Clone for InMemory<P> {
    fn clone(&self) -> Self {
        Self {
            sent: Arc::clone(&self.sent),
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<P> Default for InMemory<P> {
    /// Create a new empty in-memory bus.
    fn default() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait::async_trait]
impl<P> Sender<P> for InMemory<P>
where
    P: Clone + std::fmt::Debug + Send + Sync,
{
    type Error = Infallible;

    /// "Send" a publication by recording it and forwarding it to subscribers.
    #[tracing::instrument(skip_all, fields(topic = %publication.topic, key = %publication.key))]
    async fn send(&mut self, publication: Publication<P>) -> Result<(), Self::Error> {
        {
            let mut subscribers = self.subscribers.lock().await;
            subscribers.retain(|(topics, tx)| {
                if topics.is_empty() || topics.contains(&publication.topic) {
                    tx.send(publication.clone()).is_ok()
                } else {
                    !tx.is_closed()
                }
            });
        }
        self.sent.lock().await.push(publication);
        tracing::debug!("Publication accepted by in-memory bus");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn publication(topic: &str, payload: u32) -> Publication<u32> {
        Publication {
            topic: topic.to_owned(),
            key: payload.to_string(),
            headers: Vec::new(),
            payload,
        }
    }

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let mut bus = InMemory::<u32>::default();
        let mut users = bus.subscribe(["user.events"]).await;
        let mut everything = bus.subscribe(Vec::<String>::new()).await;

        bus.send(publication("post.events", 1)).await.unwrap();
        bus.send(publication("user.events", 2)).await.unwrap();

        assert_eq!(users.next().await.unwrap().payload, 2);
        assert_eq!(everything.next().await.unwrap().payload, 1);
        assert_eq!(everything.next().await.unwrap().payload, 2);
        assert_eq!(bus.sent_messages().await.len(), 2);
    }
}
