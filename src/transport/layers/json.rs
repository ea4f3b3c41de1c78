use crate::transport::{Publication, RawPayload, TransportError};
use std::{future::Future, pin::Pin};
use tower::{Layer, Service};

/// Tower `Service` wrapper that serializes payloads to JSON.
///
/// This service converts any payload type `M` that implements
/// `serde::Serialize` into a `RawPayload` containing the serialized JSON
/// bytes before passing it to the inner service. A payload that cannot be
/// serialized will never succeed, so the failure is reported as a
/// permanent [`TransportError`].
#[derive(Clone, Debug)]
pub struct JsonService<T> {
    inner: T,
}

impl<T, M> Service<Publication<M>> for JsonService<T>
where
    M: serde::Serialize + Send + 'static,
    T: Service<Publication<RawPayload>> + Clone + Send + 'static,
    <T as Service<Publication<RawPayload>>>::Error: Into<tower::BoxError>,
    T::Future: Send + 'static,
{
    type Response = T::Response;
    type Error = tower::BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Publication<M>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let bytes = serde_json::to_vec(&req.payload).map_err(TransportError::permanent)?;
            let publication = req.map(|_| RawPayload(bytes));

            inner.call(publication).await.map_err(Into::into)
        })
    }
}

/// Tower `Layer` that applies `JsonService` to a service stack.
///
/// Wraps an existing service so that all outgoing payloads are serialized
/// to JSON automatically.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLayer;

impl<S> Layer<S> for JsonLayer {
    type Service = JsonService<S>;

    fn layer(&self, service: S) -> Self::Service {
        JsonService { inner: service }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InMemory, Transport};
    use serde::{Serialize, Serializer};

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("payload cannot be encoded"))
        }
    }

    fn publication<P>(payload: P) -> Publication<P> {
        Publication {
            topic: "user.events".to_owned(),
            key: "1".to_owned(),
            headers: Vec::new(),
            payload,
        }
    }

    #[tokio::test]
    async fn payload_is_encoded_as_json() {
        let bus = InMemory::<RawPayload>::default();
        let transport = Transport::new(bus.clone()).layer(JsonLayer);

        transport
            .send(publication(serde_json::json!({ "user_id": 1 })))
            .await
            .unwrap();

        let sent = bus.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.as_bytes(), br#"{"user_id":1}"#);
        assert_eq!(sent[0].key, "1");
    }

    #[tokio::test]
    async fn encoding_failures_are_permanent() {
        let bus = InMemory::<RawPayload>::default();
        let transport = Transport::new(bus.clone()).layer(JsonLayer);

        let err = transport.send(publication(Unserializable)).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(bus.sent_messages().await.is_empty());
    }
}
