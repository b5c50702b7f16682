//! Publish/subscribe role, optionally scoped to a subscriber group.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use stellar_core::{Envelope, HeaderOverrides, MessageType};

use crate::error::{BusError, Failure};
use crate::pipeline::{
    CallOptions, Matcher, Middleware, MiddlewareEntry, MiddlewareStack, Pipeline, Reply, Terminal,
};
use crate::registry::EnvelopeHandler;
use crate::routing::{QueueRouter, Subscription};
use crate::transport::Ack;

/// Publisher and subscriber for one node.
///
/// Without a group every subscriber on a channel receives every message.
/// With a group, each message reaches one member of the group.
#[derive(Debug, Clone)]
pub struct PubSub {
    router: Arc<QueueRouter>,
    middleware: Arc<MiddlewareStack>,
    group: Option<String>,
}

impl PubSub {
    #[must_use]
    pub fn new(router: Arc<QueueRouter>) -> Self {
        Self {
            router,
            middleware: Arc::new(MiddlewareStack::new()),
            group: None,
        }
    }

    /// Facade whose subscriptions join `group`.
    #[must_use]
    pub fn with_group(router: Arc<QueueRouter>, group: impl Into<String>) -> Self {
        Self {
            group: Some(group.into()),
            ..Self::new(router)
        }
    }

    #[must_use]
    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Add a middleware run on publishes and deliveries whose channel passes
    /// `matcher`.
    pub fn use_middleware(&self, matcher: Matcher, middleware: impl Middleware) {
        self.middleware.push(MiddlewareEntry::new(matcher, middleware));
    }

    fn pipeline(&self, terminal: Terminal) -> Pipeline {
        Pipeline::new(
            self.router.headers().clone(),
            self.middleware.snapshot(),
            terminal,
        )
    }

    /// Publish `body` on `channel` to every subscribed inbox.
    ///
    /// Returns one acknowledgment per inbox; none when nobody is subscribed.
    ///
    /// # Errors
    ///
    /// Returns the middleware or transport failure.
    pub async fn publish(&self, channel: &str, body: Value) -> Result<Vec<Ack>, BusError> {
        let headers = self.router.headers().build(
            HeaderOverrides::default(),
            HeaderOverrides::default()
                .kind(MessageType::Publish)
                .channel(channel),
        );
        let router = Arc::clone(&self.router);
        let terminal: Terminal = Arc::new(move |envelope: Envelope| {
            let router = Arc::clone(&router);
            Box::pin(async move {
                let channel = envelope.headers.channel.clone().unwrap_or_default();
                router
                    .publish(&channel, envelope)
                    .await
                    .map(Reply::Acks)
                    .map_err(Failure::from)
            })
        });

        let reply = self
            .pipeline(terminal)
            .run(Envelope::new(headers, body), CallOptions::default())
            .await
            .map_err(Failure::into_error)?;
        Ok(match reply {
            Reply::Acks(acks) => acks,
            _ => Vec::new(),
        })
    }

    /// Subscribe `handler` to `channel`, as a group member if this facade has
    /// a group.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateRegistration`] if the group already has a
    /// handler on `channel`, or the transport failure.
    pub async fn subscribe<H, Fut, E>(&self, channel: &str, handler: H) -> Result<Subscription, BusError>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<Failure>,
    {
        let handler = Arc::new(handler);
        let terminal: Terminal = Arc::new(move |envelope: Envelope| {
            let delivered = handler(envelope);
            Box::pin(async move { delivered.await.map(|()| Reply::Empty).map_err(Into::into) })
        });
        let pipeline = self.pipeline(terminal);
        let entry: EnvelopeHandler = Arc::new(move |envelope: Envelope| {
            let pipeline = pipeline.clone();
            Box::pin(async move { pipeline.run(envelope, CallOptions::default()).await })
        });

        match &self.group {
            Some(group) => self.router.subscribe_group(group, channel, entry).await,
            None => self.router.subscribe(channel, entry).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stellar_core::StellarError;
    use tokio::sync::mpsc;

    use super::*;
    use crate::config::BusConfig;
    use crate::pipeline::Next;
    use crate::transport::{MemoryTransport, Transport};

    fn router() -> Arc<QueueRouter> {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        Arc::new(QueueRouter::new(BusConfig::with_node_id("n1"), transport))
    }

    #[tokio::test]
    async fn publish_reaches_local_subscriber() {
        let pubsub = PubSub::new(router());
        let (tx, mut rx) = mpsc::unbounded_channel();
        pubsub
            .subscribe("news", move |envelope: Envelope| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(envelope.body);
                    Ok::<_, StellarError>(())
                }
            })
            .await
            .unwrap();

        let acks = pubsub.publish("news", json!({ "headline": "hi" })).await.unwrap();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].inbox, "stlr:n:n1:subscriptionInbox");
        assert_eq!(rx.recv().await.unwrap(), json!({ "headline": "hi" }));
    }

    #[tokio::test]
    async fn publish_middleware_can_block() {
        let pubsub = PubSub::new(router());
        pubsub.use_middleware(Matcher::exact("secret"), |_envelope: Envelope, _next: Next| async {
            Err::<Reply, _>(Failure::from(StellarError::new("forbidden")))
        });

        let err = pubsub.publish("secret", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "forbidden");
        assert!(pubsub.publish("open", json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn group_facade_subscribes_through_group_inbox() {
        let pubsub = PubSub::with_group(router(), "workers");
        assert_eq!(pubsub.group(), Some("workers"));
        let subscription = pubsub
            .subscribe("jobs", |_envelope: Envelope| async { Ok::<_, StellarError>(()) })
            .await
            .unwrap();
        assert_eq!(subscription.subscription_id(), "workers");
        assert_eq!(subscription.inbox(), "stlr:s:workers:subscriptionInbox");
    }
}
