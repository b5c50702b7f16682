//! Client role: build request envelopes and send them through the request
//! middleware chain.

use std::sync::Arc;

use serde_json::Value;
use stellar_core::{Envelope, HeaderOverrides, MessageType};

use super::Verb;
use crate::error::{BusError, Failure};
use crate::pipeline::{
    CallOptions, Matcher, Middleware, MiddlewareEntry, MiddlewareStack, Pipeline, PipelineResult,
    Reply, Terminal,
};
use crate::routing::QueueRouter;

#[derive(Debug, Clone)]
pub struct RequestClient {
    router: Arc<QueueRouter>,
    middleware: Arc<MiddlewareStack>,
}

impl RequestClient {
    #[must_use]
    pub fn new(router: Arc<QueueRouter>) -> Self {
        Self {
            router,
            middleware: Arc::new(MiddlewareStack::new()),
        }
    }

    /// Add a middleware for requests whose address passes `matcher`.
    /// Applies to requests sent after this call.
    pub fn use_middleware(&self, matcher: Matcher, middleware: impl Middleware) {
        self.middleware.push(MiddlewareEntry::new(matcher, middleware));
    }

    /// Send `body` to `address` and return the settled pipeline result.
    ///
    /// With `request_only` the envelope goes out as fire-and-forget and the
    /// reply is the enqueue acknowledgment; otherwise the reply is the
    /// correlated response envelope.
    ///
    /// # Errors
    ///
    /// Returns the failure of the request chain: a middleware error, a
    /// transport error, a timeout, or the remote error.
    pub async fn send(&self, address: &str, body: Value, options: CallOptions) -> PipelineResult {
        let kind = if options.request_only {
            MessageType::FireAndForget
        } else {
            MessageType::Request
        };
        let mut overrides = options.headers.clone();
        if options.timeout_ms.is_some() {
            overrides.request_timeout = options.timeout_ms;
        }
        let defaults = HeaderOverrides::default().kind(kind).queue_name(address);
        let envelope = Envelope::new(self.router.headers().build(overrides, defaults), body);

        let terminal = if options.request_only {
            self.fire_and_forget_terminal()
        } else {
            self.request_terminal()
        };
        Pipeline::new(
            self.router.headers().clone(),
            self.middleware.snapshot(),
            terminal,
        )
        .run(envelope, options)
        .await
    }

    fn request_terminal(&self) -> Terminal {
        let router = Arc::clone(&self.router);
        Arc::new(move |envelope: Envelope| {
            let router = Arc::clone(&router);
            Box::pin(async move { router.request(envelope).await.map(Reply::Envelope) })
        })
    }

    fn fire_and_forget_terminal(&self) -> Terminal {
        let router = Arc::clone(&self.router);
        Arc::new(move |envelope: Envelope| {
            let router = Arc::clone(&router);
            Box::pin(async move {
                router
                    .fire_and_forget(envelope)
                    .await
                    .map(|ack| Reply::Acks(vec![ack]))
                    .map_err(Failure::from)
            })
        })
    }

    /// Send `body` to `address` and return the response body, or the whole
    /// response envelope as JSON with `raw_response`.
    ///
    /// # Errors
    ///
    /// Returns the error of [`RequestClient::send`]. A remote
    /// `StellarError` comes back as [`BusError::Stellar`] with its
    /// property errors.
    pub async fn request(
        &self,
        address: &str,
        body: Value,
        options: CallOptions,
    ) -> Result<Value, BusError> {
        let raw = options.raw_response;
        let reply = self.send(address, body, options).await.map_err(Failure::into_error)?;
        match reply {
            Reply::Envelope(envelope) if raw => {
                serde_json::to_value(envelope).map_err(|e| BusError::Internal(e.into()))
            }
            reply => Ok(reply.into_body()),
        }
    }

    /// # Errors
    ///
    /// See [`RequestClient::request`].
    pub async fn get(&self, address: &str, body: Value, options: CallOptions) -> Result<Value, BusError> {
        self.request(&Verb::Get.address(address), body, options).await
    }

    /// # Errors
    ///
    /// See [`RequestClient::request`].
    pub async fn create(&self, address: &str, body: Value, options: CallOptions) -> Result<Value, BusError> {
        self.request(&Verb::Create.address(address), body, options).await
    }

    /// # Errors
    ///
    /// See [`RequestClient::request`].
    pub async fn update(&self, address: &str, body: Value, options: CallOptions) -> Result<Value, BusError> {
        self.request(&Verb::Update.address(address), body, options).await
    }

    /// # Errors
    ///
    /// See [`RequestClient::request`].
    pub async fn remove(&self, address: &str, body: Value, options: CallOptions) -> Result<Value, BusError> {
        self.request(&Verb::Remove.address(address), body, options).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::BusConfig;
    use crate::pipeline::Next;
    use crate::transport::{MemoryTransport, Transport};

    fn client() -> (RequestClient, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let dyn_transport: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;
        let router = Arc::new(QueueRouter::new(BusConfig::with_node_id("client"), dyn_transport));
        (RequestClient::new(router), transport)
    }

    #[tokio::test]
    async fn request_only_returns_ack_without_waiting() {
        let (client, transport) = client();
        let reply = client
            .send("svc:log:create", json!({ "line": 1 }), CallOptions::default().request_only())
            .await
            .unwrap();
        match reply {
            Reply::Acks(acks) => assert_eq!(acks[0].inbox, "stlr:s:svc:req"),
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(transport.enqueued_count("stlr:s:svc:req"), 1);
    }

    #[tokio::test]
    async fn middleware_can_answer_locally() {
        let (client, transport) = client();
        client.use_middleware(
            Matcher::exact("svc:cache:get"),
            |_envelope: Envelope, _next: Next| async { Ok::<_, Failure>(Reply::Body(json!("hit"))) },
        );

        let body = client
            .get("svc:cache", json!({}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(body, json!("hit"));
        assert_eq!(transport.enqueued_count("stlr:s:svc:req"), 0);
    }

    #[tokio::test]
    async fn middleware_sees_outgoing_headers() {
        let (client, _transport) = client();
        client.use_middleware(Matcher::Always, |envelope: Envelope, _next: Next| async move {
            assert_eq!(envelope.headers.queue_name.as_deref(), Some("svc:user:update"));
            assert_eq!(envelope.headers.request_timeout, Some(500));
            assert_eq!(envelope.headers.extra["traceId"], "t-1");
            Ok::<_, Failure>(Reply::Body(Value::Null))
        });
        client
            .update(
                "svc:user",
                json!({}),
                CallOptions::default().timeout(500).header("traceId", "t-1"),
            )
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let (client, _transport) = client();
        let err = client
            .create("nobody:thing", json!({}), CallOptions::default().timeout(200))
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout { timeout_ms: 200, .. }));
    }
}
