//! Server role: bind handlers to addresses behind the handler middleware chain.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use stellar_core::Envelope;

use super::Verb;
use crate::error::{BusError, Failure};
use crate::pipeline::{
    CallOptions, Matcher, Middleware, MiddlewareEntry, MiddlewareStack, Pipeline, Reply, Terminal,
};
use crate::registry::EnvelopeHandler;
use crate::routing::{HandlerRegistration, QueueRouter};

#[derive(Debug, Clone)]
pub struct RequestServer {
    router: Arc<QueueRouter>,
    middleware: Arc<MiddlewareStack>,
}

impl RequestServer {
    #[must_use]
    pub fn new(router: Arc<QueueRouter>) -> Self {
        Self {
            router,
            middleware: Arc::new(MiddlewareStack::new()),
        }
    }

    /// Add a middleware for handlers whose address passes `matcher`.
    /// Applies to handlers registered after this call.
    pub fn use_middleware(&self, matcher: Matcher, middleware: impl Middleware) {
        self.middleware.push(MiddlewareEntry::new(matcher, middleware));
    }

    /// Serve `address` with `handler`.
    ///
    /// The handler's value becomes the response body. Its error becomes the
    /// error response; return a [`stellar_core::StellarError`] to send
    /// property errors to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateRegistration`] if `address` already has a
    /// handler on this node, or the transport failure.
    pub async fn handle_request<H, Fut, E>(
        &self,
        address: &str,
        handler: H,
    ) -> Result<HandlerRegistration, BusError>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Failure>,
    {
        let handler = Arc::new(handler);
        let terminal: Terminal = Arc::new(move |envelope: Envelope| {
            let response = handler(envelope);
            Box::pin(async move { response.await.map(Reply::Body).map_err(Into::into) })
        });
        let pipeline = Pipeline::new(
            self.router.headers().clone(),
            self.middleware.snapshot(),
            terminal,
        );
        let entry: EnvelopeHandler = Arc::new(move |envelope: Envelope| {
            let pipeline = pipeline.clone();
            Box::pin(async move { pipeline.run(envelope, CallOptions::default()).await })
        });
        self.router.add_request_handler(address, entry).await
    }

    /// # Errors
    ///
    /// See [`RequestServer::handle_request`].
    pub async fn get<H, Fut, E>(&self, address: &str, handler: H) -> Result<HandlerRegistration, BusError>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Failure>,
    {
        self.handle_request(&Verb::Get.address(address), handler).await
    }

    /// # Errors
    ///
    /// See [`RequestServer::handle_request`].
    pub async fn create<H, Fut, E>(&self, address: &str, handler: H) -> Result<HandlerRegistration, BusError>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Failure>,
    {
        self.handle_request(&Verb::Create.address(address), handler).await
    }

    /// # Errors
    ///
    /// See [`RequestServer::handle_request`].
    pub async fn update<H, Fut, E>(&self, address: &str, handler: H) -> Result<HandlerRegistration, BusError>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Failure>,
    {
        self.handle_request(&Verb::Update.address(address), handler).await
    }

    /// # Errors
    ///
    /// See [`RequestServer::handle_request`].
    pub async fn remove<H, Fut, E>(&self, address: &str, handler: H) -> Result<HandlerRegistration, BusError>
    where
        H: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, E>> + Send + 'static,
        E: Into<Failure>,
    {
        self.handle_request(&Verb::Remove.address(address), handler).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stellar_core::StellarError;

    use super::*;
    use crate::config::BusConfig;
    use crate::pipeline::Next;
    use crate::transport::{MemoryTransport, Transport};

    fn server() -> RequestServer {
        let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new());
        RequestServer::new(Arc::new(QueueRouter::new(
            BusConfig::with_node_id("server"),
            transport,
        )))
    }

    #[tokio::test]
    async fn verb_helpers_bind_suffixed_addresses() {
        let server = server();
        let registration = server
            .get("svc:user", |_envelope: Envelope| async { Ok::<_, StellarError>(json!(1)) })
            .await
            .unwrap();
        assert_eq!(registration.address(), "svc:user:get");
        assert_eq!(registration.inbox(), "stlr:s:svc:req");
    }

    #[tokio::test]
    async fn duplicate_address_is_rejected() {
        let server = server();
        server
            .create("svc:user", |_envelope: Envelope| async { Ok::<_, StellarError>(json!(1)) })
            .await
            .unwrap();
        let err = server
            .create("svc:user", |_envelope: Envelope| async { Ok::<_, StellarError>(json!(2)) })
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateRegistration { url } if url == "svc:user:create"));
    }

    #[tokio::test]
    async fn handler_chain_wraps_value_into_response() {
        let server = server();
        server.use_middleware(Matcher::Always, |envelope: Envelope, next: Next| async move {
            let mut envelope = envelope;
            envelope.body["seen"] = json!(true);
            next.run(envelope).await
        });
        server
            .update("svc:user", |envelope: Envelope| async move {
                Ok::<_, StellarError>(envelope.body)
            })
            .await
            .unwrap();

        let router = Arc::clone(&server.router);
        let request = Envelope::new(
            router.headers().build(
                stellar_core::HeaderOverrides::default().queue_name("svc:user:update"),
                stellar_core::HeaderOverrides::default(),
            ),
            json!({ "name": "ada" }),
        );
        let handler = router.registry().request_handler("svc:user:update").unwrap();
        let reply = handler(request.clone()).await.unwrap();
        let response = reply.as_response().unwrap();
        assert_eq!(response.headers.request_id.as_deref(), Some(request.id()));
        assert_eq!(response.body, json!({ "name": "ada", "seen": true }));
    }
}
