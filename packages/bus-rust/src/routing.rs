//! Queue routing layer.
//!
//! Turns logical addresses into inbox names and drives the [`Transport`]:
//! publish fan-out, lazy inbox consumption, request dispatch to registered
//! handlers and delivery of responses back to the correlation engine.
//!
//! Inbox handlers hold a weak reference to the router, so dropping the node
//! does not leave a reference cycle through the transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use stellar_core::{
    group_subscription_inbox, node_inbox, service_inbox, service_name, ClockSource, Envelope,
    HeaderBuilder, IdGenerator, NodeInboxKind,
};
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::correlation::CorrelationEngine;
use crate::error::{BusError, Failure};
use crate::registry::{EnvelopeHandler, HandlerKey, Registry, SubscriberKey};
use crate::transport::{Ack, Consumer, InboxHandler, Transport, Unsubscribe};

// ---------------------------------------------------------------------------
// QueueRouter
// ---------------------------------------------------------------------------

/// Routing state of one node, shared by all of its facades.
pub struct QueueRouter {
    transport: Arc<dyn Transport>,
    config: Arc<BusConfig>,
    headers: HeaderBuilder,
    registry: Arc<Registry>,
    correlation: CorrelationEngine,
    /// Inboxes this node consumes, with the handle on its own consumer.
    /// `None` while the transport is still attaching it.
    consuming: DashMap<String, Option<Consumer>>,
}

impl QueueRouter {
    /// Router stamping envelopes with the system clock and UUID ids.
    #[must_use]
    pub fn new(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        let headers = HeaderBuilder::new(config.node_id.clone());
        Self::build(config, transport, headers)
    }

    /// Router stamping envelopes from `clock` and `ids`. Headers always carry
    /// `config.node_id`, the same id the node's inboxes are derived from.
    #[must_use]
    pub fn with_sources(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn ClockSource>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        let headers = HeaderBuilder::new(config.node_id.clone())
            .with_clock(clock)
            .with_ids(ids);
        Self::build(config, transport, headers)
    }

    fn build(config: BusConfig, transport: Arc<dyn Transport>, headers: HeaderBuilder) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            headers,
            registry: Arc::new(Registry::new()),
            correlation: CorrelationEngine::new(),
            consuming: DashMap::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderBuilder {
        &self.headers
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn correlation(&self) -> &CorrelationEngine {
        &self.correlation
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Whether this node has started consuming `inbox`.
    #[must_use]
    pub fn is_consuming(&self, inbox: &str) -> bool {
        self.consuming.contains_key(inbox)
    }

    // -- inbox consumption --------------------------------------------------

    /// Start consuming `inbox` unless this node already does.
    ///
    /// The inbox is marked before the transport is called, so concurrent
    /// first callers never attach two consumers. Returns whether this call
    /// started it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] if the transport refuses; the mark is
    /// rolled back so a later call can retry.
    pub async fn ensure_consuming(
        &self,
        inbox: &str,
        concurrency: usize,
        handler: InboxHandler,
    ) -> Result<bool, BusError> {
        match self.consuming.entry(inbox.to_string()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(None);
            }
        }
        let started = if concurrency > 1 {
            self.transport.process_group(concurrency, inbox, handler).await
        } else {
            self.transport.process(inbox, handler).await
        };
        let consumer = match started {
            Ok(consumer) => consumer,
            Err(source) => {
                self.consuming.remove(inbox);
                return Err(BusError::transport(inbox, source));
            }
        };

        let released = match self.consuming.get_mut(inbox) {
            Some(mut slot) => {
                *slot = Some(consumer);
                None
            }
            None => Some(consumer),
        };
        // Released while the transport was attaching it.
        if let Some(consumer) = released {
            consumer
                .stop()
                .await
                .map_err(|source| BusError::transport(inbox, source))?;
            return Ok(false);
        }
        info!(inbox, concurrency, "consuming inbox");
        Ok(true)
    }

    /// Stop this node's consumer of `inbox`. Consumers other nodes attached
    /// to the same inbox keep running. Returns whether this node was
    /// consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Transport`] if the transport fails to stop it.
    pub async fn release_inbox(&self, inbox: &str) -> Result<bool, BusError> {
        let Some((_, consumer)) = self.consuming.remove(inbox) else {
            return Ok(false);
        };
        if let Some(consumer) = consumer {
            consumer
                .stop()
                .await
                .map_err(|source| BusError::transport(inbox, source))?;
        }
        info!(inbox, "released inbox");
        Ok(true)
    }

    // -- publish / subscribe ------------------------------------------------

    /// Enqueue `envelope` to every inbox subscribed to `channel`, in parallel.
    ///
    /// No subscribers is not an error: the result is empty.
    ///
    /// # Errors
    ///
    /// Returns the first enqueue failure once every enqueue has settled, or
    /// the failure to list subscribers.
    pub async fn publish(&self, channel: &str, envelope: Envelope) -> Result<Vec<Ack>, BusError> {
        let inboxes = self
            .transport
            .get_subscribers(channel)
            .await
            .map_err(|source| BusError::transport(channel, source))?;

        let sends = inboxes.iter().map(|inbox| {
            let envelope = envelope.clone();
            async move {
                self.transport
                    .enqueue(inbox, envelope)
                    .await
                    .map_err(|source| BusError::transport(inbox.as_str(), source))
            }
        });
        let results = join_all(sends).await;

        for error in results.iter().filter_map(|result| result.as_ref().err()) {
            warn!(channel, %error, "publish enqueue failed");
        }
        debug!(channel, inboxes = inboxes.len(), "published");
        results.into_iter().collect()
    }

    /// Subscribe `handler` to `channel` through this node's subscription inbox.
    ///
    /// # Errors
    ///
    /// Returns the transport failure; the registry entry is rolled back.
    pub async fn subscribe(
        self: &Arc<Self>,
        channel: &str,
        handler: EnvelopeHandler,
    ) -> Result<Subscription, BusError> {
        let key = self.registry.register_subscriber(channel, handler);
        let inbox = node_inbox(self.node_id(), NodeInboxKind::Subscription);
        self.attach(key, inbox, 1).await
    }

    /// Subscribe `handler` to `channel` as the member of `group` on this node.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateRegistration`] before touching the
    /// transport if the group already has a handler on `channel`, or the
    /// transport failure.
    pub async fn subscribe_group(
        self: &Arc<Self>,
        group: &str,
        channel: &str,
        handler: EnvelopeHandler,
    ) -> Result<Subscription, BusError> {
        let key = self
            .registry
            .register_group_subscriber(group, channel, handler)?;
        let inbox = group_subscription_inbox(group);
        let concurrency = self.config.group_concurrency;
        self.attach(key, inbox, concurrency).await
    }

    async fn attach(
        self: &Arc<Self>,
        key: SubscriberKey,
        inbox: String,
        concurrency: usize,
    ) -> Result<Subscription, BusError> {
        let dispatcher = self.subscription_dispatcher(key.group().map(str::to_string));
        let attached = async {
            self.ensure_consuming(&inbox, concurrency, dispatcher).await?;
            self.transport
                .register_subscriber(&key.channel, &inbox)
                .await
                .map_err(|source| BusError::transport(inbox.as_str(), source))
        }
        .await;

        match attached {
            Ok(unsubscribe) => {
                debug!(channel = %key.channel, inbox = %inbox, "subscribed");
                Ok(Subscription {
                    router: Arc::clone(self),
                    key,
                    inbox,
                    unsubscribe,
                    active: AtomicBool::new(true),
                })
            }
            Err(error) => {
                self.registry.remove_subscriber(&key);
                Err(error)
            }
        }
    }

    fn subscription_dispatcher(self: &Arc<Self>, group: Option<String>) -> InboxHandler {
        let router = Arc::downgrade(self);
        Arc::new(move |envelope: Envelope| {
            let router = Weak::clone(&router);
            let group = group.clone();
            Box::pin(async move {
                let Some(router) = router.upgrade() else {
                    return;
                };
                let Some(channel) = envelope.headers.channel.clone() else {
                    warn!(id = envelope.id(), "dropping publish without channel");
                    return;
                };
                router
                    .registry
                    .dispatch(&channel, envelope, group.as_deref())
                    .await;
            })
        })
    }

    // -- request handling ---------------------------------------------------

    /// Bind `handler` to `address` and start consuming its service inbox.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateRegistration`] if `address` is taken, or
    /// the transport failure (the binding is rolled back).
    pub async fn add_request_handler(
        self: &Arc<Self>,
        address: &str,
        handler: EnvelopeHandler,
    ) -> Result<HandlerRegistration, BusError> {
        let key = self.registry.register_request_handler(address, handler)?;
        let inbox = service_inbox(address);
        let dispatcher = self.request_dispatcher();
        if let Err(error) = self
            .ensure_consuming(&inbox, self.config.handler_concurrency, dispatcher)
            .await
        {
            self.registry.remove_request_handler(&key);
            return Err(error);
        }
        debug!(address, inbox = %inbox, "request handler added");
        Ok(HandlerRegistration {
            router: Arc::clone(self),
            key,
            inbox,
            active: AtomicBool::new(true),
        })
    }

    fn request_dispatcher(self: &Arc<Self>) -> InboxHandler {
        let router = Arc::downgrade(self);
        Arc::new(move |envelope: Envelope| {
            let router = Weak::clone(&router);
            Box::pin(async move {
                if let Some(router) = router.upgrade() {
                    router.serve_request(envelope).await;
                }
            })
        })
    }

    /// Run the handler bound to the request's `queueName` and send its
    /// response or error response to `respondTo`, if any.
    async fn serve_request(&self, envelope: Envelope) {
        let address = envelope.headers.queue_name.clone().unwrap_or_default();
        let respond_to = envelope.headers.respond_to.clone();

        let Some(handler) = self.registry.request_handler(&address) else {
            let error = BusError::NoHandler {
                address: address.clone(),
            };
            warn!(address, id = envelope.id(), "no handler for request");
            if let Some(inbox) = respond_to {
                let response = self.headers.error_response(
                    &envelope.headers,
                    error.error_type(),
                    &error.to_error_body(),
                );
                self.send_reply(&inbox, response).await;
            }
            return;
        };

        match handler(envelope).await {
            Ok(reply) => {
                if let (Some(inbox), Some(response)) = (respond_to, reply.as_response()) {
                    self.send_reply(&inbox, response.clone()).await;
                }
            }
            Err(failure) => match (respond_to, failure.response) {
                (Some(inbox), Some(response)) => {
                    debug!(address, error = %failure.error, "request handler failed, replying with error");
                    self.send_reply(&inbox, response).await;
                }
                _ => warn!(address, error = %failure.error, "request handler failed"),
            },
        }
    }

    async fn send_reply(&self, inbox: &str, response: Envelope) {
        if let Err(error) = self.transport.enqueue(inbox, response).await {
            warn!(inbox, %error, "failed to send response");
        }
    }

    // -- requests -----------------------------------------------------------

    fn response_dispatcher(self: &Arc<Self>) -> InboxHandler {
        let router = Arc::downgrade(self);
        Arc::new(move |envelope: Envelope| {
            let router = Weak::clone(&router);
            Box::pin(async move {
                let Some(router) = router.upgrade() else {
                    return;
                };
                if let Err(error) = router.correlation.on_response(envelope) {
                    warn!(%error, "dropping uncorrelated response");
                }
            })
        })
    }

    /// Deliver a request to its service inbox.
    ///
    /// Starts consuming this node's response inbox first and defaults
    /// `respondTo` to it.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MissingAddress`] without `queueName`, or the
    /// transport failure.
    pub async fn remote_request(self: &Arc<Self>, mut envelope: Envelope) -> Result<(), BusError> {
        let Some(address) = envelope.headers.queue_name.clone() else {
            return Err(BusError::MissingAddress {
                id: envelope.id().to_string(),
            });
        };
        let response_inbox = node_inbox(self.node_id(), NodeInboxKind::Response);
        self.ensure_consuming(&response_inbox, 1, self.response_dispatcher())
            .await?;
        if envelope.headers.respond_to.is_none() {
            envelope.headers.respond_to = Some(response_inbox);
        }

        let inbox = service_inbox(&address);
        self.transport
            .enqueue(&inbox, envelope)
            .await
            .map_err(|source| BusError::transport(inbox.as_str(), source))?;
        Ok(())
    }

    /// Timeout armed for `envelope`: its `requestTimeout` header, else the
    /// node default.
    #[must_use]
    pub fn timeout_for(&self, envelope: &Envelope) -> Option<u64> {
        self.config
            .effective_timeout_ms(envelope.headers.request_timeout)
    }

    /// Send a request and wait for its correlated response.
    ///
    /// # Errors
    ///
    /// See [`CorrelationEngine::request`].
    pub async fn request(self: &Arc<Self>, envelope: Envelope) -> Result<Envelope, Failure> {
        let timeout_ms = self.timeout_for(&envelope);
        let router = Arc::clone(self);
        self.correlation
            .request(envelope, timeout_ms, move |envelope| async move {
                router.remote_request(envelope).await
            })
            .await
    }

    /// Deliver a request without waiting for, or expecting, a response.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MissingAddress`] without `queueName`, or the
    /// transport failure.
    pub async fn fire_and_forget(&self, envelope: Envelope) -> Result<Ack, BusError> {
        let Some(address) = envelope.headers.queue_name.as_deref() else {
            return Err(BusError::MissingAddress {
                id: envelope.id().to_string(),
            });
        };
        let inbox = service_inbox(address);
        self.transport
            .enqueue(&inbox, envelope)
            .await
            .map_err(|source| BusError::transport(inbox.as_str(), source))
    }

    // -- lifecycle ----------------------------------------------------------

    /// Clear the registry and drop every inflight request.
    ///
    /// Inboxes keep being consumed; requests reaching a now-unbound address
    /// are answered with a missing-handler error.
    pub fn reset(&self) {
        self.registry.reset();
        let dropped = self.correlation.reset();
        info!(node_id = self.node_id(), dropped, "router reset");
    }

    /// Stop consuming every inbox and drop inflight requests.
    /// Returns how many inboxes were released.
    ///
    /// # Errors
    ///
    /// Returns the first transport failure; the remaining inboxes are still
    /// released.
    pub async fn shutdown(&self) -> Result<usize, BusError> {
        let inboxes: Vec<String> = self.consuming.iter().map(|inbox| inbox.key().clone()).collect();
        let mut released = 0;
        let mut first_error = None;
        for inbox in &inboxes {
            match self.release_inbox(inbox).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(inbox = %inbox, %error, "failed to release inbox");
                    first_error.get_or_insert(error);
                }
            }
        }
        self.correlation.reset();
        info!(node_id = self.node_id(), released, "router shut down");
        match first_error {
            Some(error) => Err(error),
            None => Ok(released),
        }
    }
}

impl std::fmt::Debug for QueueRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRouter")
            .field("node_id", &self.config.node_id)
            .field("consuming", &self.consuming.len())
            .field("registry", &self.registry)
            .field("correlation", &self.correlation)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registration handles
// ---------------------------------------------------------------------------

/// A live channel subscription.
#[derive(Debug)]
pub struct Subscription {
    router: Arc<QueueRouter>,
    key: SubscriberKey,
    inbox: String,
    unsubscribe: Unsubscribe,
    active: AtomicBool,
}

impl Subscription {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.key.channel
    }

    /// Generated id for individual subscriptions, the group id otherwise.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        self.key.subscription_id()
    }

    /// Inbox the subscription is delivered through.
    #[must_use]
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Remove the subscription. Safe to call more than once: only the first
    /// call has any effect and returns `true`.
    ///
    /// Only this subscription's directory registration is dropped, so the
    /// channel keeps reaching the inbox while other subscriptions (on this
    /// node or, for groups, on other nodes) hold it. The inbox is released
    /// once nothing on this node is delivered through it.
    ///
    /// # Errors
    ///
    /// Returns the transport failure.
    pub async fn unsubscribe(&self) -> Result<bool, BusError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let registry = self.router.registry();
        registry.remove_subscriber(&self.key);

        self.unsubscribe
            .call()
            .await
            .map_err(|source| BusError::transport(self.inbox.as_str(), source))?;
        let idle = match self.key.group() {
            Some(group) => !registry.has_group(group),
            None => !registry.has_individual_subscribers(),
        };
        if idle {
            self.router.release_inbox(&self.inbox).await?;
        }
        debug!(channel = %self.key.channel, inbox = %self.inbox, "unsubscribed");
        Ok(true)
    }
}

/// A bound request handler.
#[derive(Debug)]
pub struct HandlerRegistration {
    router: Arc<QueueRouter>,
    key: HandlerKey,
    inbox: String,
    active: AtomicBool,
}

impl HandlerRegistration {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.key.address
    }

    #[must_use]
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Unbind the handler. This node stops consuming the service inbox when
    /// no handler of the same service remains on it; other nodes serving
    /// the service are unaffected. Only the first call has any effect and
    /// returns `true`.
    ///
    /// # Errors
    ///
    /// Returns the transport failure from releasing the inbox.
    pub async fn remove(&self) -> Result<bool, BusError> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let registry = self.router.registry();
        registry.remove_request_handler(&self.key);
        if !registry.has_service_handlers(service_name(&self.key.address)) {
            self.router.release_inbox(&self.inbox).await?;
        }
        Ok(true)
    }
}
