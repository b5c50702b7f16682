//! Transport collaborator contract.
//!
//! A transport moves envelopes between named inboxes and keeps the
//! channel → subscriber-inbox directory used for publish fan-out. Everything
//! above this trait is backend-agnostic: a durable queue, a socket bridge or
//! the in-process [`memory::MemoryTransport`] plug in the same way.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stellar_core::Envelope;

pub use memory::MemoryTransport;

/// Callback invoked for every envelope delivered to a consumed inbox.
pub type InboxHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Acknowledgment that an envelope was accepted into an inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub inbox: String,
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// One-shot handles
// ---------------------------------------------------------------------------

type OnceFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<bool>> + Send>;

/// Closure that runs at most once; later calls report `Ok(false)`.
struct OnceCall {
    inner: Mutex<Option<OnceFn>>,
}

impl OnceCall {
    fn new(f: OnceFn) -> Self {
        Self {
            inner: Mutex::new(Some(f)),
        }
    }

    fn spent() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    async fn call(&self) -> anyhow::Result<bool> {
        let f = self.inner.lock().take();
        match f {
            Some(f) => f().await,
            None => Ok(false),
        }
    }

    fn is_spent(&self) -> bool {
        self.inner.lock().is_none()
    }
}

/// One-shot handle removing a channel subscription at the transport.
///
/// Each handle owns exactly one registration: other registrations of the
/// same `(channel, inbox)` pair stay in place. Calling it more than once is
/// safe: only the first call reaches the transport, later calls return
/// `Ok(false)`.
pub struct Unsubscribe(OnceCall);

impl Unsubscribe {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<bool>> + Send + 'static,
    {
        Self(OnceCall::new(Box::new(f)))
    }

    /// Handle that does nothing. For transports without a subscriber directory.
    #[must_use]
    pub fn noop() -> Self {
        Self(OnceCall::spent())
    }

    /// Remove the subscription. Returns whether the transport removed anything.
    ///
    /// # Errors
    ///
    /// Returns the transport's error from the first call.
    pub async fn call(&self) -> anyhow::Result<bool> {
        self.0.call().await
    }

    /// Whether the handle has already been used.
    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.0.is_spent()
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// One-shot handle on a single consumer started by [`Transport::process`]
/// or [`Transport::process_group`].
///
/// Stopping it detaches only that consumer; other consumers of the same
/// inbox, attached by other nodes, keep receiving.
pub struct Consumer(OnceCall);

impl Consumer {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, anyhow::Result<bool>> + Send + 'static,
    {
        Self(OnceCall::new(Box::new(f)))
    }

    /// Handle that cannot stop anything. For backends whose consumers live
    /// outside the process.
    #[must_use]
    pub fn detached() -> Self {
        Self(OnceCall::spent())
    }

    /// Stop this consumer. Returns whether it was still running.
    ///
    /// # Errors
    ///
    /// Returns the transport's error from the first call.
    pub async fn stop(&self) -> anyhow::Result<bool> {
        self.0.call().await
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.0.is_spent()
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Pluggable queue backend.
///
/// Failures are reported as `anyhow::Error`; the router wraps them into
/// `BusError::Transport` with the inbox or channel involved.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append `envelope` to `inbox`. Each inbox delivers in enqueue order.
    async fn enqueue(&self, inbox: &str, envelope: Envelope) -> anyhow::Result<Ack>;

    /// Start delivering `inbox` to `handler`, one envelope at a time.
    ///
    /// Several consumers may be attached to one inbox; they compete for
    /// envelopes. The returned handle stops this consumer only.
    async fn process(&self, inbox: &str, handler: InboxHandler) -> anyhow::Result<Consumer>;

    /// Start delivering `inbox` with up to `concurrency` deliveries in flight.
    ///
    /// Backends without concurrent consumption fall back to [`Transport::process`].
    async fn process_group(
        &self,
        concurrency: usize,
        inbox: &str,
        handler: InboxHandler,
    ) -> anyhow::Result<Consumer> {
        let _ = concurrency;
        self.process(inbox, handler).await
    }

    /// Inboxes currently subscribed to `channel`.
    async fn get_subscribers(&self, channel: &str) -> anyhow::Result<Vec<String>>;

    /// Subscribe `inbox` to `channel`.
    ///
    /// The directory lists each pair once however often it is registered;
    /// the pair is dropped when the last returned handle is called.
    async fn register_subscriber(&self, channel: &str, inbox: &str) -> anyhow::Result<Unsubscribe>;

    /// Stop every consumer of `inbox`, whoever attached it. Returns whether
    /// anything was consuming it.
    async fn stop_processing(&self, inbox: &str) -> anyhow::Result<bool>;
}
