//! Request handler and subscriber registry.
//!
//! One registry is shared (behind an `Arc`) by every facade of a node. It
//! enforces the registration invariants: one request handler per address and
//! one handler per `(channel, group)` pair. Every registration returns a key
//! carrying a unique token so removal only ever unbinds that exact entry,
//! even if the same address was re-registered in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use stellar_core::{service_name, Envelope, IdGenerator, UuidGenerator};
use tracing::{debug, warn};

use crate::error::BusError;
use crate::pipeline::PipelineResult;

/// Handler invoked with a delivered envelope.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, PipelineResult> + Send + Sync>;

/// Handle for a bound request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerKey {
    pub address: String,
    token: u64,
}

/// How a subscriber is addressed within its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    /// Broadcast subscriber with a generated subscription id.
    Individual(String),
    /// Load-shared subscriber identified by its group id.
    Group(String),
}

/// Handle for a bound subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberKey {
    pub channel: String,
    pub mode: SubscriptionMode,
    token: u64,
}

impl SubscriberKey {
    /// Subscription id: generated for individual subscribers, the group id
    /// for group subscribers.
    #[must_use]
    pub fn subscription_id(&self) -> &str {
        match &self.mode {
            SubscriptionMode::Individual(id) | SubscriptionMode::Group(id) => id,
        }
    }

    #[must_use]
    pub fn group(&self) -> Option<&str> {
        match &self.mode {
            SubscriptionMode::Individual(_) => None,
            SubscriptionMode::Group(group) => Some(group),
        }
    }
}

struct HandlerEntry {
    token: u64,
    handler: EnvelopeHandler,
}

struct SubscriberEntry {
    key: SubscriberKey,
    handler: EnvelopeHandler,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handler and subscriber tables of one node.
pub struct Registry {
    handlers: Mutex<HashMap<String, HandlerEntry>>,
    /// Per channel, subscribers in registration order.
    subscribers: Mutex<HashMap<String, Vec<SubscriberEntry>>>,
    ids: Arc<dyn IdGenerator>,
    next_token: AtomicU64,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ids(Arc::new(UuidGenerator))
    }

    /// Registry generating individual subscription ids from `ids`.
    #[must_use]
    pub fn with_ids(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            ids,
            next_token: AtomicU64::new(1),
        }
    }

    fn token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    // -- request handlers ---------------------------------------------------

    /// Bind `handler` to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateRegistration`] if `address` is already
    /// bound. The existing handler stays in place.
    pub fn register_request_handler(
        &self,
        address: &str,
        handler: EnvelopeHandler,
    ) -> Result<HandlerKey, BusError> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(address) {
            return Err(BusError::DuplicateRegistration {
                url: address.to_string(),
            });
        }
        let token = self.token();
        handlers.insert(address.to_string(), HandlerEntry { token, handler });
        Ok(HandlerKey {
            address: address.to_string(),
            token,
        })
    }

    /// Unbind the handler identified by `key`. Returns whether it was bound.
    pub fn remove_request_handler(&self, key: &HandlerKey) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.get(&key.address) {
            Some(entry) if entry.token == key.token => {
                handlers.remove(&key.address);
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn request_handler(&self, address: &str) -> Option<EnvelopeHandler> {
        self.handlers
            .lock()
            .get(address)
            .map(|entry| Arc::clone(&entry.handler))
    }

    /// Whether any handler is bound under `service`.
    #[must_use]
    pub fn has_service_handlers(&self, service: &str) -> bool {
        self.handlers
            .lock()
            .keys()
            .any(|address| service_name(address) == service)
    }

    // -- subscribers --------------------------------------------------------

    /// Bind an individual subscriber on `channel` under a fresh subscription id.
    pub fn register_subscriber(&self, channel: &str, handler: EnvelopeHandler) -> SubscriberKey {
        let key = SubscriberKey {
            channel: channel.to_string(),
            mode: SubscriptionMode::Individual(self.ids.next_id()),
            token: self.token(),
        };
        self.subscribers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(SubscriberEntry {
                key: key.clone(),
                handler,
            });
        key
    }

    /// Bind the handler of group `group` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::DuplicateRegistration`] if the group already has a
    /// handler on this channel.
    pub fn register_group_subscriber(
        &self,
        group: &str,
        channel: &str,
        handler: EnvelopeHandler,
    ) -> Result<SubscriberKey, BusError> {
        let mut subscribers = self.subscribers.lock();
        let entries = subscribers.entry(channel.to_string()).or_default();
        if entries.iter().any(|entry| entry.key.group() == Some(group)) {
            return Err(BusError::DuplicateRegistration {
                url: format!("{channel} (group {group})"),
            });
        }
        let key = SubscriberKey {
            channel: channel.to_string(),
            mode: SubscriptionMode::Group(group.to_string()),
            token: self.token(),
        };
        entries.push(SubscriberEntry {
            key: key.clone(),
            handler,
        });
        Ok(key)
    }

    /// Unbind the subscriber identified by `key`.
    ///
    /// Returns `true` when this removal left the channel without any
    /// subscriber and its entry was cleared.
    pub fn remove_subscriber(&self, key: &SubscriberKey) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(entries) = subscribers.get_mut(&key.channel) else {
            return false;
        };
        entries.retain(|entry| entry.key != *key);
        if entries.is_empty() {
            subscribers.remove(&key.channel);
            return true;
        }
        false
    }

    /// Number of individual subscribers on `channel`.
    #[must_use]
    pub fn individual_count(&self, channel: &str) -> usize {
        self.subscribers.lock().get(channel).map_or(0, |entries| {
            entries
                .iter()
                .filter(|entry| entry.key.group().is_none())
                .count()
        })
    }

    /// Whether any channel has an individual subscriber.
    #[must_use]
    pub fn has_individual_subscribers(&self) -> bool {
        self.subscribers
            .lock()
            .values()
            .flatten()
            .any(|entry| entry.key.group().is_none())
    }

    /// Whether `group` is subscribed to any channel.
    #[must_use]
    pub fn has_group(&self, group: &str) -> bool {
        self.subscribers
            .lock()
            .values()
            .flatten()
            .any(|entry| entry.key.group() == Some(group))
    }

    /// Deliver `envelope` to the subscribers of `channel`.
    ///
    /// With `group`, only that group's handler runs; a missing one is not an
    /// error (a delivery can race with unsubscribe). Without, every
    /// individual subscriber runs concurrently. Handler failures are logged.
    /// Returns how many handlers were invoked.
    pub async fn dispatch(&self, channel: &str, envelope: Envelope, group: Option<&str>) -> usize {
        let handlers: Vec<EnvelopeHandler> = {
            let subscribers = self.subscribers.lock();
            subscribers
                .get(channel)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|entry| entry.key.group() == group)
                        .map(|entry| Arc::clone(&entry.handler))
                        .collect()
                })
                .unwrap_or_default()
        };

        if handlers.is_empty() {
            debug!(channel, ?group, id = envelope.id(), "no subscriber for delivery");
            return 0;
        }

        let count = handlers.len();
        let results = join_all(handlers.into_iter().map(|handler| handler(envelope.clone()))).await;
        for failure in results.into_iter().filter_map(Result::err) {
            warn!(channel, ?group, error = %failure, "subscriber failed");
        }
        count
    }

    /// Clear both tables.
    pub fn reset(&self) {
        self.handlers.lock().clear();
        self.subscribers.lock().clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("handlers", &self.handlers.lock().len())
            .field("channels", &self.subscribers.lock().len())
            .finish_non_exhaustive()
    }
}
