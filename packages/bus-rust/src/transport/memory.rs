//! In-process transport.
//!
//! Every inbox is an unbounded FIFO that buffers until someone consumes it.
//! Consumers are tokio tasks; several consumers on one inbox compete for
//! envelopes, which gives group inboxes their load-sharing semantics inside
//! one process. Envelopes are encoded on enqueue and decoded on delivery, so
//! only envelopes that survive the wire codec travel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use stellar_core::{Codec, Envelope};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Ack, Consumer, InboxHandler, Transport, Unsubscribe};

type Receiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>>;
type Directory = DashMap<String, Vec<Registration>>;

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Queue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Receiver,
    consumers: parking_lot::Mutex<Vec<CancellationToken>>,
    enqueued: AtomicU64,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            consumers: parking_lot::Mutex::new(Vec::new()),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Cancel one consumer. Returns whether it was still attached.
    fn detach(&self, token: &CancellationToken) -> bool {
        token.cancel();
        let mut consumers = self.consumers.lock();
        let before = consumers.len();
        consumers.retain(|existing| !existing.is_cancelled());
        before != consumers.len()
    }
}

/// A `(channel, inbox)` directory entry with the number of live handles on it.
#[derive(Debug)]
struct Registration {
    inbox: String,
    handles: usize,
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

/// Transport backed by in-process channels.
///
/// Share one instance (behind an `Arc`) between every node that should be
/// able to reach the others.
#[derive(Debug)]
pub struct MemoryTransport {
    codec: Codec,
    queues: DashMap<String, Arc<Queue>>,
    subscribers: Arc<Directory>,
}

impl MemoryTransport {
    /// Transport encoding envelopes as JSON.
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(Codec::Json)
    }

    #[must_use]
    pub fn with_codec(codec: Codec) -> Self {
        Self {
            codec,
            queues: DashMap::new(),
            subscribers: Arc::new(DashMap::new()),
        }
    }

    /// Total envelopes ever enqueued to `inbox`.
    #[must_use]
    pub fn enqueued_count(&self, inbox: &str) -> u64 {
        self.queues
            .get(inbox)
            .map_or(0, |queue| queue.enqueued.load(Ordering::Relaxed))
    }

    /// Whether at least one consumer is attached to `inbox`.
    #[must_use]
    pub fn is_processing(&self, inbox: &str) -> bool {
        self.queues
            .get(inbox)
            .is_some_and(|queue| !queue.consumers.lock().is_empty())
    }

    fn queue(&self, inbox: &str) -> Arc<Queue> {
        Arc::clone(
            self.queues
                .entry(inbox.to_string())
                .or_insert_with(|| Arc::new(Queue::new()))
                .value(),
        )
    }

    fn spawn_consumer(&self, inbox: &str, concurrency: Option<usize>, handler: InboxHandler) -> Consumer {
        let queue = self.queue(inbox);
        let token = CancellationToken::new();
        queue.consumers.lock().push(token.clone());

        let limit = concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));
        tokio::spawn(consume(
            inbox.to_string(),
            self.codec,
            Arc::clone(&queue.rx),
            token.clone(),
            limit,
            handler,
        ));
        debug!(inbox, ?concurrency, "consumer started");

        Consumer::new(move || Box::pin(async move { Ok(queue.detach(&token)) }))
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv(rx: &AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    rx.lock().await.recv().await
}

/// Consumer loop. Without a limit each delivery is awaited before the next
/// one is taken, which keeps per-inbox order; with a limit deliveries run as
/// tasks holding a semaphore permit.
async fn consume(
    inbox: String,
    codec: Codec,
    rx: Receiver,
    token: CancellationToken,
    limit: Option<Arc<Semaphore>>,
    handler: InboxHandler,
) {
    loop {
        let permit = match &limit {
            Some(semaphore) => tokio::select! {
                biased;
                () = token.cancelled() => break,
                permit = Arc::clone(semaphore).acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break,
                },
            },
            None => None,
        };

        let bytes = tokio::select! {
            biased;
            () = token.cancelled() => break,
            bytes = recv(&rx) => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };

        let envelope = match codec.decode(&bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(inbox = %inbox, %error, "dropping undecodable envelope");
                continue;
            }
        };

        match permit {
            Some(permit) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    handler(envelope).await;
                    drop(permit);
                });
            }
            None => handler(envelope).await,
        }
    }
    debug!(inbox = %inbox, "consumer stopped");
}

/// Drop one handle on `(channel, inbox)`; the pair leaves the directory with
/// its last handle. Returns whether a handle was still registered.
fn remove_subscriber(directory: &Directory, channel: &str, inbox: &str) -> bool {
    let removed = match directory.get_mut(channel) {
        Some(mut registrations) => {
            let found = match registrations
                .iter_mut()
                .find(|registration| registration.inbox == inbox)
            {
                Some(registration) => {
                    registration.handles -= 1;
                    true
                }
                None => false,
            };
            registrations.retain(|registration| registration.handles > 0);
            found
        }
        None => false,
    };
    directory.remove_if(channel, |_, registrations| registrations.is_empty());
    removed
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn enqueue(&self, inbox: &str, envelope: Envelope) -> anyhow::Result<Ack> {
        let bytes = self.codec.encode(&envelope)?;
        let queue = self.queue(inbox);
        queue
            .tx
            .send(bytes)
            .map_err(|_| anyhow::anyhow!("inbox {inbox} is closed"))?;
        queue.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(Ack {
            inbox: inbox.to_string(),
            message_id: envelope.headers.id,
        })
    }

    async fn process(&self, inbox: &str, handler: InboxHandler) -> anyhow::Result<Consumer> {
        Ok(self.spawn_consumer(inbox, None, handler))
    }

    async fn process_group(
        &self,
        concurrency: usize,
        inbox: &str,
        handler: InboxHandler,
    ) -> anyhow::Result<Consumer> {
        Ok(self.spawn_consumer(inbox, Some(concurrency), handler))
    }

    async fn get_subscribers(&self, channel: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .subscribers
            .get(channel)
            .map(|registrations| {
                registrations
                    .iter()
                    .map(|registration| registration.inbox.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn register_subscriber(&self, channel: &str, inbox: &str) -> anyhow::Result<Unsubscribe> {
        {
            let mut registrations = self.subscribers.entry(channel.to_string()).or_default();
            match registrations
                .iter_mut()
                .find(|registration| registration.inbox == inbox)
            {
                Some(registration) => registration.handles += 1,
                None => registrations.push(Registration {
                    inbox: inbox.to_string(),
                    handles: 1,
                }),
            }
        }

        let directory = Arc::clone(&self.subscribers);
        let channel = channel.to_string();
        let inbox = inbox.to_string();
        Ok(Unsubscribe::new(move || {
            Box::pin(async move { Ok(remove_subscriber(&directory, &channel, &inbox)) })
        }))
    }

    async fn stop_processing(&self, inbox: &str) -> anyhow::Result<bool> {
        let Some(queue) = self.queues.get(inbox).map(|queue| Arc::clone(queue.value())) else {
            return Ok(false);
        };
        let consumers: Vec<CancellationToken> = queue.consumers.lock().drain(..).collect();
        for token in &consumers {
            token.cancel();
        }
        Ok(!consumers.is_empty())
    }
}
