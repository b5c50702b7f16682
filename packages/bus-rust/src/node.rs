//! A messaging node: one router shared by every facade handed out.

use std::sync::Arc;

use stellar_core::{ClockSource, IdGenerator};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::facade::{PubSub, RequestClient, RequestServer};
use crate::routing::QueueRouter;
use crate::transport::Transport;

/// Owns the node's router and hands out facades over it.
///
/// Every facade from the same node shares the registry and inflight table,
/// so a request sent by [`StellarNode::requests`] can be served by a handler
/// bound through [`StellarNode::handlers`] on the same node.
#[derive(Debug, Clone)]
pub struct StellarNode {
    router: Arc<QueueRouter>,
}

impl StellarNode {
    #[must_use]
    pub fn new(config: BusConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            router: Arc::new(QueueRouter::new(config, transport)),
        }
    }

    /// Node stamping envelopes from a custom clock and id source.
    #[must_use]
    pub fn with_sources(
        config: BusConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn ClockSource>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            router: Arc::new(QueueRouter::with_sources(config, transport, clock, ids)),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        self.router.node_id()
    }

    #[must_use]
    pub fn router(&self) -> &Arc<QueueRouter> {
        &self.router
    }

    #[must_use]
    pub fn requests(&self) -> RequestClient {
        RequestClient::new(Arc::clone(&self.router))
    }

    #[must_use]
    pub fn handlers(&self) -> RequestServer {
        RequestServer::new(Arc::clone(&self.router))
    }

    /// Broadcast publish/subscribe.
    #[must_use]
    pub fn pubsub(&self) -> PubSub {
        PubSub::new(Arc::clone(&self.router))
    }

    /// Publish/subscribe as a member of `group`.
    #[must_use]
    pub fn group(&self, group: impl Into<String>) -> PubSub {
        PubSub::with_group(Arc::clone(&self.router), group)
    }

    /// Clear handlers and subscribers and cancel inflight requests.
    pub fn reset(&self) {
        self.router.reset();
    }

    /// Stop consuming every inbox. Returns how many were released.
    ///
    /// # Errors
    ///
    /// Returns the first transport failure.
    pub async fn shutdown(&self) -> Result<usize, BusError> {
        self.router.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use stellar_core::{FixedClock, SequentialGenerator, StellarError};

    use super::*;
    use crate::pipeline::CallOptions;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn facades_share_one_router() {
        let node = StellarNode::new(
            BusConfig::with_node_id("n1"),
            Arc::new(MemoryTransport::new()),
        );
        assert_eq!(node.node_id(), "n1");
        node.handlers()
            .get("svc:ping", |_envelope| async { Ok::<_, StellarError>(json!("pong")) })
            .await
            .unwrap();

        let body = node
            .requests()
            .get("svc:ping", json!({}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(body, json!("pong"));
        assert!(node.router().registry().request_handler("svc:ping:get").is_some());
    }

    #[tokio::test]
    async fn custom_header_sources_are_used() {
        let node = StellarNode::with_sources(
            BusConfig::with_node_id("n1"),
            Arc::new(MemoryTransport::new()),
            Arc::new(FixedClock(42)),
            Arc::new(SequentialGenerator::new("seq")),
        );
        node.handlers()
            .get("svc:clock", |envelope: stellar_core::Envelope| async move {
                Ok::<_, StellarError>(json!({
                    "id": envelope.headers.id,
                    "timestamp": envelope.headers.timestamp,
                    "source": envelope.headers.source,
                }))
            })
            .await
            .unwrap();

        let body = node
            .requests()
            .get("svc:clock", json!({}), CallOptions::default())
            .await
            .unwrap();
        assert_eq!(body, json!({ "id": "seq-1", "timestamp": 42, "source": "n1" }));
        assert_eq!(node.router().headers().node_id(), node.node_id());
    }

    #[tokio::test]
    async fn reset_then_shutdown() {
        let node = StellarNode::new(
            BusConfig::with_node_id("n1"),
            Arc::new(MemoryTransport::new()),
        );
        node.pubsub()
            .subscribe("news", |_envelope| async { Ok::<_, StellarError>(()) })
            .await
            .unwrap();
        node.reset();
        assert!(!node.router().registry().has_individual_subscribers());
        assert_eq!(node.shutdown().await.unwrap(), 1);
    }
}
