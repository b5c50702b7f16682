/// Node-level configuration for the messaging runtime.
///
/// Controls node identity, default request timeouts and inbox consumer
/// concurrency.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Unique identifier for this node. Used as `source` on every envelope
    /// and to derive the node's response and subscription inboxes.
    pub node_id: String,
    /// Default response timeout in milliseconds. `None` or `Some(0)` waits
    /// forever. A `requestTimeout` header on the request wins over this.
    pub default_request_timeout_ms: Option<u64>,
    /// Deliveries processed at once on each service request inbox.
    pub handler_concurrency: usize,
    /// Deliveries processed at once on each group subscription inbox.
    pub group_concurrency: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            default_request_timeout_ms: Some(30_000),
            handler_concurrency: 1,
            group_concurrency: 1,
        }
    }
}

impl BusConfig {
    /// Default configuration with a fixed node id.
    #[must_use]
    pub fn with_node_id(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Self::default()
        }
    }

    /// Timeout to arm for a request carrying `header_timeout_ms`.
    ///
    /// Returns `None` when the request should wait without bound.
    #[must_use]
    pub fn effective_timeout_ms(&self, header_timeout_ms: Option<u64>) -> Option<u64> {
        header_timeout_ms
            .or(self.default_request_timeout_ms)
            .filter(|ms| *ms > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = BusConfig::default();
        assert!(!config.node_id.is_empty());
        assert_eq!(config.default_request_timeout_ms, Some(30_000));
        assert_eq!(config.handler_concurrency, 1);
        assert_eq!(config.group_concurrency, 1);
    }

    #[test]
    fn default_node_ids_are_unique() {
        assert_ne!(BusConfig::default().node_id, BusConfig::default().node_id);
    }

    #[test]
    fn header_timeout_overrides_default() {
        let config = BusConfig::with_node_id("n1");
        assert_eq!(config.effective_timeout_ms(None), Some(30_000));
        assert_eq!(config.effective_timeout_ms(Some(250)), Some(250));
        // 0 on the request means "wait forever", even with a default set.
        assert_eq!(config.effective_timeout_ms(Some(0)), None);
    }

    #[test]
    fn unbounded_default() {
        let config = BusConfig {
            default_request_timeout_ms: None,
            ..BusConfig::with_node_id("n1")
        };
        assert_eq!(config.effective_timeout_ms(None), None);
        assert_eq!(config.effective_timeout_ms(Some(10)), Some(10));
    }
}
