//! Inbox address derivation.
//!
//! Inbox names are pure functions of a logical address, node id or group id.
//! They must match exactly across implementations, since two nodes only meet
//! at the transport through these strings:
//!
//! | Inbox                         | Name                              |
//! |-------------------------------|-----------------------------------|
//! | service request inbox         | `stlr:s:<service>:req`            |
//! | node response inbox           | `stlr:n:<nodeId>:responseInbox`   |
//! | node subscription inbox       | `stlr:n:<nodeId>:subscriptionInbox` |
//! | group subscription inbox      | `stlr:s:<groupId>:subscriptionInbox` |

/// Per-node inbox kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeInboxKind {
    /// Where correlated responses to this node's requests arrive.
    Response,
    /// Where individual (non-group) pub/sub deliveries arrive.
    Subscription,
}

impl NodeInboxKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Response => "responseInbox",
            Self::Subscription => "subscriptionInbox",
        }
    }
}

/// The service segment of an address: everything before the first `:`.
#[must_use]
pub fn service_name(address: &str) -> &str {
    address.split(':').next().unwrap_or(address)
}

/// Request inbox consumed by every handler of the address's service.
#[must_use]
pub fn service_inbox(address: &str) -> String {
    format!("stlr:s:{}:req", service_name(address))
}

#[must_use]
pub fn node_inbox(node_id: &str, kind: NodeInboxKind) -> String {
    format!("stlr:n:{node_id}:{}", kind.as_str())
}

/// Subscription inbox shared by all members of a subscription group.
#[must_use]
pub fn group_subscription_inbox(group_id: &str) -> String {
    format!("stlr:s:{group_id}:subscriptionInbox")
}
