//! Call shapes over a node's shared router.
//!
//! [`RequestClient`] issues requests, [`RequestServer`] serves them and
//! [`PubSub`] publishes and subscribes. Each facade keeps its own middleware
//! stack; the router, and with it the registry and inflight table, is shared.

pub mod handler;
pub mod pubsub;
pub mod request;

pub use handler::RequestServer;
pub use pubsub::PubSub;
pub use request::RequestClient;

/// Verb suffix appended to an address by the CRUD helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Create,
    Update,
    Remove,
}

impl Verb {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Create => "create",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }

    /// `address` with this verb appended: `svc:user` becomes `svc:user:get`.
    #[must_use]
    pub fn address(self, address: &str) -> String {
        format!("{address}:{}", self.as_str())
    }
}
