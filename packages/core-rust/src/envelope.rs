//! The envelope: the header + body unit exchanged between nodes.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON form
//! matches the header names other nodes expect (`queueName`, `respondTo`,
//! `requestId`, ...). Headers that only appear contextually are `Option`s
//! and are omitted from the wire when absent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// The `type` header: what kind of exchange an envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Request,
    Response,
    Publish,
    Reactive,
    StopReactive,
    FireAndForget,
}

impl MessageType {
    /// Whether an envelope of this kind must produce exactly one correlated
    /// response (or error response).
    #[must_use]
    pub fn expects_response(self) -> bool {
        matches!(self, Self::Request | Self::Reactive)
    }

    /// Wire name of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Publish => "publish",
            Self::Reactive => "reactive",
            Self::StopReactive => "stopReactive",
            Self::FireAndForget => "fireAndForget",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

/// Envelope headers.
///
/// `id`, `timestamp`, `source` and `type` are always present. The remaining
/// fields depend on the exchange: requests carry `queueName` and usually
/// `respondTo`, responses carry `requestId`, publishes carry `channel`, and
/// error responses add `errorType` / `errorSource`. Unknown headers survive
/// a decode/encode cycle through `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Headers {
    /// Message id, unique within the originating process.
    pub id: String,

    /// Creation time in milliseconds since Unix epoch.
    pub timestamp: u64,

    /// Id of the node that built this envelope.
    pub source: String,

    #[serde(rename = "type")]
    pub kind: MessageType,

    /// Target resource address (`service:resource:verb`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub queue_name: Option<String>,

    /// Inbox the correlated response must be sent to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub respond_to: Option<String>,

    /// On responses, the `id` of the originating request.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,

    /// Pub/sub topic.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_source: Option<String>,

    /// Per-call response timeout in milliseconds; `0` means unbounded.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_timeout: Option<u64>,

    /// Headers this crate does not interpret (trace ids, user metadata, ...).
    #[serde(flatten, default)]
    pub extra: Map<String, Value>,
}

impl Headers {
    /// Minimal headers with every contextual field unset.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        timestamp: u64,
        source: impl Into<String>,
        kind: MessageType,
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            source: source.into(),
            kind,
            queue_name: None,
            respond_to: None,
            request_id: None,
            channel: None,
            error_type: None,
            error_source: None,
            request_timeout: None,
            extra: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A message: headers plus an opaque JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub headers: Headers,
    #[serde(default)]
    pub body: Value,
}

impl Envelope {
    #[must_use]
    pub fn new(headers: Headers, body: Value) -> Self {
        Self { headers, body }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.headers.id
    }

    #[must_use]
    pub fn kind(&self) -> MessageType {
        self.headers.kind
    }

    /// The logical address middleware patterns match against: `queueName`
    /// for requests, `channel` for publishes.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        self.headers
            .queue_name
            .as_deref()
            .or(self.headers.channel.as_deref())
    }

    /// Whether this is a response envelope.
    #[must_use]
    pub fn is_response(&self) -> bool {
        self.headers.kind == MessageType::Response
    }

    /// Whether this is an error response (carries `errorType`).
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.headers.error_type.is_some()
    }

    /// The node that stamped this envelope as an error, falling back to the
    /// envelope source.
    #[must_use]
    pub fn error_origin(&self) -> &str {
        self.headers
            .error_source
            .as_deref()
            .unwrap_or(&self.headers.source)
    }
}
