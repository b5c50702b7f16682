//! Header construction for outgoing envelopes and responses.
//!
//! Headers are merged in priority order: explicit per-call overrides, then
//! caller-supplied defaults, then process defaults (fresh `id`,
//! `timestamp = now`, `source = node id`). Building is a pure transform; the
//! only state is the node identity plus injected clock and id sources.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::clock::{ClockSource, SystemClock};
use crate::envelope::{Envelope, Headers, MessageType};
use crate::error::ErrorBody;
use crate::id::{IdGenerator, UuidGenerator};

// ---------------------------------------------------------------------------
// HeaderOverrides
// ---------------------------------------------------------------------------

/// A partial header set. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderOverrides {
    pub id: Option<String>,
    pub timestamp: Option<u64>,
    pub source: Option<String>,
    pub kind: Option<MessageType>,
    pub queue_name: Option<String>,
    pub respond_to: Option<String>,
    pub request_id: Option<String>,
    pub channel: Option<String>,
    pub request_timeout: Option<u64>,
    pub extra: Map<String, Value>,
}

impl HeaderOverrides {
    #[must_use]
    pub fn kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    #[must_use]
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn respond_to(mut self, inbox: impl Into<String>) -> Self {
        self.respond_to = Some(inbox.into());
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout_ms: u64) -> Self {
        self.request_timeout = Some(timeout_ms);
        self
    }

    /// Set an uninterpreted header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    /// Field-wise merge: values in `self` win, gaps are filled from `fallback`.
    #[must_use]
    pub fn or(self, fallback: Self) -> Self {
        let mut extra = fallback.extra;
        extra.extend(self.extra);
        Self {
            id: self.id.or(fallback.id),
            timestamp: self.timestamp.or(fallback.timestamp),
            source: self.source.or(fallback.source),
            kind: self.kind.or(fallback.kind),
            queue_name: self.queue_name.or(fallback.queue_name),
            respond_to: self.respond_to.or(fallback.respond_to),
            request_id: self.request_id.or(fallback.request_id),
            channel: self.channel.or(fallback.channel),
            request_timeout: self.request_timeout.or(fallback.request_timeout),
            extra,
        }
    }
}

// ---------------------------------------------------------------------------
// HeaderBuilder
// ---------------------------------------------------------------------------

/// Builds headers stamped with this node's identity.
#[derive(Clone)]
pub struct HeaderBuilder {
    node_id: String,
    clock: Arc<dyn ClockSource>,
    ids: Arc<dyn IdGenerator>,
}

impl std::fmt::Debug for HeaderBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderBuilder")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl HeaderBuilder {
    /// Builder using the system clock and UUID ids.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(UuidGenerator),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// A fresh id from the configured generator.
    #[must_use]
    pub fn next_id(&self) -> String {
        self.ids.next_id()
    }

    /// Merge `overrides` over `defaults` over process defaults.
    ///
    /// `type` falls back to `request` when neither layer sets it.
    #[must_use]
    pub fn build(&self, overrides: HeaderOverrides, defaults: HeaderOverrides) -> Headers {
        let merged = overrides.or(defaults);
        Headers {
            id: merged.id.unwrap_or_else(|| self.ids.next_id()),
            timestamp: merged.timestamp.unwrap_or_else(|| self.clock.now()),
            source: merged.source.unwrap_or_else(|| self.node_id.clone()),
            kind: merged.kind.unwrap_or(MessageType::Request),
            queue_name: merged.queue_name,
            respond_to: merged.respond_to,
            request_id: merged.request_id,
            channel: merged.channel,
            error_type: None,
            error_source: None,
            request_timeout: merged.request_timeout,
            extra: merged.extra,
        }
    }

    /// Headers for a response to `request`.
    ///
    /// The response echoes the request's `id` as `requestId`, keeps its
    /// `queueName` so address patterns still match, and carries over
    /// uninterpreted headers such as trace ids.
    #[must_use]
    pub fn response_headers(&self, request: &Headers) -> Headers {
        let mut headers = Headers::new(
            self.ids.next_id(),
            self.clock.now(),
            self.node_id.clone(),
            MessageType::Response,
        );
        headers.request_id = Some(request.id.clone());
        headers.queue_name.clone_from(&request.queue_name);
        headers.extra.clone_from(&request.extra);
        headers
    }

    /// Successful response to `request` carrying `body`.
    #[must_use]
    pub fn response(&self, request: &Headers, body: Value) -> Envelope {
        Envelope::new(self.response_headers(request), body)
    }

    /// Error response to `request`, tagged with `error_type` and this node
    /// as `errorSource`.
    #[must_use]
    pub fn error_response(&self, request: &Headers, error_type: &str, body: &ErrorBody) -> Envelope {
        let mut headers = self.response_headers(request);
        headers.error_type = Some(error_type.to_string());
        headers.error_source = Some(self.node_id.clone());
        Envelope::new(headers, error_body_value(body))
    }

    /// Re-address an error response stamped by another node so it answers
    /// `request`.
    ///
    /// `errorType`, `errorSource` and the body are kept, so the error still
    /// names the node it came from. An error already addressed to `request`
    /// is returned unchanged.
    #[must_use]
    pub fn relay_error(&self, request: &Headers, error: &Envelope) -> Envelope {
        if error.headers.request_id.as_deref() == Some(request.id.as_str()) {
            return error.clone();
        }
        let mut headers = self.response_headers(request);
        headers.error_type.clone_from(&error.headers.error_type);
        headers.error_source = Some(error.error_origin().to_string());
        Envelope::new(headers, error.body.clone())
    }
}

fn error_body_value(body: &ErrorBody) -> Value {
    let mut map = Map::new();
    map.insert("message".to_string(), Value::String(body.message.clone()));
    if let Some(errors) = &body.errors {
        let errors = errors
            .iter()
            .map(|(property, messages)| {
                let messages = messages.iter().cloned().map(Value::String).collect();
                (property.clone(), Value::Array(messages))
            })
            .collect();
        map.insert("errors".to_string(), Value::Object(errors));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::FixedClock;
    use crate::error::StellarError;
    use crate::id::SequentialGenerator;

    fn builder() -> HeaderBuilder {
        HeaderBuilder::new("node-a")
            .with_clock(Arc::new(FixedClock(1_000)))
            .with_ids(Arc::new(SequentialGenerator::new("m")))
    }

    #[test]
    fn process_defaults_fill_gaps() {
        let headers = builder().build(HeaderOverrides::default(), HeaderOverrides::default());
        assert_eq!(headers.id, "m-1");
        assert_eq!(headers.timestamp, 1_000);
        assert_eq!(headers.source, "node-a");
        assert_eq!(headers.kind, MessageType::Request);
    }

    #[test]
    fn overrides_beat_defaults() {
        let defaults = HeaderOverrides::default()
            .queue_name("svc:a:get")
            .header("traceId", "t-default")
            .header("tenant", "acme");
        let overrides = HeaderOverrides::default()
            .queue_name("svc:b:get")
            .header("traceId", "t-call");

        let headers = builder().build(overrides, defaults);
        assert_eq!(headers.queue_name.as_deref(), Some("svc:b:get"));
        assert_eq!(headers.extra["traceId"], "t-call");
        assert_eq!(headers.extra["tenant"], "acme");
    }

    #[test]
    fn explicit_id_and_source_are_kept() {
        let overrides = HeaderOverrides {
            id: Some("fixed".to_string()),
            source: Some("node-z".to_string()),
            ..HeaderOverrides::default()
        };
        let headers = builder().build(overrides, HeaderOverrides::default());
        assert_eq!(headers.id, "fixed");
        assert_eq!(headers.source, "node-z");
    }

    #[test]
    fn response_echoes_request_id() {
        let b = builder();
        let request = Envelope::new(
            b.build(
                HeaderOverrides::default().queue_name("svc:a:get").header("traceId", "t1"),
                HeaderOverrides::default(),
            ),
            json!({}),
        );
        let response = b.response(&request.headers, json!({ "ok": true }));
        assert_eq!(response.headers.kind, MessageType::Response);
        assert_eq!(response.headers.request_id.as_deref(), Some(request.id()));
        assert_ne!(response.id(), request.id());
        assert_eq!(response.headers.queue_name.as_deref(), Some("svc:a:get"));
        assert_eq!(response.headers.extra["traceId"], "t1");
        assert!(!response.is_error());
    }

    #[test]
    fn error_response_is_tagged() {
        let b = builder();
        let request = Envelope::new(
            b.build(HeaderOverrides::default(), HeaderOverrides::default()),
            Value::Null,
        );
        let mut err = StellarError::new("invalid");
        err.add_property_error("x", "poop");

        let response = b.error_response(&request.headers, "StellarError", &err.to_body());
        assert_eq!(response.headers.error_type.as_deref(), Some("StellarError"));
        assert_eq!(response.headers.error_source.as_deref(), Some("node-a"));
        assert_eq!(
            response.body,
            json!({ "message": "invalid", "errors": { "x": ["poop"] } })
        );
    }

    #[test]
    fn relayed_error_keeps_origin_but_answers_new_request() {
        let remote = HeaderBuilder::new("node-b");
        let local = builder();

        let inner_request = local.build(HeaderOverrides::default(), HeaderOverrides::default());
        let remote_error = remote.error_response(
            &inner_request,
            "StellarError",
            &ErrorBody::message("nope"),
        );

        let outer_request = local.build(HeaderOverrides::default(), HeaderOverrides::default());
        let relayed = local.relay_error(&outer_request, &remote_error);
        assert_eq!(relayed.headers.request_id.as_deref(), Some(outer_request.id.as_str()));
        assert_eq!(relayed.headers.error_type.as_deref(), Some("StellarError"));
        assert_eq!(relayed.error_origin(), "node-b");
        assert_eq!(relayed.body, remote_error.body);

        // Already answering the outer request: untouched.
        assert_eq!(local.relay_error(&outer_request, &relayed), relayed);
    }
}
