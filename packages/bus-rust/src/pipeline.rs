//! Middleware pipeline.
//!
//! A pipeline is an ordered list of `(matcher, middleware)` entries ending in
//! one terminal step supplied by the facade (the actual send, or the actual
//! handler call). Each middleware gets the envelope and a [`Next`] handle; it
//! may call `next.run(..)` and transform the result, reply directly, or fail.
//!
//! For request-kind envelopes every step's result is settled before it is
//! handed back to the previous step: plain values become response envelopes,
//! and failures get a wire-ready error response attached. This keeps exactly
//! one response per request no matter how many layers catch and rethrow.

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use stellar_core::{Envelope, HeaderBuilder, HeaderOverrides, Headers};
use tracing::{info_span, Instrument};

use crate::error::{BusError, Failure};
use crate::transport::Ack;

/// Outcome of a pipeline step.
pub type PipelineResult = Result<Reply, Failure>;

/// Final step of a pipeline. It never calls further down the chain.
pub type Terminal = Arc<dyn Fn(Envelope) -> BoxFuture<'static, PipelineResult> + Send + Sync>;

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

/// Address predicate deciding whether a middleware runs for an envelope.
///
/// The address is `queueName`, falling back to `channel`.
#[derive(Debug, Clone)]
pub enum Matcher {
    Always,
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    #[must_use]
    pub fn exact(address: impl Into<String>) -> Self {
        Self::Exact(address.into())
    }

    /// Compile `pattern` once for all later dispatches.
    ///
    /// # Errors
    ///
    /// Returns the regex compile error for an invalid pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    /// Whether an envelope addressed to `address` passes this matcher.
    /// Envelopes without an address only pass [`Matcher::Always`].
    #[must_use]
    pub fn matches(&self, address: Option<&str>) -> bool {
        match self {
            Self::Always => true,
            Self::Exact(expected) => address == Some(expected.as_str()),
            Self::Regex(regex) => address.is_some_and(|address| regex.is_match(address)),
        }
    }
}

impl From<&str> for Matcher {
    fn from(address: &str) -> Self {
        Self::exact(address)
    }
}

// ---------------------------------------------------------------------------
// Reply
// ---------------------------------------------------------------------------

/// Successful result of a pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Envelope(Envelope),
    Body(Value),
    /// Per-inbox acknowledgments of a publish.
    Acks(Vec<Ack>),
    Empty,
}

impl Reply {
    /// The payload: an envelope's body, the value itself, or the acks as JSON.
    #[must_use]
    pub fn into_body(self) -> Value {
        match self {
            Self::Envelope(envelope) => envelope.body,
            Self::Body(body) => body,
            Self::Acks(acks) => serde_json::to_value(acks).unwrap_or_default(),
            Self::Empty => Value::Null,
        }
    }

    /// The response envelope, if this reply is one.
    #[must_use]
    pub fn as_response(&self) -> Option<&Envelope> {
        match self {
            Self::Envelope(envelope) if envelope.is_response() => Some(envelope),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// A pipeline interceptor.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, envelope: Envelope, next: Next) -> PipelineResult;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Envelope, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PipelineResult> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope, next: Next) -> PipelineResult {
        self(envelope, next).await
    }
}

struct TerminalStep(Terminal);

#[async_trait]
impl Middleware for TerminalStep {
    async fn handle(&self, envelope: Envelope, _next: Next) -> PipelineResult {
        (self.0)(envelope).await
    }
}

/// A registered middleware with its address matcher.
#[derive(Clone)]
pub struct MiddlewareEntry {
    pub matcher: Matcher,
    pub middleware: Arc<dyn Middleware>,
}

impl MiddlewareEntry {
    pub fn new(matcher: Matcher, middleware: impl Middleware) -> Self {
        Self {
            matcher,
            middleware: Arc::new(middleware),
        }
    }
}

impl std::fmt::Debug for MiddlewareEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareEntry")
            .field("matcher", &self.matcher)
            .finish_non_exhaustive()
    }
}

/// Middleware registered on a facade.
///
/// Registration swaps in a new list; pipelines built afterwards see it,
/// pipelines already built keep the list they were built with.
#[derive(Debug, Default)]
pub struct MiddlewareStack {
    entries: ArcSwap<Vec<MiddlewareEntry>>,
}

impl MiddlewareStack {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: MiddlewareEntry) {
        self.entries.rcu(|current| {
            let mut entries = Vec::clone(current);
            entries.push(entry.clone());
            entries
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<MiddlewareEntry> {
        self.entries.load().as_ref().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// CallOptions
// ---------------------------------------------------------------------------

/// Per-call options, visible to every middleware through [`Next::options`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Response timeout for this call. Overrides the node default; `0`
    /// waits forever.
    pub timeout_ms: Option<u64>,
    /// Send without waiting for a response.
    pub request_only: bool,
    /// Return the whole response envelope instead of its body.
    pub raw_response: bool,
    /// Header overrides for the outgoing envelope.
    pub headers: HeaderOverrides,
}

impl CallOptions {
    #[must_use]
    pub fn timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn request_only(mut self) -> Self {
        self.request_only = true;
        self
    }

    #[must_use]
    pub fn raw_response(mut self) -> Self {
        self.raw_response = true;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers = self.headers.header(name, value);
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A built middleware chain with its terminal step.
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<[MiddlewareEntry]>,
    responder: HeaderBuilder,
}

impl Pipeline {
    /// Chain `entries` in order, then `terminal`.
    ///
    /// `responder` stamps the responses and error responses produced while
    /// settling request-kind results.
    pub fn new(responder: HeaderBuilder, mut entries: Vec<MiddlewareEntry>, terminal: Terminal) -> Self {
        entries.push(MiddlewareEntry::new(Matcher::Always, TerminalStep(terminal)));
        Self {
            chain: entries.into(),
            responder,
        }
    }

    /// Number of steps, terminal included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    /// Run `envelope` through the chain.
    ///
    /// # Errors
    ///
    /// Returns the first failure no middleware recovered from. For request
    /// kinds the failure carries the error response to send back.
    pub async fn run(&self, envelope: Envelope, options: CallOptions) -> PipelineResult {
        let span = info_span!(
            "pipeline",
            address = envelope.address().unwrap_or_default(),
            kind = envelope.kind().as_str(),
            id = envelope.id(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        let next = Next {
            chain: Arc::clone(&self.chain),
            index: 0,
            options: Arc::new(options),
            responder: self.responder.clone(),
        };

        async move {
            let start = Instant::now();
            let result = next.run(envelope).await;
            let outcome = match &result {
                Ok(_) => "ok",
                Err(_) => "error",
            };
            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            let span = tracing::Span::current();
            span.record("duration_ms", duration_ms);
            span.record("outcome", outcome);
            result
        }
        .instrument(span)
        .await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.chain.len())
            .field("node_id", &self.responder.node_id())
            .finish()
    }
}

impl tower::Service<Envelope> for Pipeline {
    type Response = Reply;
    type Error = Failure;
    type Future = BoxFuture<'static, PipelineResult>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, envelope: Envelope) -> Self::Future {
        let pipeline = self.clone();
        Box::pin(async move { pipeline.run(envelope, CallOptions::default()).await })
    }
}

// ---------------------------------------------------------------------------
// Next
// ---------------------------------------------------------------------------

/// The rest of the chain after the current middleware.
#[derive(Clone)]
pub struct Next {
    chain: Arc<[MiddlewareEntry]>,
    index: usize,
    options: Arc<CallOptions>,
    responder: HeaderBuilder,
}

impl Next {
    #[must_use]
    pub fn options(&self) -> &CallOptions {
        &self.options
    }

    /// Run the next matching step with `envelope`.
    ///
    /// Steps whose matcher rejects the envelope's address are skipped.
    /// Running past the end of the chain fails with
    /// [`BusError::PipelineExhausted`].
    pub fn run(self, envelope: Envelope) -> BoxFuture<'static, PipelineResult> {
        Box::pin(async move {
            let step = self
                .chain
                .iter()
                .enumerate()
                .skip(self.index)
                .find(|(_, entry)| entry.matcher.matches(envelope.address()))
                .map(|(index, entry)| (index, Arc::clone(&entry.middleware)));
            let Some((index, middleware)) = step else {
                return Err(Failure::new(BusError::PipelineExhausted));
            };

            let request = envelope
                .kind()
                .expects_response()
                .then(|| envelope.headers.clone());
            let responder = self.responder.clone();
            let next = Self {
                index: index + 1,
                ..self
            };

            let result = middleware.handle(envelope, next).await;
            match request {
                Some(request) => settle(&responder, &request, result),
                None => result,
            }
        })
    }
}

impl std::fmt::Debug for Next {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("steps", &self.chain.len())
            .field("options", &self.options)
            .finish()
    }
}

/// Turn a step's result for `request` into exactly one response.
///
/// Success becomes a response envelope answering `request` unless it already
/// is one. A failure gets an error response attached: one stamped by another
/// node is relayed with its origin intact, anything else is rebuilt here.
fn settle(responder: &HeaderBuilder, request: &Headers, result: PipelineResult) -> PipelineResult {
    match result {
        Ok(reply) => {
            if let Some(response) = reply.as_response() {
                if response.headers.request_id.as_deref() == Some(request.id.as_str()) {
                    return Ok(reply);
                }
            }
            Ok(Reply::Envelope(responder.response(request, reply.into_body())))
        }
        Err(mut failure) => {
            let response = match failure.response.take() {
                Some(existing)
                    if existing.headers.request_id.as_deref() == Some(request.id.as_str())
                        || existing.error_origin() != responder.node_id() =>
                {
                    responder.relay_error(request, &existing)
                }
                _ => responder.error_response(
                    request,
                    failure.error.error_type(),
                    &failure.error.to_error_body(),
                ),
            };
            failure.response = Some(response);
            Err(failure)
        }
    }
}
