//! Request/response correlation.
//!
//! Every outstanding request parks a oneshot waiter keyed by its message id.
//! Exactly one of three things settles it: the matching response, the
//! timeout timer, or [`CorrelationEngine::reset`]. The entry leaves the table
//! on that first transition, so anything arriving later finds nothing and is
//! dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use stellar_core::Envelope;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{BusError, Failure};

type Outcome = Result<Envelope, Failure>;

struct Pending {
    tx: oneshot::Sender<Outcome>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn settle(self, outcome: Outcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may have stopped waiting.
        let _ = self.tx.send(outcome);
    }
}

/// Inflight request table. Clones share the same table.
#[derive(Clone, Default)]
pub struct CorrelationEngine {
    inflight: Arc<Mutex<HashMap<String, Pending>>>,
}

/// Removes the entry if the caller stops waiting before it settles.
struct InflightGuard<'a> {
    engine: &'a CorrelationEngine,
    request_id: &'a str,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.engine.take(self.request_id) {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
    }
}

impl CorrelationEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn take(&self, request_id: &str) -> Option<Pending> {
        self.inflight.lock().remove(request_id)
    }

    /// Park a waiter for `envelope`, hand the envelope to `deliver`, and wait
    /// for the correlated response.
    ///
    /// `timeout_ms` of `None` waits without bound.
    ///
    /// # Errors
    ///
    /// - [`BusError::DuplicateCorrelation`] if the id is already in flight.
    /// - The delivery error if `deliver` fails.
    /// - [`BusError::Timeout`] if no response arrives in time.
    /// - [`BusError::Cancelled`] if the table is reset first.
    /// - The decoded remote error if the response is an error response. The
    ///   response itself is attached to the failure.
    pub async fn request<F, Fut>(
        &self,
        envelope: Envelope,
        timeout_ms: Option<u64>,
        deliver: F,
    ) -> Result<Envelope, Failure>
    where
        F: FnOnce(Envelope) -> Fut + Send,
        Fut: Future<Output = Result<(), BusError>> + Send,
    {
        let request_id = envelope.id().to_string();
        let (tx, rx) = oneshot::channel();
        {
            let mut inflight = self.inflight.lock();
            if inflight.contains_key(&request_id) {
                return Err(BusError::DuplicateCorrelation { request_id }.into());
            }
            let timer = timeout_ms.filter(|ms| *ms > 0).map(|ms| {
                let engine = self.clone();
                let id = request_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    engine.on_timeout(&id, ms);
                })
            });
            inflight.insert(request_id.clone(), Pending { tx, timer });
        }
        let _guard = InflightGuard {
            engine: self,
            request_id: &request_id,
        };

        deliver(envelope).await?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BusError::Cancelled {
                request_id: request_id.clone(),
            }
            .into()),
        }
    }

    /// Settle the waiter the response answers.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::MissingCorrelation`] if nothing is waiting for it:
    /// a duplicate or late response, or one for a timed-out or reset request.
    /// Callers log this; it never reaches a requester.
    pub fn on_response(&self, envelope: Envelope) -> Result<(), BusError> {
        let request_id = envelope.headers.request_id.clone().unwrap_or_default();
        let Some(pending) = self.take(&request_id) else {
            return Err(BusError::MissingCorrelation { request_id });
        };

        let outcome = if envelope.is_error() {
            Err(Failure::with_response(
                BusError::from_response(&envelope),
                envelope,
            ))
        } else {
            Ok(envelope)
        };
        pending.settle(outcome);
        Ok(())
    }

    /// Fail the waiter for `request_id` with a timeout.
    ///
    /// Returns `false` when it already settled; a timer racing a response is
    /// not an error.
    pub fn on_timeout(&self, request_id: &str, timeout_ms: u64) -> bool {
        let Some(pending) = self.take(request_id) else {
            return false;
        };
        debug!(request_id, timeout_ms, "request timed out");
        // Settling from the timer task itself: detach rather than abort.
        let _ = pending.tx.send(Err(BusError::Timeout {
            request_id: request_id.to_string(),
            timeout_ms,
        }
        .into()));
        true
    }

    /// Drop every waiter and its timer. Waiting callers observe
    /// [`BusError::Cancelled`]. Returns how many were pending.
    pub fn reset(&self) -> usize {
        let drained: Vec<Pending> = self.inflight.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        if count > 0 {
            info!(count, "dropped inflight requests on reset");
        }
        count
    }

    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.inflight.lock().contains_key(request_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for CorrelationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEngine")
            .field("inflight", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;
    use serde_json::json;
    use stellar_core::{ErrorBody, HeaderBuilder, HeaderOverrides, MessageType, StellarError};
    use tokio::time::Instant;

    use super::*;

    fn request(id: &str) -> Envelope {
        let headers = HeaderBuilder::new("node-a").build(
            HeaderOverrides {
                id: Some(id.to_string()),
                ..HeaderOverrides::default()
            }
            .kind(MessageType::Request),
            HeaderOverrides::default(),
        );
        Envelope::new(headers, json!({ "text": "hello" }))
    }

    type Deliver = Box<dyn FnOnce(Envelope) -> BoxFuture<'static, Result<(), BusError>> + Send>;

    /// Delivery that succeeds and reports the delivered envelope.
    fn delivered(tx: oneshot::Sender<Envelope>) -> Deliver {
        Box::new(move |envelope| {
            Box::pin(async move {
                let _ = tx.send(envelope);
                Ok(())
            })
        })
    }

    fn silent() -> Deliver {
        Box::new(|_envelope| Box::pin(async { Ok(()) }))
    }

    /// Start a request in the background; returns once the envelope was delivered.
    async fn start(
        engine: &CorrelationEngine,
        id: &str,
        timeout_ms: Option<u64>,
    ) -> (Envelope, JoinHandle<Result<Envelope, Failure>>) {
        let (tx, rx) = oneshot::channel();
        let engine = engine.clone();
        let envelope = request(id);
        let handle =
            tokio::spawn(async move { engine.request(envelope, timeout_ms, delivered(tx)).await });
        (rx.await.unwrap(), handle)
    }

    #[tokio::test]
    async fn response_resolves_waiter() {
        let engine = CorrelationEngine::new();
        let (sent, handle) = start(&engine, "r-1", Some(1_000)).await;
        assert!(engine.contains("r-1"));

        let response = HeaderBuilder::new("node-b").response(&sent.headers, json!("hi"));
        engine.on_response(response.clone()).unwrap();

        assert_eq!(handle.await.unwrap().unwrap(), response);
        assert!(engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_rejects_within_bound() {
        let engine = CorrelationEngine::new();
        let started = Instant::now();
        let failure = engine
            .request(request("r-slow"), Some(1_500), silent())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(1_500));
        assert!(elapsed < Duration::from_millis(1_600));
        let message = failure.to_string();
        assert!(message.contains("r-slow"));
        assert!(message.contains("1500"));
        assert!(matches!(failure.error, BusError::Timeout { .. }));
        assert!(engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn no_timeout_waits_indefinitely() {
        let engine = CorrelationEngine::new();
        let waiting = tokio::time::timeout(
            Duration::from_millis(3_000),
            engine.request(request("r-long"), None, silent()),
        )
        .await;
        assert!(waiting.is_err());
        // Dropping the caller's future removes its entry.
        assert!(engine.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_means_unbounded() {
        let engine = CorrelationEngine::new();
        let (_, handle) = start(&engine, "r-zero", Some(0)).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(engine.contains("r-zero"));
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected_while_inflight() {
        let engine = CorrelationEngine::new();
        let (sent, first) = start(&engine, "r-dup", None).await;

        let failure = engine
            .request(request("r-dup"), None, silent())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, BusError::DuplicateCorrelation { .. }));
        assert!(engine.contains("r-dup"));

        let response = HeaderBuilder::new("node-b").response(&sent.headers, json!(1));
        engine.on_response(response).unwrap();
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_dropped() {
        let engine = CorrelationEngine::new();
        let (sent, handle) = start(&engine, "r-late", Some(100)).await;
        let failure = handle.await.unwrap().unwrap_err();
        assert!(matches!(failure.error, BusError::Timeout { .. }));

        let late = HeaderBuilder::new("node-b").response(&sent.headers, json!("late"));
        assert!(matches!(
            engine.on_response(late),
            Err(BusError::MissingCorrelation { request_id }) if request_id == "r-late"
        ));
        assert!(!engine.on_timeout("r-late", 100));
    }

    #[tokio::test]
    async fn error_response_is_decoded() {
        let engine = CorrelationEngine::new();
        let (sent, handle) = start(&engine, "r-err", None).await;

        let mut error = StellarError::new("invalid");
        error.add_property_error("x", "poop");
        error.add_property_error("x", "pee");
        let response =
            HeaderBuilder::new("node-b").error_response(&sent.headers, "StellarError", &error.to_body());
        engine.on_response(response.clone()).unwrap();

        let failure = handle.await.unwrap().unwrap_err();
        assert!(matches!(&failure.error, BusError::Stellar(decoded) if *decoded == error));
        assert_eq!(failure.response, Some(response));
    }

    #[tokio::test]
    async fn generic_error_response_keeps_type_and_message() {
        let engine = CorrelationEngine::new();
        let (sent, handle) = start(&engine, "r-type", None).await;
        let response = HeaderBuilder::new("node-b").error_response(
            &sent.headers,
            "TypeError",
            &ErrorBody::message("bad"),
        );
        engine.on_response(response).unwrap();

        let failure = handle.await.unwrap().unwrap_err();
        assert_eq!(failure.to_string(), "TypeError: bad");
    }

    #[tokio::test]
    async fn reset_cancels_waiters() {
        let engine = CorrelationEngine::new();
        let (_, first) = start(&engine, "r-a", Some(60_000)).await;
        let (_, second) = start(&engine, "r-b", None).await;

        assert_eq!(engine.reset(), 2);
        assert!(engine.is_empty());
        for handle in [first, second] {
            let failure = handle.await.unwrap().unwrap_err();
            assert!(matches!(failure.error, BusError::Cancelled { .. }));
        }
    }

    #[tokio::test]
    async fn delivery_failure_clears_entry() {
        let engine = CorrelationEngine::new();
        let deliver: Deliver = Box::new(|_envelope| {
            Box::pin(async { Err(BusError::NoHandler { address: "svc".into() }) })
        });
        let failure = engine
            .request(request("r-fail"), Some(1_000), deliver)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, BusError::NoHandler { .. }));
        assert!(engine.is_empty());
    }
}
