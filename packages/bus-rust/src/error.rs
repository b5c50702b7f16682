//! Error taxonomy for the messaging runtime.
//!
//! [`BusError`] is what callers see. [`Failure`] is what flows through the
//! middleware pipeline: the error plus, for request-kind envelopes, the
//! wire-ready error response that must be sent back in its place.

use stellar_core::{CodecError, Envelope, ErrorBody, StellarError, STELLAR_ERROR_TYPE};

/// Errors returned by registration, request, publish and transport calls.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("a handler is already registered for {url}")]
    DuplicateRegistration { url: String },

    #[error("request {request_id} is already in flight")]
    DuplicateCorrelation { request_id: String },

    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },

    #[error("request {request_id} was cancelled by reset")]
    Cancelled { request_id: String },

    #[error(transparent)]
    Stellar(#[from] StellarError),

    /// Error reconstructed from a remote error response that was not a
    /// `StellarError`. Only the type name and message survive the wire.
    #[error("{error_type}: {message}")]
    Remote { error_type: String, message: String },

    #[error("no inflight request for response {request_id}")]
    MissingCorrelation { request_id: String },

    #[error("middleware pipeline exhausted without a terminal step")]
    PipelineExhausted,

    #[error("no handler registered for {address}")]
    NoHandler { address: String },

    #[error("envelope {id} has no queueName")]
    MissingAddress { id: String },

    #[error("transport failure on {target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BusError {
    pub(crate) fn transport(target: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Transport {
            target: target.into(),
            source,
        }
    }

    /// Value of the `errorType` header when this error is sent over the wire.
    #[must_use]
    pub fn error_type(&self) -> &str {
        match self {
            Self::Stellar(_) => STELLAR_ERROR_TYPE,
            Self::Timeout { .. } => "TimeoutError",
            Self::DuplicateRegistration { .. } => "DuplicateRegistrationError",
            Self::Remote { error_type, .. } => error_type,
            _ => "Error",
        }
    }

    /// Wire body for this error. Only `StellarError` keeps its `errors` map.
    #[must_use]
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            Self::Stellar(err) => err.to_body(),
            Self::Remote { message, .. } => ErrorBody::message(message.clone()),
            other => ErrorBody::message(other.to_string()),
        }
    }

    /// Reconstruct the error carried by an error response.
    ///
    /// `errorType == "StellarError"` yields [`BusError::Stellar`] with its
    /// `errors` map restored; any other type yields [`BusError::Remote`].
    #[must_use]
    pub fn from_response(envelope: &Envelope) -> Self {
        let error_type = envelope
            .headers
            .error_type
            .clone()
            .unwrap_or_else(|| "Error".to_string());
        let body: ErrorBody = serde_json::from_value(envelope.body.clone()).unwrap_or_else(|_| {
            ErrorBody::message(
                envelope
                    .body
                    .as_str()
                    .map_or_else(|| envelope.body.to_string(), str::to_string),
            )
        });

        if error_type == STELLAR_ERROR_TYPE {
            Self::Stellar(StellarError::from(body))
        } else {
            Self::Remote {
                error_type,
                message: body.message,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Failure
// ---------------------------------------------------------------------------

/// A pipeline failure: the error plus the error response prepared for it.
///
/// `response` is filled by the pipeline for request-kind envelopes. When it
/// was stamped by another node (a remote error travelling back up through a
/// handler), it is relayed rather than rebuilt, so exactly one error
/// response leaves the node and it still names the node that failed.
#[derive(Debug)]
pub struct Failure {
    pub error: BusError,
    pub response: Option<Envelope>,
}

impl Failure {
    #[must_use]
    pub fn new(error: BusError) -> Self {
        Self {
            error,
            response: None,
        }
    }

    #[must_use]
    pub fn with_response(error: BusError, response: Envelope) -> Self {
        Self {
            error,
            response: Some(response),
        }
    }

    #[must_use]
    pub fn into_error(self) -> BusError {
        self.error
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<BusError> for Failure {
    fn from(error: BusError) -> Self {
        Self::new(error)
    }
}

impl From<StellarError> for Failure {
    fn from(error: StellarError) -> Self {
        Self::new(BusError::Stellar(error))
    }
}

impl From<anyhow::Error> for Failure {
    fn from(error: anyhow::Error) -> Self {
        Self::new(BusError::Internal(error))
    }
}
