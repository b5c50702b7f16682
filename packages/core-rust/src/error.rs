//! Application error type and its wire shape.
//!
//! An error response carries `errorType` / `errorSource` headers and an
//! [`ErrorBody`]. A `StellarError` keeps its per-property `errors` map across
//! the wire; any other error is reduced to its message.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Wire name of [`StellarError`] in the `errorType` header.
pub const STELLAR_ERROR_TYPE: &str = "StellarError";

/// Application-level error with optional per-property validation messages.
#[derive(Debug, Clone, PartialEq, Eq, Default, thiserror::Error)]
#[error("{message}")]
pub struct StellarError {
    pub message: String,
    pub errors: BTreeMap<String, Vec<String>>,
}

impl StellarError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            errors: BTreeMap::new(),
        }
    }

    /// Record a validation message against `property`. Messages accumulate.
    pub fn add_property_error(&mut self, property: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(property.into())
            .or_default()
            .push(message.into());
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Wire body for this error.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            message: self.message.clone(),
            errors: self.has_errors().then(|| self.errors.clone()),
        }
    }
}

impl From<ErrorBody> for StellarError {
    fn from(body: ErrorBody) -> Self {
        Self {
            message: body.message,
            errors: body.errors.unwrap_or_default(),
        }
    }
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub errors: Option<BTreeMap<String, Vec<String>>>,
}

impl ErrorBody {
    /// Body carrying only a message (non-`StellarError` errors).
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            errors: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn property_errors_accumulate() {
        let mut err = StellarError::new("invalid");
        assert!(!err.has_errors());
        err.add_property_error("x", "poop");
        err.add_property_error("x", "pee");
        assert_eq!(err.errors["x"], vec!["poop", "pee"]);
        assert_eq!(err.to_string(), "invalid");
    }

    #[test]
    fn body_omits_empty_errors() {
        let body = StellarError::new("boom").to_body();
        assert_eq!(serde_json::to_value(&body).unwrap(), json!({ "message": "boom" }));
    }

    #[test]
    fn body_restores_errors_map() {
        let mut err = StellarError::new("invalid");
        err.add_property_error("x", "poop");
        let wire = serde_json::to_value(err.to_body()).unwrap();
        assert_eq!(wire, json!({ "message": "invalid", "errors": { "x": ["poop"] } }));

        let body: ErrorBody = serde_json::from_value(wire).unwrap();
        assert_eq!(StellarError::from(body), err);
    }
}
