//! Envelope serialization.
//!
//! JSON is the interoperable form. `MsgPack` uses named maps
//! (`rmp_serde::to_vec_named()`) so field names survive and the two forms
//! decode to the same envelope.

use crate::envelope::Envelope;

/// Errors from encoding or decoding an envelope.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("msgpack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("msgpack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
}

/// Wire encoding for envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    MsgPack,
}

impl Codec {
    /// Encode an envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the body contains values the format cannot represent.
    pub fn encode(self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        Ok(match self {
            Self::Json => serde_json::to_vec(envelope)?,
            Self::MsgPack => rmp_serde::to_vec_named(envelope)?,
        })
    }

    /// Decode an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a well-formed envelope.
    pub fn decode(self, bytes: &[u8]) -> Result<Envelope, CodecError> {
        Ok(match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::MsgPack => rmp_serde::from_slice(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::envelope::{Headers, MessageType};

    fn publish() -> Envelope {
        let mut headers = Headers::new("p-1", 1_700_000_000_000, "node-a", MessageType::Publish);
        headers.channel = Some("orders".to_string());
        Envelope::new(headers, json!({ "orderId": 7, "items": ["a", "b"] }))
    }

    #[test]
    fn json_and_msgpack_agree() {
        let envelope = publish();
        let from_json = Codec::Json.decode(&Codec::Json.encode(&envelope).unwrap()).unwrap();
        let from_msgpack = Codec::MsgPack
            .decode(&Codec::MsgPack.encode(&envelope).unwrap())
            .unwrap();
        assert_eq!(from_json, envelope);
        assert_eq!(from_msgpack, from_json);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(Codec::Json.decode(b"{not json"), Err(CodecError::Json(_))));
        assert!(Codec::MsgPack.decode(&[0xc1]).is_err());
    }
}
