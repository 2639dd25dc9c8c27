//! Wire codec for CRDT update payloads.
//!
//! Older clients shipped three different representations of the same
//! logical bytes over the relay channel:
//!
//! - raw JSON byte array (`[1, 2, 3]`)
//! - base64 string (current canonical form)
//! - legacy numeric array from pre-1.0 clients (may contain out-of-range
//!   values when the payload was corrupted in transit)
//!
//! `decode` normalizes all of them to a canonical byte buffer; `encode`
//! always produces the base64 form. The codec is pure — a malformed shape
//! is a [`CodecError`] for the caller to log and drop, never a panic in
//! the hot path.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// A wire-safe representation of opaque update bytes.
///
/// Untagged: the JSON shape itself selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    /// Raw byte array (`[0..=255, ...]`).
    Raw(Vec<u8>),
    /// Base64-encoded string — the canonical encoding.
    Base64(String),
    /// Legacy numeric array; values above 255 are malformed.
    Legacy(Vec<u64>),
}

impl WireValue {
    /// Number of bytes this value decodes to, if well-formed.
    pub fn byte_len(&self) -> Option<usize> {
        match self {
            WireValue::Raw(b) => Some(b.len()),
            WireValue::Base64(s) => B64.decode(s).ok().map(|b| b.len()),
            WireValue::Legacy(v) => {
                if v.iter().all(|n| *n <= 255) {
                    Some(v.len())
                } else {
                    None
                }
            }
        }
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// Base64 payload failed to decode.
    InvalidBase64(String),
    /// Legacy array element does not fit in a byte.
    ValueOutOfRange(u64),
    /// Envelope JSON was unparseable or structurally wrong.
    MalformedEnvelope(String),
    /// Payload bytes did not decode as a CRDT update or state vector.
    InvalidUpdate(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidBase64(e) => write!(f, "Invalid base64 payload: {e}"),
            CodecError::ValueOutOfRange(v) => write!(f, "Legacy array value out of byte range: {v}"),
            CodecError::MalformedEnvelope(e) => write!(f, "Malformed envelope: {e}"),
            CodecError::InvalidUpdate(e) => write!(f, "Invalid update payload: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encode bytes to the canonical wire representation (base64).
pub fn encode(bytes: &[u8]) -> WireValue {
    WireValue::Base64(B64.encode(bytes))
}

/// Decode any accepted wire shape to a canonical byte buffer.
pub fn decode(value: &WireValue) -> Result<Vec<u8>, CodecError> {
    match value {
        WireValue::Raw(bytes) => Ok(bytes.clone()),
        WireValue::Base64(s) => B64
            .decode(s)
            .map_err(|e| CodecError::InvalidBase64(e.to_string())),
        WireValue::Legacy(values) => values
            .iter()
            .map(|n| u8::try_from(*n).map_err(|_| CodecError::ValueOutOfRange(*n)))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_roundtrip() {
        let bytes = vec![0u8, 1, 127, 255, 42];
        let wire = encode(&bytes);
        assert!(matches!(wire, WireValue::Base64(_)));
        assert_eq!(decode(&wire).unwrap(), bytes);
    }

    #[test]
    fn test_raw_shape_decodes() {
        let bytes = vec![9u8, 8, 7];
        let wire = WireValue::Raw(bytes.clone());
        assert_eq!(decode(&wire).unwrap(), bytes);
    }

    #[test]
    fn test_legacy_shape_decodes() {
        let wire = WireValue::Legacy(vec![0, 255, 128]);
        assert_eq!(decode(&wire).unwrap(), vec![0u8, 255, 128]);
    }

    #[test]
    fn test_all_shapes_equivalent() {
        let bytes = vec![10u8, 20, 30, 40];
        let canonical = encode(&bytes);
        let raw = WireValue::Raw(bytes.clone());
        let legacy = WireValue::Legacy(bytes.iter().map(|b| *b as u64).collect());

        assert_eq!(decode(&canonical).unwrap(), decode(&raw).unwrap());
        assert_eq!(decode(&canonical).unwrap(), decode(&legacy).unwrap());
    }

    #[test]
    fn test_legacy_out_of_range_rejected() {
        let wire = WireValue::Legacy(vec![1, 2, 300]);
        assert_eq!(decode(&wire), Err(CodecError::ValueOutOfRange(300)));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let wire = WireValue::Base64("not base64 !!!".to_string());
        assert!(matches!(decode(&wire), Err(CodecError::InvalidBase64(_))));
    }

    #[test]
    fn test_empty_payload() {
        let wire = encode(&[]);
        assert_eq!(decode(&wire).unwrap(), Vec::<u8>::new());
        assert_eq!(wire.byte_len(), Some(0));
    }

    #[test]
    fn test_json_shape_selection() {
        // Byte-range array deserializes as Raw
        let raw: WireValue = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(decode(&raw).unwrap(), vec![1u8, 2, 3]);

        // String deserializes as Base64
        let b64: WireValue = serde_json::from_str("\"AQID\"").unwrap();
        assert_eq!(decode(&b64).unwrap(), vec![1u8, 2, 3]);

        // Out-of-range array falls through to Legacy, then errors on decode
        let legacy: WireValue = serde_json::from_str("[1, 2, 999]").unwrap();
        assert!(matches!(legacy, WireValue::Legacy(_)));
        assert!(decode(&legacy).is_err());
    }

    #[test]
    fn test_byte_len() {
        assert_eq!(WireValue::Raw(vec![1, 2]).byte_len(), Some(2));
        assert_eq!(encode(&[1, 2, 3]).byte_len(), Some(3));
        assert_eq!(WireValue::Legacy(vec![500]).byte_len(), None);
    }
}
