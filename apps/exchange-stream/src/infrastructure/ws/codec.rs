//! Frame Codec
//!
//! Splits inbound text frames into decodable units.
//!
//! - A JSON object is one unit.
//! - A JSON array of objects is several units, kept in array order.
//! - A bare `pong` is heartbeat traffic and carries no unit.

use serde_json::Value;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// The frame is valid JSON but not an object or array of objects.
    #[error("invalid frame format: {0}")]
    InvalidFormat(String),
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedFrame {
    /// Raw heartbeat reply.
    Heartbeat,
    /// JSON objects, in arrival order.
    Units(Vec<Value>),
}

/// JSON codec for exchange text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is not JSON, or is JSON of the wrong shape.
    pub fn decode(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("pong") {
            return Ok(DecodedFrame::Heartbeat);
        }

        match serde_json::from_str::<Value>(trimmed)? {
            Value::Object(map) => Ok(DecodedFrame::Units(vec![Value::Object(map)])),
            Value::Array(items) => {
                if let Some(bad) = items.iter().find(|item| !item.is_object()) {
                    return Err(CodecError::InvalidFormat(format!(
                        "array element is not an object: {}",
                        preview(&bad.to_string())
                    )));
                }
                Ok(DecodedFrame::Units(items))
            }
            other => Err(CodecError::InvalidFormat(format!(
                "expected JSON object or array, got: {}",
                preview(&other.to_string())
            ))),
        }
    }

    /// Encode a value to a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(50)
        .map_or(text.len(), |(idx, _)| idx);
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_single_object() {
        let frame = JsonCodec::new()
            .decode(r#"{"event":"subscribe","arg":{"channel":"trades"}}"#)
            .unwrap();
        assert_eq!(
            frame,
            DecodedFrame::Units(vec![json!({"event":"subscribe","arg":{"channel":"trades"}})])
        );
    }

    #[test]
    fn decode_array_keeps_order() {
        let frame = JsonCodec::new()
            .decode(r#"[{"n":1},{"n":2},{"n":3}]"#)
            .unwrap();
        let DecodedFrame::Units(units) = frame else {
            panic!("expected units");
        };
        let order: Vec<_> = units.iter().map(|u| u["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn decode_bare_pong() {
        assert_eq!(JsonCodec::new().decode("pong\n").unwrap(), DecodedFrame::Heartbeat);
    }

    #[test]
    fn decode_rejects_scalars_and_garbage() {
        let codec = JsonCodec::new();
        assert!(matches!(codec.decode("42"), Err(CodecError::InvalidFormat(_))));
        assert!(matches!(codec.decode("[1,2]"), Err(CodecError::InvalidFormat(_))));
        assert!(matches!(codec.decode("{not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn encode_roundtrips_object() {
        let text = JsonCodec::new().encode(&json!({"op":"ping"})).unwrap();
        assert_eq!(text, r#"{"op":"ping"}"#);
    }
}
