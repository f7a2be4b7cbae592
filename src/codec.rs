// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codec
//!
//! Converts message payloads to bytes tagged with a content type and back.
//! Structured values travel as `application/json`, strings travel as raw
//! `text/plain`.

use crate::errors::AmqpError;
use serde_json::Value;
use tracing::error;

/// Content type for structured (JSON) payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for plain text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content encoding set on every published message
pub const CONTENT_ENCODING: &str = "UTF8";

/// An encoded payload ready to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed {
    pub data: Vec<u8>,
    pub content_type: &'static str,
}

/// Encodes a payload.
///
/// Objects, arrays and `null` are JSON encoded. Strings are sent as-is.
/// Numbers and booleans are stringified and tagged as `text/plain`, so a
/// receiver decodes them back as strings, not as numbers.
pub fn pack(value: &Value) -> Result<Packed, AmqpError> {
    match value {
        Value::String(text) => Ok(Packed {
            data: text.as_bytes().to_vec(),
            content_type: TEXT_CONTENT_TYPE,
        }),
        Value::Number(_) | Value::Bool(_) => Ok(Packed {
            data: value.to_string().into_bytes(),
            content_type: TEXT_CONTENT_TYPE,
        }),
        Value::Object(_) | Value::Array(_) | Value::Null => {
            let data = serde_json::to_vec(value).map_err(|err| {
                error!(error = err.to_string(), "failed pack data");
                AmqpError::SerializePayloadError
            })?;

            Ok(Packed {
                data,
                content_type: JSON_CONTENT_TYPE,
            })
        }
    }
}

/// Decodes a payload according to its content type.
///
/// Anything not tagged `application/json` is returned as a string.
pub fn unpack(data: &[u8], content_type: Option<&str>) -> Result<Value, AmqpError> {
    match content_type {
        Some(JSON_CONTENT_TYPE) => serde_json::from_slice(data).map_err(|err| {
            error!(error = err.to_string(), "failed unpack data");
            AmqpError::ParsePayloadError
        }),
        _ => Ok(Value::String(String::from_utf8_lossy(data).into_owned())),
    }
}

/// Renders a decoded payload as text: strings verbatim, everything else as
/// JSON.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn structured_values_roundtrip() {
        let value = json!({"x": 1, "tags": ["a", "b"], "nested": {"ok": true}});

        let packed = pack(&value).unwrap();
        assert_eq!(packed.content_type, JSON_CONTENT_TYPE);

        let decoded = unpack(&packed.data, Some(packed.content_type)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn strings_are_sent_raw() {
        let packed = pack(&json!("hello {not json")).unwrap();

        assert_eq!(packed.content_type, TEXT_CONTENT_TYPE);
        assert_eq!(packed.data, b"hello {not json");
        assert_eq!(
            unpack(&packed.data, Some(packed.content_type)).unwrap(),
            json!("hello {not json")
        );
    }

    #[test]
    fn primitives_are_stringified_as_text() {
        let packed = pack(&json!(42)).unwrap();
        assert_eq!(packed.content_type, TEXT_CONTENT_TYPE);
        assert_eq!(unpack(&packed.data, Some(packed.content_type)).unwrap(), json!("42"));

        let packed = pack(&json!(false)).unwrap();
        assert_eq!(packed.data, b"false");
    }

    #[test]
    fn malformed_json_is_an_error() {
        let res = unpack(b"{\"x\":", Some(JSON_CONTENT_TYPE));
        assert_eq!(res, Err(AmqpError::ParsePayloadError));
    }

    #[test]
    fn unknown_content_type_is_text() {
        assert_eq!(unpack(b"{}", None).unwrap(), json!("{}"));
        assert_eq!(unpack(b"{}", Some("application/xml")).unwrap(), json!("{}"));
    }
}
