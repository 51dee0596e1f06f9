// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! Payload sanitization.
//!
//! Inputs, outputs and metadata are arbitrary user data. Before they are
//! stored on a span or trace they pass through [`to_payload`], which:
//!
//! - converts the value with `serde_json`, falling back to a descriptive
//!   string when serialization fails,
//! - replaces anything nested deeper than [`PayloadLimits::max_depth`] with
//!   [`DEPTH_MARKER`],
//! - replaces values whose encoded size exceeds [`PayloadLimits::max_bytes`]
//!   with a truncation envelope (`{"_truncated": true, ...}`).
//!
//! Nothing here returns an error: instrumentation must never change the
//! behavior of the code it observes.

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Replacement for values nested past the depth limit.
pub const DEPTH_MARKER: &str = "[max depth exceeded]";

/// Replacement for sensitive values.
pub const REDACTED: &str = "[REDACTED]";

/// Name fragments that mark an argument or key as sensitive.
pub const SENSITIVE_MARKERS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "key",
    "token",
    "auth",
    "credential",
];

// Room reserved for the envelope fields around the preview.
const ENVELOPE_OVERHEAD: usize = 96;

/// Size and depth ceilings applied to every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLimits {
    pub max_bytes: usize,
    pub max_depth: usize,
}

impl Default for PayloadLimits {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024,
            max_depth: 10,
        }
    }
}

/// Convert any serializable value into a bounded JSON payload.
pub fn to_payload<T>(value: &T, limits: PayloadLimits) -> Value
where
    T: Serialize + ?Sized,
{
    match serde_json::to_value(value) {
        Ok(v) => sanitize(v, limits),
        Err(e) => Value::String(format!("<not serializable: {}>", e)),
    }
}

/// Apply depth and size limits to an already-converted value.
pub fn sanitize(value: Value, limits: PayloadLimits) -> Value {
    let value = limit_depth(value, 0, limits.max_depth);
    truncate(value, limits.max_bytes)
}

/// Whether the truncation envelope was applied to this value.
pub fn is_truncated(value: &Value) -> bool {
    value
        .get("_truncated")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn limit_depth(value: Value, depth: usize, max_depth: usize) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) if depth >= max_depth => {
            Value::String(DEPTH_MARKER.to_string())
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| limit_depth(v, depth + 1, max_depth))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, limit_depth(v, depth + 1, max_depth)))
                .collect(),
        ),
        scalar => scalar,
    }
}

fn truncate(value: Value, max_bytes: usize) -> Value {
    let encoded = match serde_json::to_string(&value) {
        Ok(s) => s,
        Err(e) => return Value::String(format!("<not serializable: {}>", e)),
    };
    if encoded.len() <= max_bytes {
        return value;
    }

    let mut cut = max_bytes.saturating_sub(ENVELOPE_OVERHEAD);
    while cut > 0 && !encoded.is_char_boundary(cut) {
        cut -= 1;
    }

    json!({
        "_truncated": true,
        "originalBytes": encoded.len(),
        "preview": &encoded[..cut],
    })
}

/// Whether a parameter or key name looks like it carries a secret.
pub fn is_sensitive(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Replace values under sensitive keys, recursively.
pub fn redact_sensitive(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| {
                    if is_sensitive(&k) {
                        (k, Value::String(REDACTED.to_string()))
                    } else {
                        (k, redact_sensitive(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact_sensitive).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle"))
        }
    }

    #[test]
    fn test_small_payload_passes_through() {
        let v = to_payload(&json!({"a": 1, "b": [1, 2, 3]}), PayloadLimits::default());
        assert_eq!(v, json!({"a": 1, "b": [1, 2, 3]}));
        assert!(!is_truncated(&v));
    }

    #[test]
    fn test_unserializable_falls_back_to_string() {
        let v = to_payload(&Unserializable, PayloadLimits::default());
        let s = v.as_str().unwrap();
        assert!(s.starts_with("<not serializable"));
        assert!(s.contains("opaque handle"));
    }

    #[test]
    fn test_oversized_payload_is_marked() {
        let limits = PayloadLimits {
            max_bytes: 256,
            max_depth: 10,
        };
        let big = "x".repeat(10_000);
        let v = to_payload(&big, limits);
        assert!(is_truncated(&v));
        assert_eq!(v["originalBytes"], json!(10_002));
        assert!(serde_json::to_string(&v).unwrap().len() <= 256);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let limits = PayloadLimits {
            max_bytes: 128,
            max_depth: 10,
        };
        let v = to_payload(&"é".repeat(500), limits);
        assert!(is_truncated(&v));
        assert!(v["preview"].as_str().is_some());
    }

    #[test]
    fn test_depth_limit() {
        let limits = PayloadLimits {
            max_bytes: 1024,
            max_depth: 2,
        };
        let v = to_payload(&json!({"a": {"b": {"c": 1}}}), limits);
        assert_eq!(v, json!({"a": {"b": DEPTH_MARKER}}));
    }

    #[test]
    fn test_is_sensitive() {
        assert!(is_sensitive("password"));
        assert!(is_sensitive("api_key"));
        assert!(is_sensitive("AuthHeader"));
        assert!(is_sensitive("client_secret"));
        assert!(is_sensitive("refresh_token"));
        assert!(is_sensitive("credentials"));
        assert!(!is_sensitive("username"));
        assert!(!is_sensitive("query"));
    }

    #[test]
    fn test_redact_sensitive_nested() {
        let mut inner = BTreeMap::new();
        inner.insert("token", "abc");
        inner.insert("user", "ann");
        let v = redact_sensitive(json!({"config": inner, "list": [{"secret": 1}]}));
        assert_eq!(v["config"]["token"], json!(REDACTED));
        assert_eq!(v["config"]["user"], json!("ann"));
        assert_eq!(v["list"][0]["secret"], json!(REDACTED));
    }
}
