//! Single-field rewrite of a JSON document, order preserving.
//!
//! The served OpenAPI document gets its `servers` entry replaced with the
//! configured base path. A conventional `serde_json::Map` round trip would
//! reorder sibling fields; parsing the top level into an insertion-ordered
//! map of raw values leaves every untouched field byte-for-byte intact.

use indexmap::IndexMap;
use serde_json::value::RawValue;

/// A JSON document whose top-level object keeps field insertion order and
/// stores untouched values as raw bytes.
pub type OrderedDoc = IndexMap<String, Box<RawValue>>;

/// Parse `doc`, set its top-level `key` to `value` (replacing in place or
/// appending at the end), and re-serialize.
pub fn set_field(
    doc: &str,
    key: &str,
    value: &serde_json::Value,
) -> Result<String, serde_json::Error> {
    let mut parsed: OrderedDoc = serde_json::from_str(doc)?;
    let raw = RawValue::from_string(serde_json::to_string(value)?)?;
    parsed.insert(key.to_string(), raw);
    serde_json::to_string(&parsed)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn preserves_sibling_order() {
        let doc = r#"{"openapi":"3.0.0","info":{"title":"t"},"servers":[{"url":"/"}],"paths":{}}"#;
        let out = set_field(doc, "servers", &json!([{"url": "/api/"}])).unwrap();
        assert_eq!(
            out,
            r#"{"openapi":"3.0.0","info":{"title":"t"},"servers":[{"url":"/api/"}],"paths":{}}"#
        );
    }

    #[test]
    fn appends_missing_field_last() {
        let doc = r#"{"z":1,"a":2}"#;
        let out = set_field(doc, "servers", &json!([])).unwrap();
        assert_eq!(out, r#"{"z":1,"a":2,"servers":[]}"#);
    }

    #[test]
    fn untouched_values_pass_through_verbatim() {
        // field order inside nested objects is part of the raw bytes
        let doc = r#"{"paths":{"/b":{},"/a":{}},"servers":[]}"#;
        let out = set_field(doc, "servers", &json!([{"url": "/x/"}])).unwrap();
        assert_eq!(out, r#"{"paths":{"/b":{},"/a":{}},"servers":[{"url":"/x/"}]}"#);
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(set_field("[1,2,3]", "servers", &json!([])).is_err());
        assert!(set_field("not json", "servers", &json!([])).is_err());
    }
}
