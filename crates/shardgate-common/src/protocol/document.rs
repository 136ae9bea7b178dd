//! Documents
//!
//! The router never interprets most of the documents it relays, so they are
//! modelled as ordered JSON objects. Field order is significant (the first
//! field of a command names the command), which is why the workspace enables
//! `serde_json`'s `preserve_order` feature.

use serde_json::{Map, Value};

/// An ordered document.
pub type Document = Map<String, Value>;

/// Converts a JSON value into a document.
///
/// Non-object values produce an empty document; callers build documents with
/// `json!({...})` literals, so this only matters for malformed input.
///
/// # Example
///
/// ```
/// use shardgate_common::protocol::document::from_value;
/// use serde_json::json;
///
/// let doc = from_value(json!({"ping": 1}));
/// assert_eq!(doc.get("ping"), Some(&json!(1)));
/// ```
pub fn from_value(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Returns the name of the first field, which names a command.
pub fn first_key(doc: &Document) -> Option<&str> {
    doc.keys().next().map(String::as_str)
}

/// Reads a numeric field as `i64`, accepting integral doubles.
pub fn get_i64(doc: &Document, key: &str) -> Option<i64> {
    match doc.get(key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

pub fn get_str<'a>(doc: &'a Document, key: &str) -> Option<&'a str> {
    doc.get(key).and_then(Value::as_str)
}

pub fn get_document<'a>(doc: &'a Document, key: &str) -> Option<&'a Document> {
    doc.get(key).and_then(Value::as_object)
}

/// Interprets a field the way the server does for flags like `$explain`:
/// present and not false, null or zero.
pub fn is_truthy(doc: &Document, key: &str) -> bool {
    match doc.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(_) => true,
    }
}
