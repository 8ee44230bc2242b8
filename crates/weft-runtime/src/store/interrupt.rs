//! Interrupt identity and anchoring hints.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

const ID_FIELDS: &[&str] = &["id", "interrupt_id"];
const ATTACHMENT_FIELDS: &[&str] = &["attachment_id", "attachmentId"];

fn string_field<'a>(value: &'a Value, fields: &[&str]) -> Option<&'a str> {
    fields
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}

/// Look up a field on the payload, then on its `value`.
fn lookup<'a>(payload: &'a Value, fields: &[&str]) -> Option<&'a str> {
    string_field(payload, fields).or_else(|| {
        payload
            .get("value")
            .and_then(|inner| string_field(inner, fields))
    })
}

/// Stable identity for an interrupt payload.
///
/// An explicit `id`/`interrupt_id` wins; otherwise the SHA-256 of the key-sorted JSON,
/// so redelivery of the same content collapses onto one record.
pub(crate) fn interrupt_id(payload: &Value) -> String {
    if let Some(id) = lookup(payload, ID_FIELDS) {
        return id.to_string();
    }
    let canonical = canonical_json(payload);
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

/// UI entity id the interrupt wants to be rendered after, if any.
pub(crate) fn attachment_id(payload: &Value) -> Option<&str> {
    lookup(payload, ATTACHMENT_FIELDS)
}

/// JSON text with object keys sorted at every depth.
pub(crate) fn canonical_json(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sorted(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
