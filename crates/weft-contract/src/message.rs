//! Serialized chat messages and chunk concatenation.
//!
//! Messages travel in the LangChain dictionary shape (`{type, id, content, ...}`).
//! Streaming deltas for the same id are folded together with [`Message::concat`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message kinds that can be accumulated as chunks.
pub const CHUNK_KINDS: &[&str] = &["human", "ai", "system", "tool", "function", "generic"];

const CHUNK_SUFFIX: &str = "MessageChunk";

fn empty_content() -> Value {
    Value::String(String::new())
}

/// A serialized message or message chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default = "empty_content")]
    pub content: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    pub fn new(kind: impl Into<String>, id: Option<String>, content: impl Into<Value>) -> Self {
        Self {
            kind: normalize_kind(&kind.into()),
            id,
            content: content.into(),
            extra: Map::new(),
        }
    }

    pub fn human(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new("human", Some(id.into()), Value::String(text.into()))
    }

    pub fn ai(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new("ai", Some(id.into()), Value::String(text.into()))
    }

    /// Coerce a wire payload into a message.
    ///
    /// Accepts a bare message object or a `[message, metadata]` tuple. Returns
    /// `None` when the payload has no object with a string `type`.
    pub fn from_value(payload: &Value) -> Option<Self> {
        let candidate = match payload {
            Value::Array(items) => items.first()?,
            other => other,
        };
        let obj = candidate.as_object()?;
        obj.get("type")?.as_str()?;
        let mut message: Message = serde_json::from_value(candidate.clone()).ok()?;
        message.kind = normalize_kind(&message.kind);
        if message.id.as_deref().is_some_and(str::is_empty) {
            message.id = None;
        }
        Some(message)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Whether this message can be accumulated with later deltas.
    pub fn is_chunk_kind(&self) -> bool {
        CHUNK_KINDS.contains(&self.kind.as_str())
    }

    /// Plain text of the content (string content, or concatenated text parts).
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        }
    }

    /// Concatenate a later delta onto this accumulated chunk.
    pub fn concat(&self, next: &Message) -> Message {
        let mut merged = self.clone();
        if next.id.is_some() {
            merged.id = next.id.clone();
        }
        merged.content = merge_content(&self.content, &next.content);
        for (key, value) in &next.extra {
            if value.is_null() {
                continue;
            }
            let combined = match (key.as_str(), merged.extra.get(key)) {
                ("tool_call_chunks", Some(Value::Array(prev))) => match value {
                    Value::Array(incoming) => Value::Array(merge_lists(prev, incoming)),
                    other => other.clone(),
                },
                ("additional_kwargs" | "response_metadata", Some(Value::Object(prev))) => {
                    match value {
                        Value::Object(incoming) => Value::Object(merge_dicts(prev, incoming)),
                        other => other.clone(),
                    }
                }
                _ => value.clone(),
            };
            merged.extra.insert(key.clone(), combined);
        }
        merged
    }
}

/// Map wire type names onto canonical kinds (`AIMessageChunk` -> `ai`, `user` -> `human`).
pub fn normalize_kind(raw: &str) -> String {
    let base = match raw.strip_suffix(CHUNK_SUFFIX) {
        Some(stripped) => stripped.to_ascii_lowercase(),
        None => raw.to_string(),
    };
    match base.as_str() {
        "user" => "human".to_string(),
        "assistant" => "ai".to_string(),
        "chat" => "generic".to_string(),
        _ => base,
    }
}

fn text_part(text: &str) -> Value {
    serde_json::json!({ "type": "text", "text": text })
}

fn merge_content(prev: &Value, next: &Value) -> Value {
    match (prev, next) {
        (Value::Null, other) | (other, Value::Null) => other.clone(),
        (Value::String(a), Value::String(b)) => Value::String(format!("{a}{b}")),
        (Value::Array(a), Value::Array(b)) => Value::Array(merge_lists(a, b)),
        (Value::String(a), Value::Array(b)) => {
            if a.is_empty() {
                Value::Array(b.clone())
            } else {
                Value::Array(merge_lists(&[text_part(a)], b))
            }
        }
        (Value::Array(a), Value::String(b)) => {
            let mut parts = a.clone();
            if !b.is_empty() {
                parts.push(text_part(b));
            }
            Value::Array(parts)
        }
        (_, other) => other.clone(),
    }
}

fn index_of(item: &Value) -> Option<i64> {
    item.get("index").and_then(Value::as_i64)
}

/// Merge two lists, folding elements that share an `index` field.
fn merge_lists(prev: &[Value], next: &[Value]) -> Vec<Value> {
    let mut merged = prev.to_vec();
    for item in next {
        let slot = index_of(item)
            .and_then(|idx| merged.iter().position(|existing| index_of(existing) == Some(idx)));
        match (slot, item) {
            (Some(pos), Value::Object(incoming)) => {
                if let Value::Object(existing) = &merged[pos] {
                    merged[pos] = Value::Object(merge_dicts(existing, incoming));
                } else {
                    merged[pos] = item.clone();
                }
            }
            _ => merged.push(item.clone()),
        }
    }
    merged
}

/// Recursive dict merge: strings concatenate, objects recurse, lists merge by index.
fn merge_dicts(prev: &Map<String, Value>, next: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = prev.clone();
    for (key, value) in next {
        if value.is_null() {
            continue;
        }
        let combined = match (merged.get(key), value) {
            (None | Some(Value::Null), _) => value.clone(),
            (Some(Value::String(_)), Value::String(_))
                if matches!(key.as_str(), "type" | "id" | "index") =>
            {
                continue;
            }
            (Some(Value::String(a)), Value::String(b)) => Value::String(format!("{a}{b}")),
            (Some(Value::Object(a)), Value::Object(b)) => Value::Object(merge_dicts(a, b)),
            (Some(Value::Array(a)), Value::Array(b)) => Value::Array(merge_lists(a, b)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}
