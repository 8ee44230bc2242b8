//! Generative-UI directives and the reducer contract that folds them into an ordered list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A UI widget record, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub props: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UiMessage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, props: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            props,
            metadata: None,
            extra: Map::new(),
        }
    }

    /// Whether an update for this record should shallow-merge props into the prior value.
    pub fn merges_props(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("merge"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Wire form, including `"type": "ui"`.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(UiEvent::Upsert(self.clone())).unwrap_or(Value::Null)
    }

    /// Parse a UI record from its wire form. The `type` tag is optional.
    pub fn from_value(value: &Value) -> Option<Self> {
        let mut obj = value.as_object()?.clone();
        match obj.remove("type") {
            None => {}
            Some(Value::String(tag)) if tag == "ui" => {}
            Some(_) => return None,
        }
        serde_json::from_value(Value::Object(obj)).ok()
    }
}

/// A UI directive from a `custom` event or a `values` snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    /// Add or update a widget.
    #[serde(rename = "ui")]
    Upsert(UiMessage),
    /// Delete a widget by id.
    #[serde(rename = "remove-ui")]
    Remove {
        id: String,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

impl UiEvent {
    pub fn remove(id: impl Into<String>) -> Self {
        Self::Remove {
            id: id.into(),
            extra: Map::new(),
        }
    }

    /// Parse a directive, returning `None` for any payload that is not UI-shaped.
    pub fn from_value(value: &Value) -> Option<Self> {
        let tag = value.get("type")?.as_str()?;
        if tag != "ui" && tag != "remove-ui" {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Upsert(msg) => &msg.id,
            Self::Remove { id, .. } => id,
        }
    }
}

/// Folds a UI directive into the prior ordered widget list.
///
/// Implementations must be pure: the output depends only on `prior` and `event`.
pub trait UiReducer: Send + Sync {
    fn reduce(&self, prior: Vec<UiMessage>, event: &UiEvent) -> Vec<UiMessage>;
}

/// Upsert-by-id with optional shallow props merge; remove deletes by id.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultUiReducer;

impl UiReducer for DefaultUiReducer {
    fn reduce(&self, mut prior: Vec<UiMessage>, event: &UiEvent) -> Vec<UiMessage> {
        match event {
            UiEvent::Remove { id, .. } => {
                prior.retain(|ui| &ui.id != id);
            }
            UiEvent::Upsert(next) => {
                match prior.iter().position(|ui| ui.id == next.id) {
                    Some(idx) => {
                        let mut replacement = next.clone();
                        if next.merges_props() {
                            replacement.props = shallow_merge(&prior[idx].props, &next.props);
                        }
                        prior[idx] = replacement;
                    }
                    None => prior.push(next.clone()),
                }
            }
        }
        prior
    }
}

fn shallow_merge(prev: &Value, next: &Value) -> Value {
    match (prev, next) {
        (Value::Object(a), Value::Object(b)) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => prev.clone(),
        _ => next.clone(),
    }
}
