//! Shared test fixtures for crates that depend on `weft-contract`.
//!
//! Gated behind the `test-support` cargo feature so production builds are
//! unaffected. Enable via `[dev-dependencies] weft-contract = { ..., features = ["test-support"] }`.

use crate::event::StreamPart;
use crate::ui::{UiEvent, UiMessage};
use serde_json::{json, Value};

/// Serialized `AIMessageChunk` delta.
pub fn ai_chunk(id: &str, text: &str) -> Value {
    json!({"type": "AIMessageChunk", "id": id, "content": text})
}

/// Serialized full AI message.
pub fn ai(id: &str, text: &str) -> Value {
    json!({"type": "ai", "id": id, "content": text})
}

/// Serialized human message.
pub fn human(id: &str, text: &str) -> Value {
    json!({"type": "human", "id": id, "content": text})
}

pub fn ui_add(id: &str, name: &str, props: Value) -> UiEvent {
    UiEvent::Upsert(UiMessage::new(id, name, props))
}

pub fn ui_remove(id: &str) -> UiEvent {
    UiEvent::remove(id)
}

/// Interrupt payload without an explicit id (identity comes from its content hash).
pub fn interrupt(value: Value) -> Value {
    json!({ "value": value })
}

/// Interrupt payload with an explicit id.
pub fn interrupt_with_id(id: &str, value: Value) -> Value {
    json!({ "id": id, "value": value })
}

/// `values` state with the given messages and optional interrupts.
pub fn values_with(messages: Vec<Value>, interrupts: Option<Vec<Value>>) -> Value {
    let mut state = json!({ "messages": messages });
    if let Some(list) = interrupts {
        state["__interrupt__"] = Value::Array(list);
    }
    state
}

/// `messages` stream part carrying a `[chunk, metadata]` tuple.
pub fn messages_part(id: &str, text: &str) -> StreamPart {
    StreamPart::new(
        "messages",
        json!([ai_chunk(id, text), {"langgraph_node": "agent"}]),
    )
}

pub fn custom_part(event: &UiEvent) -> StreamPart {
    StreamPart::new(
        "custom",
        serde_json::to_value(event).unwrap_or(Value::Null),
    )
}

pub fn values_part(state: Value) -> StreamPart {
    StreamPart::new("values", state)
}
