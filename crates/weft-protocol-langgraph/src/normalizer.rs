use serde_json::Value;
use weft_contract::{now_unix_millis, MessageSubtype, NormalizedEvent, StreamNormalizer, UiEvent};

/// Stream modes always requested in addition to the caller's.
pub const DEFAULT_STREAM_MODES: &[&str] = &["values", "messages", "custom"];

/// Events that are forwarded by the server but never stored.
pub const PASSTHROUGH_EVENTS: &[&str] = &["metadata", "debug", "checkpoints", "tasks", "events"];

/// Base family of an event name with subgraph and slash qualifiers removed.
///
/// `"messages/partial|agent"` -> `"messages"`, `"custom|tools"` -> `"custom"`.
pub fn event_family(event: &str) -> &str {
    let pipe_base = event.split('|').next().unwrap_or(event);
    pipe_base.split('/').next().unwrap_or(pipe_base)
}

pub fn is_error_event(event: &str) -> bool {
    event_family(event) == "error"
}

pub fn is_passthrough_event(event: &str) -> bool {
    PASSTHROUGH_EVENTS.contains(&event_family(event))
}

fn message_subtype(event: &str) -> MessageSubtype {
    if event.contains("/partial") {
        MessageSubtype::Partial
    } else if event.contains("/metadata") {
        MessageSubtype::Metadata
    } else {
        MessageSubtype::Base
    }
}

/// Classify one LangGraph stream part.
pub fn normalize_event(event: &str, data: Value) -> NormalizedEvent {
    let received_at = now_unix_millis();
    let family = event_family(event);

    if family.starts_with("messages") {
        return NormalizedEvent::Message {
            subtype: message_subtype(event),
            payload: data,
            received_at,
        };
    }

    if family.starts_with("custom") {
        return match UiEvent::from_value(&data) {
            Some(payload) => NormalizedEvent::Ui {
                payload,
                received_at,
            },
            None => {
                tracing::trace!(event, "custom event is not a ui directive");
                NormalizedEvent::Ignore { received_at }
            }
        };
    }

    if family == "values" {
        return NormalizedEvent::Values {
            payload: data,
            received_at,
        };
    }

    NormalizedEvent::Ignore { received_at }
}

/// [`StreamNormalizer`] for the LangGraph event naming scheme.
#[derive(Debug, Clone, Copy, Default)]
pub struct LangGraphNormalizer;

impl StreamNormalizer for LangGraphNormalizer {
    fn normalize(&self, event: &str, data: Value) -> NormalizedEvent {
        normalize_event(event, data)
    }
}
