//! Raw stream parts and their normalized classification.

use crate::ui::UiEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One `{event, data}` part as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPart {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Server-side event id, used as a resume cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl StreamPart {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            id: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Which flavor of `messages` event produced a message payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageSubtype {
    /// Token delta (`messages` / `messages-tuple`).
    #[default]
    Base,
    /// Whole-message replacement (`messages/partial`).
    Partial,
    /// Metadata-only update (`messages/metadata`).
    Metadata,
}

/// Result of classifying one stream part.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Message {
        subtype: MessageSubtype,
        payload: Value,
        received_at: u64,
    },
    Ui {
        payload: UiEvent,
        received_at: u64,
    },
    Values {
        payload: Value,
        received_at: u64,
    },
    Ignore {
        received_at: u64,
    },
}

impl NormalizedEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Ui { .. } => "ui",
            Self::Values { .. } => "values",
            Self::Ignore { .. } => "ignore",
        }
    }

    pub fn received_at(&self) -> u64 {
        match self {
            Self::Message { received_at, .. }
            | Self::Ui { received_at, .. }
            | Self::Values { received_at, .. }
            | Self::Ignore { received_at } => *received_at,
        }
    }

    pub fn is_ignore(&self) -> bool {
        matches!(self, Self::Ignore { .. })
    }
}

/// Stateless classifier from raw `(event, data)` pairs to [`NormalizedEvent`].
///
/// Implementations never fail: malformed payloads classify as `Ignore`.
pub trait StreamNormalizer: Send + Sync {
    fn normalize(&self, event: &str, data: Value) -> NormalizedEvent;
}

/// Structured error reported by the server or raised while consuming a stream.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct StreamError {
    pub name: String,
    pub message: String,
}

impl StreamError {
    pub const DEFAULT_NAME: &'static str = "StreamError";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Build from an `error` event payload: name is `name`, else `error`, else `StreamError`.
    pub fn from_payload(payload: &Value) -> Self {
        if let Value::String(message) = payload {
            return Self::new(Self::DEFAULT_NAME, message.clone());
        }
        let field = |key: &str| payload.get(key).and_then(Value::as_str).map(str::to_string);
        let name = field("name")
            .or_else(|| field("error"))
            .unwrap_or_else(|| Self::DEFAULT_NAME.to_string());
        let message = field("message").unwrap_or_default();
        Self { name, message }
    }
}
