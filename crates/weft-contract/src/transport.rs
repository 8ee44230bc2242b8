//! Transport client seam: thread creation and run streaming.

use crate::event::{StreamError, StreamPart};
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("stream aborted")]
    Aborted,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Server(#[from] StreamError),
}

impl TransportError {
    /// Collapse into the structured form surfaced to callers.
    pub fn into_stream_error(self) -> StreamError {
        match self {
            Self::Server(err) => err,
            Self::Aborted => StreamError::new("AbortError", "stream aborted"),
            Self::Connection(message) => StreamError::new("ConnectionError", message),
            Self::Protocol(message) => StreamError::new("ProtocolError", message),
        }
    }
}

/// Boxed stream of parts produced by one run.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamPart, TransportError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub thread_id: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateThreadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Parameters for starting a run. Fields mirror the server's run-create payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_before: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_after: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multitask_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_disconnect: Option<String>,
    #[serde(default)]
    pub stream_mode: Vec<String>,
    #[serde(default)]
    pub stream_subgraphs: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinStreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<String>,
    #[serde(default)]
    pub stream_mode: Vec<String>,
}

/// An opened run stream.
pub struct RunStream {
    pub run_id: Option<String>,
    pub events: EventStream,
}

impl std::fmt::Debug for RunStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunStream")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

/// Server client that creates threads and streams runs.
///
/// Streams must end promptly once `cancel` fires, yielding `TransportError::Aborted`
/// or simply terminating.
#[async_trait]
pub trait RunClient: Send + Sync {
    async fn create_thread(&self, req: CreateThreadRequest) -> Result<ThreadInfo, TransportError>;

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        req: RunStreamRequest,
        cancel: CancellationToken,
    ) -> Result<RunStream, TransportError>;

    async fn join_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        req: JoinStreamRequest,
        cancel: CancellationToken,
    ) -> Result<RunStream, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_pass_through_unchanged() {
        let err = TransportError::from(StreamError::new("ValueError", "bad input"));
        assert_eq!(err.to_string(), "ValueError: bad input");
        assert_eq!(
            err.into_stream_error(),
            StreamError::new("ValueError", "bad input")
        );
    }

    #[test]
    fn connection_errors_get_a_name() {
        let err = TransportError::Connection("refused".into()).into_stream_error();
        assert_eq!(err.name, "ConnectionError");
        assert_eq!(err.message, "refused");
    }
}
