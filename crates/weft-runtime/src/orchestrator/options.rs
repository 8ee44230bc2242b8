use serde_json::Value;
use weft_contract::{RunStreamRequest, ThreadSnapshot};

use super::OrchestratorError;

/// Per-call options for [`super::StreamOrchestrator::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Client-generated thread id, adopted when no thread is active.
    pub thread_id: Option<String>,
    /// Message to show immediately. Defaults to the last human message in `input.messages`.
    pub optimistic_human_message: Option<Value>,
    /// Metadata for thread creation.
    pub thread_metadata: Option<Value>,
    pub config: Option<Value>,
    pub context: Option<Value>,
    pub command: Option<Value>,
    pub metadata: Option<Value>,
    pub interrupt_before: Option<Vec<String>>,
    pub interrupt_after: Option<Vec<String>>,
    pub multitask_strategy: Option<String>,
    pub on_disconnect: Option<String>,
    pub stream_mode: Vec<String>,
    pub stream_subgraphs: bool,
}

impl SubmitOptions {
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    #[must_use]
    pub fn with_optimistic_message(mut self, message: Value) -> Self {
        self.optimistic_human_message = Some(message);
        self
    }

    #[must_use]
    pub fn with_stream_mode(mut self, mode: impl Into<String>) -> Self {
        self.stream_mode.push(mode.into());
        self
    }

    pub(super) fn into_request(self, input: Value, stream_mode: Vec<String>) -> RunStreamRequest {
        RunStreamRequest {
            input: (!input.is_null()).then_some(input),
            config: self.config,
            context: self.context,
            command: self.command,
            interrupt_before: self.interrupt_before,
            interrupt_after: self.interrupt_after,
            metadata: self.metadata,
            multitask_strategy: self.multitask_strategy,
            on_disconnect: self.on_disconnect,
            stream_mode,
            stream_subgraphs: self.stream_subgraphs,
        }
    }
}

/// Per-call options for [`super::StreamOrchestrator::join_stream`].
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    pub stream_mode: Vec<String>,
}

/// Union of the configured defaults and the caller's modes, defaults first, no duplicates.
pub fn merge_stream_modes(defaults: &[String], requested: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(defaults.len() + requested.len());
    for mode in defaults.iter().chain(requested) {
        if !merged.contains(mode) {
            merged.push(mode.clone());
        }
    }
    merged
}

/// Lifecycle callbacks for runs driven by the orchestrator.
pub trait RunObserver: Send + Sync {
    /// The active thread id was adopted or replaced by the server-issued one.
    fn on_thread_id(&self, _thread_id: &str) {}

    /// A run stream was opened.
    fn on_created(&self, _thread_id: &str, _run_id: Option<&str>) {}

    fn on_error(&self, _error: &OrchestratorError) {}

    /// A run finished without error. Receives the thread's snapshot after all mutations applied.
    fn on_finish(&self, _thread_id: &str, _snapshot: &ThreadSnapshot) {}
}
