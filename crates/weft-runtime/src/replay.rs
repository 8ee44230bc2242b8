//! [`RunClient`] that plays back a recorded list of stream parts.
//!
//! Used by the `weft-replay` tool and by tests that need a deterministic server.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use weft_contract::{
    CreateThreadRequest, EventStream, JoinStreamRequest, RunClient, RunStream, RunStreamRequest,
    StreamPart, ThreadInfo, TransportError,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ReplayClient {
    parts: Arc<Vec<StreamPart>>,
    hold_open: bool,
    created: Arc<Mutex<Vec<CreateThreadRequest>>>,
    requests: Arc<Mutex<Vec<RunStreamRequest>>>,
}

impl ReplayClient {
    pub fn new(parts: Vec<StreamPart>) -> Self {
        Self {
            parts: Arc::new(parts),
            ..Self::default()
        }
    }

    /// Parse one `{"event", "data", "id"?}` object per non-empty line.
    pub fn from_jsonl(text: &str) -> Result<Self, ReplayError> {
        let mut parts = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let part = serde_json::from_str::<StreamPart>(line)
                .map_err(|source| ReplayError::Parse { line: idx + 1, source })?;
            parts.push(part);
        }
        Ok(Self::new(parts))
    }

    /// Keep the stream open after the last part until cancelled.
    #[must_use]
    pub fn hold_open(mut self, hold_open: bool) -> Self {
        self.hold_open = hold_open;
        self
    }

    pub fn parts(&self) -> &[StreamPart] {
        &self.parts
    }

    /// Every thread-creation request received so far.
    pub fn created_threads(&self) -> Vec<CreateThreadRequest> {
        self.created
            .lock()
            .expect("replay client mutex poisoned")
            .clone()
    }

    /// Every run request received so far.
    pub fn run_requests(&self) -> Vec<RunStreamRequest> {
        self.requests
            .lock()
            .expect("replay client mutex poisoned")
            .clone()
    }

    fn play(&self, parts: Vec<StreamPart>, cancel: CancellationToken) -> RunStream {
        let hold_open = self.hold_open;
        let events: EventStream = Box::pin(async_stream::stream! {
            for part in parts {
                if cancel.is_cancelled() {
                    yield Err(TransportError::Aborted);
                    return;
                }
                yield Ok(part);
                tokio::task::yield_now().await;
            }
            if hold_open {
                cancel.cancelled().await;
                yield Err(TransportError::Aborted);
            }
        });
        RunStream {
            run_id: Some(format!("run-{}", uuid::Uuid::now_v7().simple())),
            events,
        }
    }
}

#[async_trait]
impl RunClient for ReplayClient {
    async fn create_thread(&self, req: CreateThreadRequest) -> Result<ThreadInfo, TransportError> {
        let thread_id = req
            .thread_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let metadata = req.metadata.clone().unwrap_or_default();
        self.created
            .lock()
            .expect("replay client mutex poisoned")
            .push(req);
        Ok(ThreadInfo { thread_id, metadata })
    }

    async fn stream_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        req: RunStreamRequest,
        cancel: CancellationToken,
    ) -> Result<RunStream, TransportError> {
        tracing::debug!(thread_id, assistant_id, parts = self.parts.len(), "replaying run");
        self.requests
            .lock()
            .expect("replay client mutex poisoned")
            .push(req);
        Ok(self.play(self.parts.to_vec(), cancel))
    }

    /// Resumes after the part whose id equals the cursor. `"-1"` or an unknown cursor replays everything.
    async fn join_stream(
        &self,
        thread_id: &str,
        run_id: &str,
        req: JoinStreamRequest,
        cancel: CancellationToken,
    ) -> Result<RunStream, TransportError> {
        let cursor = req.last_event_id.as_deref().unwrap_or("-1");
        let start = self
            .parts
            .iter()
            .position(|part| part.id.as_deref() == Some(cursor))
            .map_or(0, |idx| idx + 1);
        tracing::debug!(thread_id, run_id, cursor, start, "joining replayed run");
        Ok(self.play(self.parts[start..].to_vec(), cancel))
    }
}
