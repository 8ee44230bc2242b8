use super::{Inner, OrchestratorError};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weft_contract::{EventStream, StreamError, TransportError};
use weft_protocol_langgraph::is_error_event;

/// Read a run stream to its end, enqueueing every relevant event on `thread_id`'s lane.
///
/// Cancellation ends the read cleanly. Ops already enqueued keep running.
pub(super) async fn consume_stream(
    inner: &Arc<Inner>,
    thread_id: &str,
    mut events: EventStream,
    cancel: &CancellationToken,
) -> Result<(), OrchestratorError> {
    tracing::debug!(thread_id, "stream opened");
    let mut enqueued = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!(thread_id, enqueued, "stream stopped");
                return Ok(());
            }
            next = events.next() => next,
        };
        let Some(part) = next else {
            break;
        };
        let part = match part {
            Ok(part) => part,
            Err(TransportError::Aborted) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if is_error_event(&part.event) {
            let err = StreamError::from_payload(&part.data);
            tracing::warn!(thread_id, error = %err, "server reported a stream error");
            return Err(OrchestratorError::Stream(err));
        }

        let event = inner.normalizer.normalize(&part.event, part.data);
        if event.is_ignore() {
            tracing::trace!(thread_id, event = %part.event, "ignoring stream event");
            continue;
        }
        tracing::trace!(thread_id, kind = event.kind(), "enqueueing stream event");
        inner.enqueue_event(thread_id, event);
        enqueued += 1;
    }
    tracing::debug!(thread_id, enqueued, "stream closed");
    Ok(())
}
