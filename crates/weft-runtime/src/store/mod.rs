//! Authoritative in-memory reducer: thread id -> ordered block timeline.
//!
//! Every mutation appends a block the first time an entity id is seen and afterwards
//! only updates content in place. Interrupts are the one exception to append-at-end:
//! they are spliced in after their anchor block, which never reorders existing blocks
//! relative to each other.

mod interrupt;
mod thread_state;


use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use weft_contract::{
    BlockKind, DefaultUiReducer, DisplayMode, InterruptRecord, MessageSubtype, NormalizedEvent,
    PersistedSnapshot, ThreadSnapshot, UiEvent, UiReducer,
};

use thread_state::ThreadState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("message has no id")]
    MissingMessageId,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unknown thread: {0}")]
    UnknownThread(String),

    #[error("unknown interrupt: {0}")]
    UnknownInterrupt(String),
}

pub struct Store {
    threads: HashMap<String, ThreadState>,
    display_mode: DisplayMode,
    ui_reducer: Arc<dyn UiReducer>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("threads", &self.threads.len())
            .field("display_mode", &self.display_mode)
            .finish_non_exhaustive()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            threads: HashMap::new(),
            display_mode: DisplayMode::default(),
            ui_reducer: Arc::new(DefaultUiReducer),
        }
    }

    #[must_use]
    pub fn with_ui_reducer(mut self, reducer: Arc<dyn UiReducer>) -> Self {
        self.ui_reducer = reducer;
        self
    }

    #[must_use]
    pub fn with_display_mode(mut self, mode: DisplayMode) -> Self {
        self.display_mode = mode;
        self
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        self.display_mode = mode;
    }

    fn ensure(&mut self, thread_id: &str) -> &mut ThreadState {
        self.threads.entry(thread_id.to_string()).or_default()
    }

    pub fn has_thread(&self, thread_id: &str) -> bool {
        self.threads.contains_key(thread_id)
    }

    pub fn thread_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.threads.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Drop all in-memory state for a thread.
    pub fn forget(&mut self, thread_id: &str) -> bool {
        self.threads.remove(thread_id).is_some()
    }

    /// Dispatch a normalized event to the matching mutation.
    pub fn apply(&mut self, thread_id: &str, event: &NormalizedEvent) -> Result<(), StoreError> {
        match event {
            NormalizedEvent::Message {
                subtype, payload, ..
            } => self.apply_message(thread_id, payload, *subtype),
            NormalizedEvent::Ui { payload, .. } => {
                self.apply_ui(thread_id, payload);
                Ok(())
            }
            NormalizedEvent::Values { payload, .. } => {
                self.apply_values(thread_id, payload);
                Ok(())
            }
            NormalizedEvent::Ignore { .. } => Ok(()),
        }
    }

    /// Merge a serialized message or chunk into the thread.
    ///
    /// Payloads without a derivable id are rejected with [`StoreError::MissingMessageId`]
    /// and leave the thread untouched.
    pub fn apply_message(
        &mut self,
        thread_id: &str,
        payload: &Value,
        subtype: MessageSubtype,
    ) -> Result<(), StoreError> {
        let mode = self.display_mode;
        let result = self.ensure(thread_id).apply_message(payload, subtype, mode);
        if let Err(ref e) = result {
            tracing::warn!(thread_id, error = %e, "dropping message event");
        }
        result
    }

    pub fn apply_ui(&mut self, thread_id: &str, event: &UiEvent) {
        let reducer = self.ui_reducer.clone();
        self.ensure(thread_id).apply_ui(event, reducer.as_ref());
    }

    /// Upsert messages and UI from a full-state payload, revealing every message.
    pub fn apply_values(&mut self, thread_id: &str, state: &Value) {
        let interrupts = self.ensure(thread_id).apply_values(state);
        for payload in interrupts {
            self.apply_interrupt(thread_id, &payload);
        }
    }

    /// Record an interrupt, inserting its block on first sight. Returns the interrupt id.
    pub fn apply_interrupt(&mut self, thread_id: &str, payload: &Value) -> String {
        self.ensure(thread_id).apply_interrupt(payload)
    }

    /// One-way completion. Accepts either the interrupt id or its block id.
    pub fn complete_interrupt(
        &mut self,
        thread_id: &str,
        interrupt_id: &str,
        frozen_value: Option<Value>,
    ) -> Result<(), StoreError> {
        self.threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::UnknownThread(thread_id.to_string()))?
            .complete_interrupt(interrupt_id, frozen_value)
    }

    /// Interrupts anchored directly after the given message's block, in timeline order.
    pub fn interrupts_for_message(&self, thread_id: &str, message_id: &str) -> Vec<InterruptRecord> {
        self.threads
            .get(thread_id)
            .map(|state| state.interrupts_after_block(&BlockKind::Message.block_id(message_id)))
            .unwrap_or_default()
    }

    /// Insert a provisional message block that a later real message with the same id takes over.
    pub fn add_optimistic_block(&mut self, thread_id: &str, provisional: Value) -> String {
        self.ensure(thread_id).add_optimistic(provisional)
    }

    /// Materialized timeline. Unknown threads yield an empty snapshot.
    pub fn snapshot(&self, thread_id: &str) -> ThreadSnapshot {
        self.threads
            .get(thread_id)
            .map(ThreadState::snapshot)
            .unwrap_or_default()
    }

    /// Replace the thread's state with a persisted snapshot.
    pub fn hydrate(&mut self, thread_id: &str, persisted: &PersistedSnapshot) {
        self.threads
            .insert(thread_id.to_string(), ThreadState::from_persisted(persisted));
    }
}
