//! Shared contracts for the conversation timeline: blocks and snapshots, stream
//! events, message chunk semantics, the UI reducer seam, and storage/transport traits.
#![allow(missing_docs)]

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub mod event;
pub mod message;
pub mod storage;
pub mod thread;
pub mod transport;
pub mod ui;

// thread
pub use thread::{
    gen_message_id, now_unix_millis, Block, BlockKind, DisplayMode, InterruptRecord,
    PersistedDocument, PersistedSnapshot, ThreadSnapshot, SCHEMA_VERSION,
};

// message
pub use message::{Message, CHUNK_KINDS};

// event
pub use event::{MessageSubtype, NormalizedEvent, StreamError, StreamNormalizer, StreamPart};

// ui
pub use ui::{DefaultUiReducer, UiEvent, UiMessage, UiReducer};

// storage
pub use storage::{KvBackend, KvError};

// transport
pub use transport::{
    CreateThreadRequest, EventStream, JoinStreamRequest, RunClient, RunStream, RunStreamRequest,
    ThreadInfo, TransportError,
};
