//! LangGraph stream protocol support: event-name classification into normalized events.
#![allow(missing_docs)]

mod normalizer;

pub use normalizer::{
    event_family, is_error_event, is_passthrough_event, normalize_event, LangGraphNormalizer,
    DEFAULT_STREAM_MODES, PASSTHROUGH_EVENTS,
};
