//! Conversation timeline runtime: the block store, the per-thread actor, the
//! snapshot cache, and the orchestrator that drives run streams through them.
#![allow(missing_docs)]

pub use weft_contract as contracts;

pub mod actor;
pub mod config;
pub mod orchestrator;
pub mod persistence;
pub mod replay;
pub mod store;

pub use actor::{StallNotice, StallPolicy, ThreadActor, DEFAULT_ACTOR_TIMEOUT, DEFAULT_LANE_IDLE};
pub use config::{ConfigError, WeftConfig};
pub use orchestrator::{
    merge_stream_modes, JoinOptions, OrchestratorError, RunObserver, StreamOrchestrator,
    StreamOrchestratorBuilder, SubmitOptions,
};
pub use persistence::{Persistence, DEFAULT_MAX_THREADS, DEFAULT_STORAGE_KEY};
pub use replay::{ReplayClient, ReplayError};
pub use store::{Store, StoreError};
