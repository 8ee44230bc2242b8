//! Top-level coordinator: drives one network stream at a time and routes every event
//! through normalizer -> thread actor -> store -> persistence -> published values.

mod consume;
mod options;

#[cfg(test)]
mod tests;

pub use options::{merge_stream_modes, JoinOptions, RunObserver, SubmitOptions};

use crate::actor::{StallNotice, ThreadActor};
use crate::config::WeftConfig;
use crate::persistence::Persistence;
use crate::store::{Store, StoreError};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use weft_contract::{
    gen_message_id, now_unix_millis, BlockKind, CreateThreadRequest, DisplayMode,
    InterruptRecord, JoinStreamRequest, KvBackend, NormalizedEvent, RunClient, RunStream,
    StreamError, StreamNormalizer, ThreadSnapshot, TransportError, UiReducer,
};
use weft_protocol_langgraph::LangGraphNormalizer;
use weft_store_adapters::MemoryKv;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Stream(StreamError),

    #[error(transparent)]
    Transport(TransportError),

    #[error("thread creation failed: {0}")]
    ThreadCreation(String),

    #[error("no active thread")]
    NoActiveThread,
}

impl From<StreamError> for OrchestratorError {
    fn from(err: StreamError) -> Self {
        Self::Stream(err)
    }
}

impl From<TransportError> for OrchestratorError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Server(err) => Self::Stream(err),
            other => Self::Transport(other),
        }
    }
}

pub(crate) struct Inner {
    client: Arc<dyn RunClient>,
    normalizer: Arc<dyn StreamNormalizer>,
    store: Mutex<Store>,
    actor: ThreadActor,
    persistence: Persistence,
    config: WeftConfig,
    active_thread: watch::Sender<Option<String>>,
    /// Threads known to exist server-side.
    known_threads: Mutex<HashSet<String>>,
    /// Suppresses publication while no thread is active.
    suspend_when_null: AtomicBool,
    values: watch::Sender<ThreadSnapshot>,
    loading: AtomicBool,
    error: Mutex<Option<OrchestratorError>>,
    run_seq: AtomicU64,
    current_run: Mutex<Option<(u64, CancellationToken)>>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl Inner {
    fn active_thread(&self) -> Option<String> {
        self.active_thread.borrow().clone()
    }

    fn set_active(&self, thread_id: Option<String>) {
        self.active_thread.send_replace(thread_id);
    }

    fn mark_known(&self, thread_id: &str) {
        self.known_threads
            .lock()
            .expect("known threads mutex poisoned")
            .insert(thread_id.to_string());
    }

    fn is_known(&self, thread_id: &str) -> bool {
        self.known_threads
            .lock()
            .expect("known threads mutex poisoned")
            .contains(thread_id)
    }

    /// Lock the store, recovering it if a mutation panicked while holding it.
    fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_thread_id(&self, thread_id: &str) {
        if let Some(observer) = &self.observer {
            observer.on_thread_id(thread_id);
        }
    }

    fn should_publish(&self, thread_id: &str) -> bool {
        match self.active_thread.borrow().as_deref() {
            Some(active) => active == thread_id,
            None => !self.suspend_when_null.load(Ordering::SeqCst),
        }
    }

    fn publish(&self, thread_id: &str, snapshot: ThreadSnapshot) {
        if self.should_publish(thread_id) {
            self.values.send_replace(snapshot);
        } else {
            tracing::trace!(thread_id, "snapshot not published for inactive thread");
        }
    }

    /// Persist then conditionally publish a post-mutation snapshot.
    async fn commit(&self, thread_id: &str, snapshot: ThreadSnapshot) {
        self.persistence.save_thread(thread_id, &snapshot).await;
        self.publish(thread_id, snapshot);
    }

    /// Run a synchronous store mutation on the thread's lane, then commit.
    fn enqueue_mutation<F>(self: &Arc<Self>, thread_id: &str, mutate: F)
    where
        F: FnOnce(&mut Store, &str) -> Result<(), StoreError> + Send + 'static,
    {
        let inner = self.clone();
        let tid = thread_id.to_string();
        self.actor.enqueue(thread_id, async move {
            let snapshot = {
                let mut store = inner.lock_store();
                mutate(&mut *store, &tid)?;
                store.snapshot(&tid)
            };
            inner.commit(&tid, snapshot).await;
            Ok::<(), StoreError>(())
        });
    }

    fn enqueue_event(self: &Arc<Self>, thread_id: &str, event: NormalizedEvent) {
        self.enqueue_mutation(thread_id, move |store, tid| store.apply(tid, &event));
    }

    fn enqueue_optimistic(self: &Arc<Self>, thread_id: &str, message: Value) {
        self.enqueue_mutation(thread_id, move |store, tid| {
            store.add_optimistic_block(tid, message);
            Ok(())
        });
    }

    /// Load the thread from persistence unless it is already in memory, then publish.
    fn enqueue_hydrate(self: &Arc<Self>, thread_id: &str) {
        let inner = self.clone();
        let tid = thread_id.to_string();
        self.actor.enqueue(thread_id, async move {
            let in_memory = inner.lock_store().has_thread(&tid);
            let persisted = if in_memory {
                None
            } else {
                inner.persistence.load_thread(&tid).await
            };
            let snapshot = {
                let mut store = inner.lock_store();
                if let Some(persisted) = &persisted {
                    store.hydrate(&tid, persisted);
                    tracing::debug!(thread_id = %tid, blocks = persisted.blocks.len(), "hydrated thread from cache");
                }
                store.snapshot(&tid)
            };
            inner.publish(&tid, snapshot);
            Ok::<(), StoreError>(())
        });
    }

    /// Start a run: cancel any previous one and hand out a fresh token.
    fn begin_run(&self) -> (u64, CancellationToken) {
        let id = self.run_seq.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let previous = self
            .current_run
            .lock()
            .expect("current run mutex poisoned")
            .replace((id, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
        (id, token)
    }

    /// Clear the current run if it is still `run_id`. Returns whether it was.
    fn end_run(&self, run_id: u64) -> bool {
        let mut current = self.current_run.lock().expect("current run mutex poisoned");
        if current.as_ref().is_some_and(|(id, _)| *id == run_id) {
            *current = None;
            true
        } else {
            false
        }
    }

    fn start_loading(&self) {
        self.loading.store(true, Ordering::SeqCst);
        *self.error.lock().expect("error mutex poisoned") = None;
    }

    fn fail(&self, err: OrchestratorError) -> OrchestratorError {
        tracing::warn!(error = %err, "run failed");
        *self.error.lock().expect("error mutex poisoned") = Some(err.clone());
        if let Some(observer) = &self.observer {
            observer.on_error(&err);
        }
        err
    }
}

/// Coordinates runs, the per-thread actor, the store, and persistence for one view.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct StreamOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StreamOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamOrchestrator")
            .field("thread_id", &self.inner.active_thread())
            .field("loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

impl StreamOrchestrator {
    pub fn builder(client: Arc<dyn RunClient>) -> StreamOrchestratorBuilder {
        StreamOrchestratorBuilder::new(client)
    }

    pub fn config(&self) -> &WeftConfig {
        &self.inner.config
    }

    /// Start a run on the active thread (creating one if needed) and consume it to completion.
    ///
    /// Returns after the stream ends and every mutation it produced has been applied.
    pub async fn submit(&self, input: Value, options: SubmitOptions) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let mut input = input;
        let mut options = options;
        inner.suspend_when_null.store(false, Ordering::SeqCst);
        inner.start_loading();

        if inner.active_thread().is_none() {
            if let Some(tid) = options.thread_id.take() {
                tracing::debug!(thread_id = %tid, "adopting client thread id");
                inner.set_active(Some(tid.clone()));
                inner.notify_thread_id(&tid);
            }
        }

        let optimistic = optimistic_message(&mut input, options.optimistic_human_message.take());
        let provisional = inner.active_thread();
        if let (Some(tid), Some(message)) = (provisional.as_deref(), optimistic.as_ref()) {
            inner.enqueue_optimistic(tid, message.clone());
        }

        let thread_id = match self
            .ensure_thread(provisional.as_deref(), options.thread_metadata.take())
            .await
        {
            Ok(tid) => tid,
            Err(err) => {
                inner.loading.store(false, Ordering::SeqCst);
                return Err(inner.fail(err));
            }
        };
        if provisional.as_deref() != Some(thread_id.as_str()) {
            if let Some(message) = optimistic {
                inner.enqueue_optimistic(&thread_id, message);
            }
        }

        let stream_mode = merge_stream_modes(&inner.config.stream_modes, &options.stream_mode);
        let request = options.into_request(input, stream_mode);
        let (run_id, token) = inner.begin_run();
        let opened = inner
            .client
            .stream_run(&thread_id, &inner.config.assistant_id, request, token.clone())
            .await;
        self.drive(&thread_id, run_id, token, opened).await
    }

    /// Resume an existing run from `last_event_id` (default `"-1"`). No-op without an active thread.
    pub async fn join_stream(
        &self,
        run_id: &str,
        last_event_id: Option<&str>,
        options: JoinOptions,
    ) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let Some(thread_id) = inner.active_thread() else {
            tracing::debug!(run_id, "join_stream without an active thread");
            return Ok(());
        };
        inner.start_loading();
        let request = JoinStreamRequest {
            last_event_id: Some(last_event_id.unwrap_or("-1").to_string()),
            stream_mode: merge_stream_modes(&inner.config.stream_modes, &options.stream_mode),
        };
        let (local_run, token) = inner.begin_run();
        let opened = inner
            .client
            .join_stream(&thread_id, run_id, request, token.clone())
            .await;
        self.drive(&thread_id, local_run, token, opened).await
    }

    /// Cancel the network stream. Work already enqueued on the actor still runs.
    pub fn stop(&self) {
        let current = self
            .inner
            .current_run
            .lock()
            .expect("current run mutex poisoned");
        if let Some((_, token)) = current.as_ref() {
            tracing::debug!("stopping current run");
            token.cancel();
        }
    }

    async fn ensure_thread(
        &self,
        provisional: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<String, OrchestratorError> {
        let inner = &self.inner;
        if let Some(tid) = provisional {
            if inner.is_known(tid) {
                return Ok(tid.to_string());
            }
        }
        let info = inner
            .client
            .create_thread(CreateThreadRequest {
                thread_id: provisional.map(str::to_string),
                metadata,
            })
            .await
            .map_err(|e| OrchestratorError::ThreadCreation(e.to_string()))?;
        inner.mark_known(&info.thread_id);

        let active = inner.active_thread();
        if active.as_deref() != Some(info.thread_id.as_str())
            && (active.is_none() || active.as_deref() == provisional)
        {
            tracing::debug!(thread_id = %info.thread_id, "server issued thread id");
            inner.set_active(Some(info.thread_id.clone()));
            inner.notify_thread_id(&info.thread_id);
        }
        Ok(info.thread_id)
    }

    async fn drive(
        &self,
        thread_id: &str,
        run_id: u64,
        token: CancellationToken,
        opened: Result<RunStream, TransportError>,
    ) -> Result<(), OrchestratorError> {
        let inner = &self.inner;
        let result = match opened {
            Ok(run) => {
                if let Some(observer) = &inner.observer {
                    observer.on_created(thread_id, run.run_id.as_deref());
                }
                consume::consume_stream(inner, thread_id, run.events, &token).await
            }
            Err(TransportError::Aborted) if token.is_cancelled() => Ok(()),
            Err(e) => Err(e.into()),
        };

        inner.actor.flush(thread_id).await;
        if inner.end_run(run_id) {
            inner.loading.store(false, Ordering::SeqCst);
        }

        match result {
            Ok(()) => {
                if let Some(observer) = &inner.observer {
                    let snapshot = inner.lock_store().snapshot(thread_id);
                    observer.on_finish(thread_id, &snapshot);
                }
                Ok(())
            }
            Err(err) => Err(inner.fail(err)),
        }
    }

    /// Mark an interrupt completed on the active thread. Unknown ids are logged and ignored.
    pub fn complete_interrupt(
        &self,
        interrupt_id: &str,
        frozen_value: Option<Value>,
    ) -> Result<(), OrchestratorError> {
        let thread_id = self
            .inner
            .active_thread()
            .ok_or(OrchestratorError::NoActiveThread)?;
        let interrupt_id = interrupt_id.to_string();
        self.inner.enqueue_mutation(&thread_id, move |store, tid| {
            store.complete_interrupt(tid, &interrupt_id, frozen_value)
        });
        Ok(())
    }

    /// Show a provisional human message on the active thread. Returns its message id.
    pub fn add_optimistic_human_block(&self, message: Value) -> Result<String, OrchestratorError> {
        let thread_id = self
            .inner
            .active_thread()
            .ok_or(OrchestratorError::NoActiveThread)?;
        let (message, id) = with_message_id(message);
        self.inner.enqueue_optimistic(&thread_id, message);
        Ok(id)
    }

    /// Make `thread_id` active, hydrating it from the cache when it is not in memory.
    pub async fn reset_for_thread_switch(&self, thread_id: &str) {
        let inner = &self.inner;
        if inner.active_thread().as_deref() == Some(thread_id) {
            return;
        }
        tracing::debug!(thread_id, "switching thread");
        inner.mark_known(thread_id);
        inner.set_active(Some(thread_id.to_string()));
        inner.enqueue_hydrate(thread_id);
        inner.actor.flush(thread_id).await;
    }

    /// Cold start: hydrate the active thread from the cache and publish it.
    pub async fn hydrate_active(&self) {
        if let Some(thread_id) = self.inner.active_thread() {
            self.inner.enqueue_hydrate(&thread_id);
            self.inner.actor.flush(&thread_id).await;
        }
    }

    /// Clear the view: no active thread, publication suspended, empty values.
    pub fn clear_in_memory_values(&self) {
        let inner = &self.inner;
        inner.suspend_when_null.store(true, Ordering::SeqCst);
        inner.set_active(None);
        inner
            .values
            .send_replace(ThreadSnapshot::empty_at(now_unix_millis()));
    }

    pub async fn clear_thread_cache(&self, thread_id: &str) {
        self.inner.persistence.clear_thread(thread_id).await;
    }

    /// Cached thread ids, most recently updated first.
    pub async fn cached_threads(&self) -> Vec<String> {
        self.inner.persistence.list_recent().await
    }

    /// Wait for everything enqueued for `thread_id` so far.
    pub async fn flush(&self, thread_id: &str) {
        self.inner.actor.flush(thread_id).await;
    }

    pub fn set_display_mode(&self, mode: DisplayMode) {
        self.inner.lock_store().set_display_mode(mode);
    }

    pub fn thread_id(&self) -> Option<String> {
        self.inner.active_thread()
    }

    pub fn subscribe_thread_id(&self) -> watch::Receiver<Option<String>> {
        self.inner.active_thread.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst)
    }

    /// Error recorded by the last failed run, cleared when a new run starts.
    pub fn error(&self) -> Option<OrchestratorError> {
        self.inner.error.lock().expect("error mutex poisoned").clone()
    }

    /// Latest published snapshot.
    pub fn values(&self) -> ThreadSnapshot {
        self.inner.values.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ThreadSnapshot> {
        self.inner.values.subscribe()
    }

    pub fn stalls(&self) -> broadcast::Receiver<StallNotice> {
        self.inner.actor.subscribe_stalls()
    }

    /// Most recent pending interrupt in the published snapshot.
    pub fn interrupt(&self) -> Option<InterruptRecord> {
        let values = self.inner.values.borrow();
        values
            .blocks
            .iter()
            .rev()
            .filter(|block| block.kind == BlockKind::Interrupt)
            .filter_map(|block| serde_json::from_value::<InterruptRecord>(block.data.clone()).ok())
            .find(|record| !record.completed)
    }

    /// Interrupts rendered directly after the given message on the active thread.
    pub fn interrupts_for_message(&self, message_id: &str) -> Vec<InterruptRecord> {
        let Some(thread_id) = self.inner.active_thread() else {
            return Vec::new();
        };
        self.inner.lock_store().interrupts_for_message(&thread_id, message_id)
    }
}

/// Ensure a message value carries an id, returning it alongside.
fn with_message_id(message: Value) -> (Value, String) {
    let mut message = match message {
        Value::String(text) => serde_json::json!({ "type": "human", "content": text }),
        other => other,
    };
    let existing = message
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let id = match existing {
        Some(id) => id,
        None => {
            let id = gen_message_id();
            if let Some(obj) = message.as_object_mut() {
                obj.insert("id".to_string(), Value::String(id.clone()));
            }
            id
        }
    };
    (message, id)
}

fn is_human_message(message: &Value) -> bool {
    let role = message
        .get("type")
        .or_else(|| message.get("role"))
        .and_then(Value::as_str);
    matches!(role, Some("human" | "user" | "HumanMessageChunk"))
}

/// The message to show optimistically for a submit.
///
/// An explicit message wins. Otherwise the last human message of `input.messages` is used,
/// and an id is written back into the input so the server echoes the same id.
fn optimistic_message(input: &mut Value, explicit: Option<Value>) -> Option<Value> {
    if let Some(message) = explicit {
        return Some(with_message_id(message).0);
    }
    let messages = input.get_mut("messages")?.as_array_mut()?;
    let last_human = messages.iter_mut().rev().find(|m| is_human_message(m))?;
    let (with_id, _) = with_message_id(last_human.clone());
    *last_human = with_id.clone();
    Some(with_id)
}

pub struct StreamOrchestratorBuilder {
    client: Arc<dyn RunClient>,
    config: WeftConfig,
    backend: Option<Arc<dyn KvBackend>>,
    normalizer: Option<Arc<dyn StreamNormalizer>>,
    ui_reducer: Option<Arc<dyn UiReducer>>,
    observer: Option<Arc<dyn RunObserver>>,
    thread_id: Option<String>,
}

impl StreamOrchestratorBuilder {
    pub fn new(client: Arc<dyn RunClient>) -> Self {
        Self {
            client,
            config: WeftConfig::default(),
            backend: None,
            normalizer: None,
            ui_reducer: None,
            observer: None,
            thread_id: None,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: WeftConfig) -> Self {
        self.config = config;
        self
    }

    /// Storage for the snapshot cache. Defaults to an in-memory backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn KvBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Arc<dyn StreamNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    #[must_use]
    pub fn with_ui_reducer(mut self, reducer: Arc<dyn UiReducer>) -> Self {
        self.ui_reducer = Some(reducer);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start with an existing server-side thread selected.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn build(self) -> StreamOrchestrator {
        let config = self.config;
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryKv::new()) as Arc<dyn KvBackend>);
        let persistence = Persistence::new(backend)
            .with_storage_key(config.storage_key.clone())
            .with_max_threads(config.max_threads);
        let mut store = Store::new().with_display_mode(config.display_mode);
        if let Some(reducer) = self.ui_reducer {
            store = store.with_ui_reducer(reducer);
        }
        let known: HashSet<String> = self.thread_id.iter().cloned().collect();
        let (active_thread, _) = watch::channel(self.thread_id);
        let (values, _) = watch::channel(ThreadSnapshot::default());

        StreamOrchestrator {
            inner: Arc::new(Inner {
                client: self.client,
                normalizer: self
                    .normalizer
                    .unwrap_or_else(|| Arc::new(LangGraphNormalizer) as Arc<dyn StreamNormalizer>),
                store: Mutex::new(store),
                actor: ThreadActor::new(config.actor_timeout(), config.stall_policy)
                    .with_idle_timeout(config.lane_idle()),
                persistence,
                config,
                active_thread,
                known_threads: Mutex::new(known),
                suspend_when_null: AtomicBool::new(false),
                values,
                loading: AtomicBool::new(false),
                error: Mutex::new(None),
                run_seq: AtomicU64::new(0),
                current_run: Mutex::new(None),
                observer: self.observer,
            }),
        }
    }
}
