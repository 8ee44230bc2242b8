use super::*;
use crate::replay::ReplayClient;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use weft_contract::testing::{
    custom_part, interrupt_with_id, messages_part, ui_add, values_part, values_with,
};
use weft_contract::{DefaultUiReducer, EventStream, StreamPart, ThreadInfo, UiEvent, UiMessage};
use weft_store_adapters::MemoryKv;

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<String>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl RunObserver for RecordingObserver {
    fn on_thread_id(&self, thread_id: &str) {
        self.events.lock().unwrap().push(format!("thread:{thread_id}"));
    }

    fn on_created(&self, _thread_id: &str, _run_id: Option<&str>) {
        self.events.lock().unwrap().push("created".into());
    }

    fn on_error(&self, error: &OrchestratorError) {
        self.events.lock().unwrap().push(format!("error:{error}"));
    }

    fn on_finish(&self, _thread_id: &str, snapshot: &ThreadSnapshot) {
        self.events
            .lock()
            .unwrap()
            .push(format!("finish:{}", snapshot.blocks.len()));
    }
}

struct RefusingClient;

#[async_trait::async_trait]
impl RunClient for RefusingClient {
    async fn create_thread(&self, _req: CreateThreadRequest) -> Result<ThreadInfo, TransportError> {
        Err(TransportError::Connection("refused".into()))
    }

    async fn stream_run(
        &self,
        _thread_id: &str,
        _assistant_id: &str,
        _req: weft_contract::RunStreamRequest,
        _cancel: CancellationToken,
    ) -> Result<RunStream, TransportError> {
        Err(TransportError::Connection("refused".into()))
    }

    async fn join_stream(
        &self,
        _thread_id: &str,
        _run_id: &str,
        _req: JoinStreamRequest,
        _cancel: CancellationToken,
    ) -> Result<RunStream, TransportError> {
        Err(TransportError::Connection("refused".into()))
    }
}

fn conversation() -> Vec<StreamPart> {
    vec![
        messages_part("a1", "Hel").with_id("1"),
        messages_part("a1", "lo").with_id("2"),
        values_part(values_with(
            vec![
                json!({"type": "human", "id": "h1", "content": "hi"}),
                json!({"type": "ai", "id": "a1", "content": "Hello"}),
            ],
            None,
        ))
        .with_id("3"),
    ]
}

fn human_input(id: &str) -> Value {
    json!({"messages": [{"type": "human", "id": id, "content": "hi"}]})
}

fn block_ids(snapshot: &ThreadSnapshot) -> Vec<String> {
    snapshot.block_ids().into_iter().map(str::to_string).collect()
}

#[tokio::test]
async fn submit_creates_thread_and_publishes_timeline() {
    let client = Arc::new(ReplayClient::new(conversation()));
    let observer = Arc::new(RecordingObserver::default());
    let orch = StreamOrchestrator::builder(client.clone())
        .with_observer(observer.clone())
        .build();

    orch.submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap();

    let tid = orch.thread_id().expect("thread created");
    assert_eq!(client.created_threads().len(), 1);
    assert!(!orch.is_loading());
    assert!(orch.error().is_none());

    let values = orch.values();
    assert_eq!(block_ids(&values), vec!["message:h1", "message:a1"]);
    assert_eq!(values.messages[1]["content"], "Hello");
    assert_eq!(
        observer.events(),
        vec![format!("thread:{tid}"), "created".into(), "finish:2".into()]
    );
}

#[tokio::test]
async fn optimistic_id_is_written_back_into_input() {
    let client = Arc::new(ReplayClient::new(Vec::new()));
    let orch = StreamOrchestrator::builder(client.clone()).build();

    let input = json!({"messages": [{"role": "user", "content": "hi"}]});
    orch.submit(input, SubmitOptions::default()).await.unwrap();

    let sent = client.run_requests();
    let sent_id = sent[0].input.as_ref().unwrap()["messages"][0]["id"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(block_ids(&orch.values()), vec![format!("message:{sent_id}")]);
    assert_eq!(sent[0].stream_mode, vec!["values", "messages", "custom"]);
}

#[tokio::test]
async fn known_thread_is_not_recreated() {
    let client = Arc::new(ReplayClient::new(conversation()));
    let orch = StreamOrchestrator::builder(client.clone())
        .with_thread_id("t-existing")
        .build();

    orch.submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap();
    orch.submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap();

    assert!(client.created_threads().is_empty());
    assert_eq!(orch.thread_id().as_deref(), Some("t-existing"));
}

#[tokio::test]
async fn client_thread_id_is_adopted_and_created() {
    let client = Arc::new(ReplayClient::new(conversation()));
    let orch = StreamOrchestrator::builder(client.clone()).build();

    orch.submit(
        human_input("h1"),
        SubmitOptions::default().with_thread_id("t-client"),
    )
    .await
    .unwrap();

    let created = client.created_threads();
    assert_eq!(created[0].thread_id.as_deref(), Some("t-client"));
    assert_eq!(orch.thread_id().as_deref(), Some("t-client"));
}

#[tokio::test]
async fn server_error_event_is_recorded() {
    let mut parts = conversation();
    parts.insert(
        1,
        StreamPart::new("error", json!({"error": "ValueError", "message": "bad input"})),
    );
    let observer = Arc::new(RecordingObserver::default());
    let orch = StreamOrchestrator::builder(Arc::new(ReplayClient::new(parts)))
        .with_observer(observer.clone())
        .build();

    let err = orch
        .submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        OrchestratorError::Stream(StreamError::new("ValueError", "bad input"))
    );
    assert_eq!(orch.error(), Some(err));
    assert!(!orch.is_loading());
    assert!(observer
        .events()
        .last()
        .unwrap()
        .starts_with("error:ValueError"));
    // Events before the error were applied.
    assert!(orch.values().block("message:a1").is_some());
}

#[tokio::test]
async fn thread_creation_failure_is_reported() {
    let orch = StreamOrchestrator::builder(Arc::new(RefusingClient)).build();
    let err = orch
        .submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ThreadCreation(_)));
    assert!(orch.thread_id().is_none());
    assert!(!orch.is_loading());
}

#[tokio::test]
async fn operations_without_active_thread_are_rejected() {
    let orch = StreamOrchestrator::builder(Arc::new(ReplayClient::default())).build();
    assert_eq!(
        orch.complete_interrupt("i1", None),
        Err(OrchestratorError::NoActiveThread)
    );
    assert_eq!(
        orch.add_optimistic_human_block(json!("hi")),
        Err(OrchestratorError::NoActiveThread)
    );
    orch.join_stream("run-1", None, JoinOptions::default())
        .await
        .unwrap();
    assert!(!orch.is_loading());
}

#[tokio::test]
async fn interrupt_can_be_completed() {
    let parts = vec![values_part(values_with(
        vec![json!({"type": "ai", "id": "a1", "content": "approve?"})],
        Some(vec![interrupt_with_id("i1", json!({"question": "ok?"}))]),
    ))];
    let orch = StreamOrchestrator::builder(Arc::new(ReplayClient::new(parts)))
        .with_thread_id("t1")
        .build();
    orch.submit(Value::Null, SubmitOptions::default())
        .await
        .unwrap();

    let pending = orch.interrupt().expect("pending interrupt");
    assert_eq!(pending.id, "i1");
    assert_eq!(orch.interrupts_for_message("a1").len(), 1);

    orch.complete_interrupt("i1", Some(json!({"answer": "yes"})))
        .unwrap();
    orch.flush("t1").await;
    assert!(orch.interrupt().is_none());
    let block = orch.values();
    let record = block.block("interrupt:i1").unwrap();
    assert_eq!(record.data["completed"], true);
    assert_eq!(record.data["frozenValue"], json!({"answer": "yes"}));
}

#[tokio::test]
async fn thread_switch_hydrates_from_cache() {
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
    let first = StreamOrchestrator::builder(Arc::new(ReplayClient::new(conversation())))
        .with_backend(backend.clone())
        .with_thread_id("t1")
        .build();
    first
        .submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap();
    let expected = first.values();

    let second = StreamOrchestrator::builder(Arc::new(ReplayClient::default()))
        .with_backend(backend)
        .build();
    second.reset_for_thread_switch("t1").await;
    assert_eq!(second.thread_id().as_deref(), Some("t1"));
    assert_eq!(second.values().blocks, expected.blocks);
    assert_eq!(second.cached_threads().await, vec!["t1"]);

    second.clear_thread_cache("t1").await;
    assert!(second.cached_threads().await.is_empty());
}

#[tokio::test]
async fn cleared_view_stays_empty_until_next_submit() {
    let orch = StreamOrchestrator::builder(Arc::new(ReplayClient::new(conversation())))
        .with_thread_id("t1")
        .build();
    orch.submit(human_input("h1"), SubmitOptions::default())
        .await
        .unwrap();
    assert!(!orch.values().blocks.is_empty());

    orch.clear_in_memory_values();
    assert!(orch.thread_id().is_none());
    assert!(orch.values().blocks.is_empty());

    // Late work for the old thread is not published into the cleared view.
    orch.inner
        .enqueue_optimistic("t1", json!({"type": "human", "id": "late", "content": "x"}));
    orch.flush("t1").await;
    assert!(orch.values().blocks.is_empty());
}

#[tokio::test]
async fn stop_ends_an_open_stream() {
    let client = Arc::new(ReplayClient::new(conversation()).hold_open(true));
    let orch = StreamOrchestrator::builder(client)
        .with_thread_id("t1")
        .build();
    let mut values = orch.subscribe();

    let running = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.submit(human_input("h1"), SubmitOptions::default()).await })
    };
    tokio::time::timeout(
        Duration::from_secs(5),
        values.wait_for(|s| s.block("message:a1").is_some()),
    )
    .await
    .expect("stream produced values")
    .unwrap();
    assert!(orch.is_loading());

    orch.stop();
    running.await.unwrap().unwrap();
    assert!(!orch.is_loading());
    assert!(orch.error().is_none());
}

#[tokio::test]
async fn join_stream_resumes_after_cursor() {
    let orch = StreamOrchestrator::builder(Arc::new(ReplayClient::new(conversation())))
        .with_thread_id("t1")
        .build();
    orch.join_stream("run-1", Some("2"), JoinOptions::default())
        .await
        .unwrap();
    // Only the final values part was replayed.
    assert_eq!(
        block_ids(&orch.values()),
        vec!["message:h1", "message:a1"]
    );
}

#[test]
fn string_message_becomes_human_with_id() {
    let (message, id) = with_message_id(json!("hello"));
    assert_eq!(message["type"], "human");
    assert_eq!(message["id"], id.as_str());
    assert!(!id.is_empty());
}

#[test]
fn transport_server_errors_map_to_stream_errors() {
    let err = OrchestratorError::from(TransportError::Server(StreamError::new("E", "m")));
    assert_eq!(err, OrchestratorError::Stream(StreamError::new("E", "m")));
    let err = OrchestratorError::from(TransportError::Aborted);
    assert_eq!(err, OrchestratorError::Transport(TransportError::Aborted));
}

/// Client whose single run stream is fed by the test through a channel.
struct ChannelClient {
    parts: Mutex<Option<mpsc::UnboundedReceiver<StreamPart>>>,
}

impl ChannelClient {
    fn new() -> (Self, mpsc::UnboundedSender<StreamPart>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            parts: Mutex::new(Some(rx)),
        };
        (client, tx)
    }
}

#[async_trait::async_trait]
impl RunClient for ChannelClient {
    async fn create_thread(&self, req: CreateThreadRequest) -> Result<ThreadInfo, TransportError> {
        Ok(ThreadInfo {
            thread_id: req.thread_id.unwrap_or_else(|| "t-created".into()),
            metadata: Value::Null,
        })
    }

    async fn stream_run(
        &self,
        _thread_id: &str,
        _assistant_id: &str,
        _req: weft_contract::RunStreamRequest,
        _cancel: CancellationToken,
    ) -> Result<RunStream, TransportError> {
        let mut rx = self
            .parts
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::Protocol("stream already opened".into()))?;
        let events: EventStream = Box::pin(async_stream::stream! {
            while let Some(part) = rx.recv().await {
                yield Ok::<_, TransportError>(part);
            }
        });
        Ok(RunStream {
            run_id: Some("run-1".into()),
            events,
        })
    }

    async fn join_stream(
        &self,
        _thread_id: &str,
        _run_id: &str,
        _req: JoinStreamRequest,
        _cancel: CancellationToken,
    ) -> Result<RunStream, TransportError> {
        Err(TransportError::Protocol("join not supported".into()))
    }
}

#[tokio::test]
async fn background_stream_keeps_writing_to_its_own_thread_after_switch() {
    let (client, tx) = ChannelClient::new();
    let backend: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
    let orch = StreamOrchestrator::builder(Arc::new(client))
        .with_backend(backend.clone())
        .with_thread_id("t1")
        .build();
    let mut values = orch.subscribe();

    let running = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.submit(Value::Null, SubmitOptions::default()).await })
    };
    tx.send(messages_part("a1", "Hel")).unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        values.wait_for(|s| s.block("message:a1").is_some()),
    )
    .await
    .expect("first chunk published")
    .unwrap();

    orch.reset_for_thread_switch("t2").await;
    assert!(orch.values().blocks.is_empty());

    tx.send(messages_part("a1", "lo")).unwrap();
    tx.send(messages_part("a2", "Next")).unwrap();
    drop(tx);
    running.await.unwrap().unwrap();

    // Nothing from t1 leaked into t2's view.
    assert_eq!(orch.thread_id().as_deref(), Some("t2"));
    assert!(orch.values().blocks.is_empty());

    let cached = Persistence::new(backend)
        .load_thread("t1")
        .await
        .expect("t1 cached");
    let cached_ids: Vec<_> = cached.blocks.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(cached_ids, vec!["message:a1", "message:a2"]);
    assert_eq!(cached.blocks[0].data["content"], "Hello");

    orch.reset_for_thread_switch("t1").await;
    let values = orch.values();
    assert_eq!(block_ids(&values), vec!["message:a1", "message:a2"]);
    assert_eq!(values.messages[0]["content"], "Hello");
}

/// Panics on the widget id `bad`, otherwise behaves like the default reducer.
struct ExplodingReducer;

impl UiReducer for ExplodingReducer {
    fn reduce(&self, prior: Vec<UiMessage>, event: &UiEvent) -> Vec<UiMessage> {
        if event.id() == "bad" {
            panic!("widget rejected");
        }
        DefaultUiReducer.reduce(prior, event)
    }
}

#[tokio::test]
async fn panicking_mutation_does_not_stall_later_events() {
    let parts = vec![
        custom_part(&ui_add("bad", "card", json!({}))),
        messages_part("m1", "hello"),
        custom_part(&ui_add("u1", "card", json!({}))),
    ];
    let orch = StreamOrchestrator::builder(Arc::new(ReplayClient::new(parts)))
        .with_ui_reducer(Arc::new(ExplodingReducer))
        .with_thread_id("t1")
        .build();

    orch.submit(Value::Null, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(block_ids(&orch.values()), vec!["message:m1", "ui:u1"]);

    // Other threads are unaffected as well.
    orch.inner
        .enqueue_optimistic("t2", json!({"type": "human", "id": "h2", "content": "x"}));
    orch.flush("t2").await;
    assert_eq!(
        orch.inner.lock_store().snapshot("t2").block_ids(),
        vec!["message:h2"]
    );
}
