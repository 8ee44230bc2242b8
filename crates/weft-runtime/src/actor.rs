//! Per-thread serialized task queue with a liveness watchdog.
//!
//! Each thread id gets a lane: an unbounded channel drained by one worker task, so
//! operations for that thread run one at a time in enqueue order no matter how many
//! producers exist. A failing or panicking operation is logged and the lane moves on.
//! An operation that outlives the timeout is cancelled and the lane is torn down,
//! dropping whatever was queued behind it. A lane that stays empty for the idle
//! timeout is retired and recreated on the next enqueue.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

pub const DEFAULT_ACTOR_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_LANE_IDLE: Duration = Duration::from_secs(30);

/// What to do besides logging when the watchdog resets a lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallPolicy {
    /// Log and move on.
    #[default]
    Discard,
    /// Also publish a [`StallNotice`] to subscribers.
    Report,
}

impl FromStr for StallPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "report" => Ok(Self::Report),
            other => Err(format!("unknown stall policy: {other:?} (expected discard|report)")),
        }
    }
}

/// Published when the watchdog resets a thread's lane under [`StallPolicy::Report`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallNotice {
    pub thread_id: String,
    pub elapsed: Duration,
}

enum Job {
    Run(BoxFuture<'static, Result<(), String>>),
    Barrier(oneshot::Sender<()>),
}

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    worker: JoinHandle<()>,
    generation: u64,
}

type Lanes = Mutex<HashMap<String, Lane>>;

pub struct ThreadActor {
    lanes: Arc<Lanes>,
    next_generation: AtomicU64,
    timeout: Duration,
    idle: Duration,
    policy: StallPolicy,
    stalls: broadcast::Sender<StallNotice>,
}

impl Default for ThreadActor {
    fn default() -> Self {
        Self::new(DEFAULT_ACTOR_TIMEOUT, StallPolicy::default())
    }
}

impl ThreadActor {
    pub fn new(timeout: Duration, policy: StallPolicy) -> Self {
        let (stalls, _) = broadcast::channel(16);
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            timeout,
            idle: DEFAULT_LANE_IDLE,
            policy,
            stalls,
        }
    }

    /// How long an empty lane keeps its worker task before being retired.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn policy(&self) -> StallPolicy {
        self.policy
    }

    /// Receive watchdog notices. Only populated under [`StallPolicy::Report`].
    pub fn subscribe_stalls(&self) -> broadcast::Receiver<StallNotice> {
        self.stalls.subscribe()
    }

    /// Queue `op` behind everything already enqueued for `thread_id`. Does not wait.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn enqueue<F, E>(&self, thread_id: &str, op: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display,
    {
        let job = Job::Run(Box::pin(async move { op.await.map_err(|e| e.to_string()) }));
        self.dispatch(thread_id, job);
    }

    /// Wait until everything enqueued for `thread_id` so far has finished or been discarded.
    pub async fn flush(&self, thread_id: &str) {
        let (tx, rx) = oneshot::channel();
        {
            let lanes = self.lanes.lock().expect("actor lanes mutex poisoned");
            let Some(lane) = lanes.get(thread_id) else {
                return;
            };
            if lane.tx.send(Job::Barrier(tx)).is_err() {
                return;
            }
        }
        // A dropped barrier means the lane was reset; nothing is left to wait for.
        let _ = rx.await;
    }

    /// Discard queued and in-flight work for `thread_id`.
    pub fn reset(&self, thread_id: &str) {
        let lane = self
            .lanes
            .lock()
            .expect("actor lanes mutex poisoned")
            .remove(thread_id);
        if let Some(lane) = lane {
            lane.worker.abort();
            tracing::debug!(thread_id, "thread actor lane reset");
        }
    }

    /// Whether a lane currently exists for the thread.
    pub fn is_active(&self, thread_id: &str) -> bool {
        self.lanes
            .lock()
            .expect("actor lanes mutex poisoned")
            .contains_key(thread_id)
    }

    fn dispatch(&self, thread_id: &str, job: Job) {
        let mut lanes = self.lanes.lock().expect("actor lanes mutex poisoned");
        let job = match lanes.get(thread_id) {
            Some(lane) => match lane.tx.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };
        let lane = self.spawn_lane(thread_id);
        // The receiver is owned by the worker that was just spawned.
        let _ = lane.tx.send(job);
        lanes.insert(thread_id.to_string(), lane);
    }

    fn spawn_lane(&self, thread_id: &str) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let worker = tokio::spawn(run_lane(LaneWorker {
            thread_id: thread_id.to_string(),
            generation,
            rx,
            timeout: self.timeout,
            idle: self.idle,
            policy: self.policy,
            lanes: Arc::downgrade(&self.lanes),
            stalls: self.stalls.clone(),
        }));
        Lane {
            tx,
            worker,
            generation,
        }
    }
}

impl Drop for ThreadActor {
    fn drop(&mut self) {
        if let Ok(mut lanes) = self.lanes.lock() {
            for (_, lane) in lanes.drain() {
                lane.worker.abort();
            }
        }
    }
}

struct LaneWorker {
    thread_id: String,
    generation: u64,
    rx: mpsc::UnboundedReceiver<Job>,
    timeout: Duration,
    idle: Duration,
    policy: StallPolicy,
    lanes: Weak<Lanes>,
    stalls: broadcast::Sender<StallNotice>,
}

async fn run_lane(mut worker: LaneWorker) {
    let thread_id = worker.thread_id.clone();
    loop {
        let job = match tokio::time::timeout(worker.idle, worker.rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(_) => {
                if worker.retire_if_idle() {
                    tracing::trace!(thread_id = %thread_id, "idle thread actor lane retired");
                    return;
                }
                continue;
            }
        };
        let op = match job {
            Job::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
            Job::Run(op) => op,
        };

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(worker.timeout, AssertUnwindSafe(op).catch_unwind()).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(error))) => {
                tracing::warn!(thread_id = %thread_id, error = %error, "thread actor op failed");
            }
            Ok(Err(panic)) => {
                tracing::warn!(
                    thread_id = %thread_id,
                    panic = %panic_message(panic.as_ref()),
                    "thread actor op panicked"
                );
            }
            Err(_) => {
                let elapsed = started.elapsed();
                tracing::warn!(
                    thread_id = %thread_id,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "thread actor watchdog timeout, resetting lane"
                );
                worker.retire();
                if worker.policy == StallPolicy::Report {
                    let _ = worker.stalls.send(StallNotice { thread_id, elapsed });
                }
                return;
            }
        }
    }
}

impl LaneWorker {
    /// Retire the lane if nothing is queued. Senders hold the lanes lock, so an empty
    /// queue observed under it stays empty once the lane is removed.
    fn retire_if_idle(&self) -> bool {
        let Some(lanes) = self.lanes.upgrade() else {
            return true;
        };
        let mut lanes = lanes.lock().expect("actor lanes mutex poisoned");
        let current = lanes
            .get(&self.thread_id)
            .is_some_and(|lane| lane.generation == self.generation);
        if !current {
            return true;
        }
        if !self.rx.is_empty() {
            return false;
        }
        lanes.remove(&self.thread_id);
        true
    }

    /// Remove this worker's lane from the map unless it was already replaced.
    fn retire(&self) {
        let Some(lanes) = self.lanes.upgrade() else {
            return;
        };
        let mut lanes = lanes.lock().expect("actor lanes mutex poisoned");
        if lanes
            .get(&self.thread_id)
            .is_some_and(|lane| lane.generation == self.generation)
        {
            lanes.remove(&self.thread_id);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> Arc<Mutex<Vec<u32>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push(log: &Arc<Mutex<Vec<u32>>>, n: u32) -> impl Future<Output = Result<(), String>> {
        let log = log.clone();
        async move {
            log.lock().unwrap().push(n);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ops_run_in_enqueue_order() {
        let actor = ThreadActor::default();
        let log = recorder();
        for n in 0..20u32 {
            let log = log.clone();
            actor.enqueue("t", async move {
                // later ops finish faster if run concurrently
                tokio::time::sleep(Duration::from_millis(u64::from(20 - n))).await;
                log.lock().unwrap().push(n);
                Ok::<(), String>(())
            });
        }
        actor.flush("t").await;
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failures_and_panics_do_not_break_the_chain() {
        let actor = ThreadActor::default();
        let log = recorder();
        actor.enqueue("t", push(&log, 1));
        actor.enqueue("t", async { Err::<(), _>("boom") });
        actor.enqueue("t", async {
            if std::hint::black_box(true) {
                panic!("op exploded");
            }
            Ok::<(), String>(())
        });
        actor.enqueue("t", push(&log, 2));
        actor.flush("t").await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn threads_do_not_block_each_other() {
        let actor = ThreadActor::default();
        let log = recorder();
        actor.enqueue("slow", async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<(), String>(())
        });
        actor.enqueue("fast", push(&log, 7));
        actor.flush("fast").await;
        assert_eq!(*log.lock().unwrap(), vec![7]);
        assert!(actor.is_active("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_resets_stuck_lane_and_reports() {
        let actor = ThreadActor::new(Duration::from_secs(5), StallPolicy::Report);
        let mut stalls = actor.subscribe_stalls();
        let log = recorder();

        actor.enqueue("t", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<(), String>(())
        });
        actor.enqueue("t", push(&log, 1));
        actor.flush("t").await;

        let notice = stalls.recv().await.unwrap();
        assert_eq!(notice.thread_id, "t");
        assert!(notice.elapsed >= Duration::from_secs(5));
        assert!(log.lock().unwrap().is_empty(), "queued work is discarded");
        assert!(!actor.is_active("t"));

        actor.enqueue("t", push(&log, 2));
        actor.flush("t").await;
        assert_eq!(*log.lock().unwrap(), vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn discard_policy_publishes_nothing() {
        let actor = ThreadActor::new(Duration::from_millis(50), StallPolicy::Discard);
        let mut stalls = actor.subscribe_stalls();
        actor.enqueue("t", futures::future::pending::<Result<(), String>>());
        actor.flush("t").await;
        assert!(matches!(
            stalls.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_queued_work() {
        let actor = ThreadActor::default();
        let ran = Arc::new(AtomicUsize::new(0));
        actor.enqueue("t", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<(), String>(())
        });
        for _ in 0..3 {
            let ran = ran.clone();
            actor.enqueue("t", async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            });
        }
        actor.reset("t");
        actor.flush("t").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_lane_is_retired_and_recreated_on_demand() {
        let actor = ThreadActor::default().with_idle_timeout(Duration::from_secs(1));
        let log = recorder();
        actor.enqueue("t", push(&log, 1));
        actor.flush("t").await;
        assert!(actor.is_active("t"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!actor.is_active("t"));

        actor.enqueue("t", push(&log, 2));
        actor.flush("t").await;
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn flush_without_lane_returns_immediately() {
        let actor = ThreadActor::default();
        actor.flush("never-used").await;
    }

    #[test]
    fn stall_policy_parses() {
        assert_eq!("report".parse::<StallPolicy>(), Ok(StallPolicy::Report));
        assert_eq!(" Discard ".parse::<StallPolicy>(), Ok(StallPolicy::Discard));
        assert!("ignore".parse::<StallPolicy>().is_err());
    }
}
