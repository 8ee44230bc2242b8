//! Capacity-bounded snapshot cache stored as one JSON document under a single key.
//!
//! Reads fail open (absent or corrupt data is an empty cache) and writes are
//! best effort: every failure is logged and swallowed.

use std::sync::Arc;
use weft_contract::{
    now_unix_millis, KvBackend, PersistedDocument, PersistedSnapshot, ThreadSnapshot,
    SCHEMA_VERSION,
};

pub const DEFAULT_STORAGE_KEY: &str = "langgraph-stream-cache";
pub const DEFAULT_MAX_THREADS: usize = 50;

pub struct Persistence {
    backend: Arc<dyn KvBackend>,
    storage_key: String,
    max_threads: usize,
    // Serializes read-merge-write cycles issued through this handle.
    write_lock: tokio::sync::Mutex<()>,
}

impl Persistence {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            max_threads: DEFAULT_MAX_THREADS,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    #[must_use]
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Load the whole cache. Never fails: missing or unreadable data yields an empty document.
    pub async fn load_all(&self) -> PersistedDocument {
        let raw = match self.backend.get(&self.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return PersistedDocument::default(),
            Err(e) => {
                tracing::warn!(key = %self.storage_key, error = %e, "failed to read snapshot cache");
                return PersistedDocument::default();
            }
        };
        match serde_json::from_str::<PersistedDocument>(&raw) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(key = %self.storage_key, error = %e, "discarding unreadable snapshot cache");
                PersistedDocument::default()
            }
        }
    }

    pub async fn load_thread(&self, thread_id: &str) -> Option<PersistedSnapshot> {
        self.load_all().await.threads.remove(thread_id)
    }

    /// Upsert one thread's snapshot and evict the least recently updated threads above the cap.
    pub async fn save_thread(&self, thread_id: &str, snapshot: &ThreadSnapshot) {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_all().await;
        let mut entry = PersistedSnapshot::from(snapshot);
        if entry.last_updated_at == 0 {
            entry.last_updated_at = now_unix_millis();
        }
        doc.threads.insert(thread_id.to_string(), entry);
        let evicted = prune(&mut doc, self.max_threads, thread_id);
        if !evicted.is_empty() {
            tracing::debug!(evicted = ?evicted, "evicted cached threads over capacity");
        }
        self.write(&doc).await;
    }

    /// Drop one thread from the cache.
    pub async fn clear_thread(&self, thread_id: &str) {
        let _guard = self.write_lock.lock().await;
        let mut doc = self.load_all().await;
        if doc.threads.remove(thread_id).is_some() {
            self.write(&doc).await;
        }
    }

    /// Cached thread ids, most recently updated first.
    pub async fn list_recent(&self) -> Vec<String> {
        self.load_all().await.recent_thread_ids()
    }

    async fn write(&self, doc: &PersistedDocument) {
        let mut doc = doc.clone();
        doc.schema_version = SCHEMA_VERSION;
        let encoded = match serde_json::to_string(&doc) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode snapshot cache");
                return;
            }
        };
        if let Err(e) = self.backend.set(&self.storage_key, &encoded).await {
            tracing::warn!(key = %self.storage_key, error = %e, "failed to save snapshot cache");
        }
    }
}

/// Evict least-recently-updated threads until at most `max_threads` remain, never
/// evicting `keep`. Ties are broken by id. Returns evicted ids.
fn prune(doc: &mut PersistedDocument, max_threads: usize, keep: &str) -> Vec<String> {
    let excess = doc.threads.len().saturating_sub(max_threads);
    if excess == 0 {
        return Vec::new();
    }
    let mut by_age: Vec<(String, u64)> = doc
        .threads
        .iter()
        .filter(|(id, _)| id.as_str() != keep)
        .map(|(id, snap)| (id.clone(), snap.last_updated_at))
        .collect();
    by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let evicted: Vec<String> = by_age.into_iter().take(excess).map(|(id, _)| id).collect();
    for id in &evicted {
        doc.threads.remove(id);
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_contract::{Block, BlockKind};
    use weft_store_adapters::MemoryKv;

    fn snapshot_at(at: u64) -> ThreadSnapshot {
        ThreadSnapshot {
            blocks: vec![Block {
                id: "message:m1".into(),
                kind: BlockKind::Message,
                data: json!({"type": "human", "id": "m1", "content": "hi"}),
            }],
            last_updated_at: at,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn load_all_is_empty_without_data() {
        let p = Persistence::new(Arc::new(MemoryKv::new()));
        let doc = p.load_all().await;
        assert!(doc.threads.is_empty());
        assert_eq!(doc.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn load_all_fails_open_on_corrupt_data() {
        let kv = Arc::new(MemoryKv::new());
        kv.set(DEFAULT_STORAGE_KEY, "{not json").await.unwrap();
        let p = Persistence::new(kv);
        assert!(p.load_all().await.threads.is_empty());
    }

    #[tokio::test]
    async fn save_thread_writes_document_format() {
        let kv = Arc::new(MemoryKv::new());
        let p = Persistence::new(kv.clone());
        p.save_thread("t1", &snapshot_at(10)).await;

        let raw = kv.get(DEFAULT_STORAGE_KEY).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["schemaVersion"], 2);
        assert_eq!(value["threads"]["t1"]["lastUpdatedAt"], 10);
        assert_eq!(value["threads"]["t1"]["blocks"][0]["id"], "message:m1");
        assert!(value["threads"]["t1"].get("messages").is_none());
    }

    #[tokio::test]
    async fn missing_timestamp_is_stamped_now() {
        let p = Persistence::new(Arc::new(MemoryKv::new()));
        p.save_thread("t1", &snapshot_at(0)).await;
        assert!(p.load_thread("t1").await.unwrap().last_updated_at > 0);
    }

    #[tokio::test]
    async fn prunes_least_recently_updated_over_cap() {
        let p = Persistence::new(Arc::new(MemoryKv::new())).with_max_threads(3);
        for (id, at) in [("a", 4), ("b", 1), ("c", 3), ("d", 2)] {
            p.save_thread(id, &snapshot_at(at)).await;
        }
        assert_eq!(p.list_recent().await, vec!["a", "c", "d"]);
    }

    #[tokio::test]
    async fn saved_thread_survives_a_timestamp_tie() {
        let p = Persistence::new(Arc::new(MemoryKv::new()));
        for i in 0..DEFAULT_MAX_THREADS {
            p.save_thread(&format!("t{i:02}"), &snapshot_at(1000)).await;
        }
        p.save_thread("a-newest", &snapshot_at(1000)).await;

        let recent = p.list_recent().await;
        assert_eq!(recent.len(), DEFAULT_MAX_THREADS);
        assert!(recent.iter().any(|id| id == "a-newest"));
        assert!(!recent.iter().any(|id| id == "t00"));
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let p = Persistence::new(Arc::new(MemoryKv::new().with_quota(8)));
        p.save_thread("t1", &snapshot_at(1)).await;
        assert!(p.load_all().await.threads.is_empty());
    }

    #[tokio::test]
    async fn clear_thread_removes_one_entry() {
        let p = Persistence::new(Arc::new(MemoryKv::new()));
        p.save_thread("t1", &snapshot_at(1)).await;
        p.save_thread("t2", &snapshot_at(2)).await;
        p.clear_thread("t1").await;
        p.clear_thread("missing").await;
        assert_eq!(p.list_recent().await, vec!["t2"]);
    }

    #[tokio::test]
    async fn custom_storage_key_is_isolated() {
        let kv = Arc::new(MemoryKv::new());
        let a = Persistence::new(kv.clone());
        let b = Persistence::new(kv).with_storage_key("other-cache");
        a.save_thread("t1", &snapshot_at(1)).await;
        assert!(b.load_all().await.threads.is_empty());
    }
}
