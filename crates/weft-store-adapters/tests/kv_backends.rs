use std::sync::Arc;
use tempfile::TempDir;
use weft_contract::storage::KvBackend;
use weft_store_adapters::{FileKv, MemoryKv};

async fn exercise_backend(kv: Arc<dyn KvBackend>) {
    assert_eq!(kv.get("missing").await.unwrap(), None);

    kv.set("doc", "{\"v\":1}").await.unwrap();
    assert_eq!(kv.get("doc").await.unwrap().as_deref(), Some("{\"v\":1}"));

    kv.set("doc", "{\"v\":2}").await.unwrap();
    assert_eq!(kv.get("doc").await.unwrap().as_deref(), Some("{\"v\":2}"));

    kv.remove("doc").await.unwrap();
    assert_eq!(kv.get("doc").await.unwrap(), None);

    // removing twice is fine
    kv.remove("doc").await.unwrap();
}

#[tokio::test]
async fn memory_kv_get_set_remove() {
    exercise_backend(Arc::new(MemoryKv::new())).await;
}

#[tokio::test]
async fn file_kv_get_set_remove() {
    let dir = TempDir::new().unwrap();
    exercise_backend(Arc::new(FileKv::new(dir.path()))).await;
}

#[tokio::test]
async fn file_kv_creates_missing_base_directory() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("a").join("b");
    let kv = FileKv::new(&nested);
    kv.set("cache", "[]").await.unwrap();
    assert!(nested.join("cache.json").exists());
}

#[tokio::test]
async fn file_kv_values_survive_a_new_handle() {
    let dir = TempDir::new().unwrap();
    FileKv::new(dir.path()).set("cache", "hello").await.unwrap();
    let reopened = FileKv::new(dir.path());
    assert_eq!(reopened.get("cache").await.unwrap().as_deref(), Some("hello"));
}

#[tokio::test]
async fn concurrent_memory_writes_are_all_applied() {
    let kv = Arc::new(MemoryKv::new());
    let mut handles = Vec::new();
    for i in 0..16 {
        let kv = kv.clone();
        handles.push(tokio::spawn(async move {
            kv.set(&format!("k{i}"), "v").await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(kv.len().await, 16);
}
