//! 记忆库集成测试：容量淘汰、TTL、检索质量、并发写入、快照

use std::sync::Arc;

use hive::llm::HashingEmbedder;
use hive::memory::{
    CollectionSpec, CosineIndex, InsertOptions, ManualClock, MemoryError, MemoryStore, RecordKind,
    RecordMetadata,
};

const DIM: usize = 64;

fn store_with_clock(clock: Arc<ManualClock>) -> MemoryStore {
    MemoryStore::new(Arc::new(HashingEmbedder::new(DIM)), Arc::new(CosineIndex)).with_clock(clock)
}

fn success() -> RecordMetadata {
    RecordMetadata::new(RecordKind::Success)
}

#[tokio::test]
async fn test_capacity_evicts_oldest_first() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = store_with_clock(clock.clone());
    store
        .create_collection(CollectionSpec::new("notes", DIM, 5, None).unwrap())
        .unwrap();

    for i in 0..6 {
        store.insert("notes", &format!("note number {i}"), success()).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
    }
    assert_eq!(store.len("notes").unwrap(), 5);
    let texts: Vec<String> = store
        .recent("notes", 10)
        .unwrap()
        .iter()
        .map(|r| r.text.clone())
        .collect();
    assert!(!texts.contains(&"note number 0".to_string()));
    assert_eq!(texts[0], "note number 5");

    // 累计写入 max_items + 10 条
    for i in 6..15 {
        store.insert("notes", &format!("note number {i}"), success()).await.unwrap();
    }
    assert_eq!(store.len("notes").unwrap(), 5);
    let texts: Vec<String> = store
        .recent("notes", 10)
        .unwrap()
        .iter()
        .map(|r| r.text.clone())
        .collect();
    let expected: Vec<String> = (10..15).rev().map(|i| format!("note number {i}")).collect();
    assert_eq!(texts, expected);
}

#[tokio::test]
async fn test_ttl_expires_with_clock() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = store_with_clock(clock.clone());
    store
        .create_collection(CollectionSpec::new("errors", DIM, 100, Some(7)).unwrap())
        .unwrap();

    store
        .insert("errors", "disk full while writing backup", RecordMetadata::new(RecordKind::Error))
        .await
        .unwrap();
    clock.advance(chrono::Duration::days(6));
    assert_eq!(
        store.search("errors", "disk full", 5, None).await.unwrap().len(),
        1
    );

    clock.advance(chrono::Duration::days(2));
    // 清扫前检索已过滤
    assert!(store.search("errors", "disk full", 5, None).await.unwrap().is_empty());
    assert_eq!(store.evict("errors").unwrap(), 1);
    assert_eq!(store.len("errors").unwrap(), 0);
}

#[tokio::test]
async fn test_per_record_ttl_override() {
    let clock = Arc::new(ManualClock::starting_now());
    let store = store_with_clock(clock.clone());
    store
        .create_collection(CollectionSpec::new("notes", DIM, 100, None).unwrap())
        .unwrap();
    store
        .insert_with(
            "notes",
            "short lived",
            success(),
            InsertOptions {
                ttl: Some(std::time::Duration::from_secs(60)),
            },
        )
        .await
        .unwrap();
    store.insert("notes", "forever", success()).await.unwrap();

    clock.advance(chrono::Duration::minutes(2));
    assert_eq!(store.evict_all(), 1);
    assert_eq!(store.recent("notes", 10).unwrap()[0].text, "forever");
}

#[tokio::test]
async fn test_inserted_text_is_found_again() {
    let store = store_with_clock(Arc::new(ManualClock::starting_now()));
    store
        .create_collection(CollectionSpec::new("successes", DIM, 100, None).unwrap())
        .unwrap();
    let texts = [
        "compile the release build with cargo",
        "send the weekly status email to the team",
        "rotate the database credentials",
    ];
    for text in texts {
        store.insert("successes", text, success()).await.unwrap();
    }

    for text in texts {
        let hits = store.search("successes", text, 1, None).await.unwrap();
        assert_eq!(hits[0].record.text, text);
        assert!(hits[0].score >= 0.9, "score {} for `{text}`", hits[0].score);
    }
}

#[tokio::test]
async fn test_concurrent_inserts_are_all_visible() {
    let store = Arc::new(store_with_clock(Arc::new(ManualClock::starting_now())));
    store
        .create_collection(CollectionSpec::new("notes", DIM, 1000, None).unwrap())
        .unwrap();

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .insert("notes", &format!("concurrent note {i}"), success())
                    .await
            })
        })
        .collect();
    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().unwrap());
    }

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 50);
    assert_eq!(store.len("notes").unwrap(), 50);
}

#[tokio::test]
async fn test_concurrent_inserts_respect_capacity() {
    let store = Arc::new(store_with_clock(Arc::new(ManualClock::starting_now())));
    store
        .create_collection(CollectionSpec::new("notes", DIM, 10, None).unwrap())
        .unwrap();

    let inserts = (0..40).map(|i| {
        let store = store.clone();
        async move { store.insert("notes", &format!("note {i}"), success()).await }
    });
    let results = futures_util::future::join_all(inserts).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(store.len("notes").unwrap(), 10);
}

#[tokio::test]
async fn test_dimension_mismatch_is_rejected() {
    let store = MemoryStore::new(Arc::new(HashingEmbedder::new(16)), Arc::new(CosineIndex));
    store
        .create_collection(CollectionSpec::new("notes", DIM, 10, None).unwrap())
        .unwrap();
    let err = store.insert("notes", "hello", success()).await.unwrap_err();
    assert!(matches!(
        err,
        MemoryError::DimensionMismatch {
            expected: DIM,
            actual: 16,
            ..
        }
    ));
    assert_eq!(store.len("notes").unwrap(), 0);
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.json");
    let clock = Arc::new(ManualClock::starting_now());

    let store = store_with_clock(clock.clone()).with_snapshot_path(&path);
    store
        .create_collection(CollectionSpec::new("notes", DIM, 10, Some(1)).unwrap())
        .unwrap();
    store.insert("notes", "remember me", success()).await.unwrap();
    store.close().await.unwrap();

    let restored = MemoryStore::load_snapshot(
        &path,
        Arc::new(HashingEmbedder::new(DIM)),
        Arc::new(CosineIndex),
    )
    .await
    .unwrap();
    assert_eq!(restored.len("notes").unwrap(), 1);
    let hits = restored.search("notes", "remember me", 1, None).await.unwrap();
    assert!(hits[0].score >= 0.9);

    // 同名同策略的声明是幂等的
    restored
        .create_collection(CollectionSpec::new("notes", DIM, 10, Some(1)).unwrap())
        .unwrap();
    assert!(matches!(
        restored.create_collection(CollectionSpec::new("notes", DIM, 20, Some(1)).unwrap()),
        Err(MemoryError::CollectionConflict(_))
    ));
}

#[tokio::test]
async fn test_list_and_drop_collections() {
    let store = store_with_clock(Arc::new(ManualClock::starting_now()));
    store
        .create_collection(CollectionSpec::new("successes", DIM, 100, None).unwrap())
        .unwrap();
    store
        .create_collection(CollectionSpec::new("errors", DIM, 50, Some(30)).unwrap())
        .unwrap();
    store.insert("errors", "timeout talking to search", RecordMetadata::new(RecordKind::Error))
        .await
        .unwrap();

    let names: Vec<String> = store.list_collections().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["errors", "successes"]);
    assert_eq!(store.list_collections()[0].ttl_days, Some(30));

    store.drop_collection("errors").unwrap();
    assert!(matches!(
        store.drop_collection("errors"),
        Err(MemoryError::CollectionNotFound(_))
    ));
    assert!(matches!(
        store.search("errors", "timeout", 5, None).await,
        Err(MemoryError::CollectionNotFound(_))
    ));
    let names: Vec<String> = store.list_collections().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["successes"]);

    // 删除后可以用新的策略重新声明
    store
        .create_collection(CollectionSpec::new("errors", DIM, 10, None).unwrap())
        .unwrap();
    assert_eq!(store.len("errors").unwrap(), 0);
}
