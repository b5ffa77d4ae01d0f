//! 记忆库：命名集合上的写入、最近邻检索与容量 / TTL 淘汰
//!
//! - 写入：取嵌入（不持锁、不重试）→ 校验维度 → 结构性写入 → 立即淘汰
//! - 检索：嵌入查询 → 读锁下克隆快照 → 锁外计算相似度；过期记录在查询时过滤
//! - 周期清扫：`spawn_sweeper` 按固定间隔对所有集合 `evict`
//! - 关闭：`close` 做最后一次淘汰，并在配置了路径时写快照

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::ErrorKind;
use crate::llm::{EmbeddingError, EmbeddingProvider};
use crate::memory::collection::Collection;
use crate::memory::snapshot::{self, CollectionSnapshot, StoreSnapshot, SNAPSHOT_VERSION};
use crate::memory::{
    Clock, CollectionSpec, CollectionStats, InsertOptions, MemoryRecord, RecordKind,
    RecordMetadata, SearchHit, SystemClock, VectorIndex,
};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("collection `{0}` not found")]
    CollectionNotFound(String),

    #[error("collection `{0}` already exists with a different policy")]
    CollectionConflict(String),

    #[error("invalid collection spec: {0}")]
    InvalidSpec(String),

    #[error("dimension mismatch in `{collection}`: expected {expected}, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(#[source] EmbeddingError),

    #[error("text must not be empty")]
    EmptyText,

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MemoryError::CollectionNotFound(_)
            | MemoryError::CollectionConflict(_)
            | MemoryError::InvalidSpec(_) => ErrorKind::Configuration,
            MemoryError::EmbeddingUnavailable(_) | MemoryError::Io(_) => {
                ErrorKind::TransientCollaborator
            }
            MemoryError::DimensionMismatch { .. }
            | MemoryError::EmptyText
            | MemoryError::Snapshot(_)
            | MemoryError::Serialization(_) => ErrorKind::DataIntegrity,
        }
    }
}

/// 记忆库句柄：显式创建、显式关闭，通过 Arc 在多个运行间共享
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    clock: Arc<dyn Clock>,
    seq: AtomicU64,
    snapshot_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<dyn VectorIndex>) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            embedder,
            index,
            clock: Arc::new(SystemClock),
            seq: AtomicU64::new(0),
            snapshot_path: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// close() 时写快照的位置
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    /// 相同声明重复创建是空操作；声明不同则报 CollectionConflict
    pub fn create_collection(&self, spec: CollectionSpec) -> Result<(), MemoryError> {
        spec.validate()
            .map_err(|e| MemoryError::InvalidSpec(e.to_string()))?;
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = collections.get(&spec.name) {
            if existing.spec() == &spec {
                return Ok(());
            }
            return Err(MemoryError::CollectionConflict(spec.name));
        }
        tracing::info!(
            collection = %spec.name,
            dimension = spec.dimension,
            max_items = spec.max_items,
            ttl_days = ?spec.ttl_days,
            "Memory collection created"
        );
        collections.insert(spec.name.clone(), Arc::new(Collection::new(spec)));
        Ok(())
    }

    pub fn drop_collection(&self, name: &str) -> Result<(), MemoryError> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MemoryError::CollectionNotFound(name.to_string()))
    }

    /// 所有集合声明，按名称排序
    pub fn list_collections(&self) -> Vec<CollectionSpec> {
        let mut specs: Vec<CollectionSpec> = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|c| c.spec().clone())
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    fn collection(&self, name: &str) -> Result<Arc<Collection>, MemoryError> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| MemoryError::CollectionNotFound(name.to_string()))
    }

    fn all_collections(&self) -> Vec<Arc<Collection>> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    async fn embed_checked(&self, collection: &Collection, text: &str) -> Result<Vec<f32>, MemoryError> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(MemoryError::EmbeddingUnavailable)?;
        let expected = collection.spec().dimension;
        if vector.len() != expected {
            return Err(MemoryError::DimensionMismatch {
                collection: collection.spec().name.clone(),
                expected,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    pub async fn insert(
        &self,
        collection: &str,
        text: &str,
        metadata: RecordMetadata,
    ) -> Result<Uuid, MemoryError> {
        self.insert_with(collection, text, metadata, InsertOptions::default())
            .await
    }

    /// 写入一条记录并返回其 id
    pub async fn insert_with(
        &self,
        collection: &str,
        text: &str,
        mut metadata: RecordMetadata,
        options: InsertOptions,
    ) -> Result<Uuid, MemoryError> {
        if text.trim().is_empty() {
            return Err(MemoryError::EmptyText);
        }
        let target = self.collection(collection)?;
        let vector = self.embed_checked(&target, text).await?;

        let now = self.clock.now();
        metadata.timestamp = now;
        let ttl_expiry = options
            .ttl
            .or_else(|| target.spec().ttl())
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));

        let record = MemoryRecord {
            id: Uuid::new_v4(),
            text: text.to_string(),
            vector,
            metadata,
            ttl_expiry,
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };
        let id = record.id;
        let kind = record.metadata.kind;
        let evicted = target.insert(record, now);

        tracing::debug!(
            collection = %collection,
            record_id = %id,
            kind = kind.as_str(),
            evicted,
            "Memory record inserted"
        );
        Ok(id)
    }

    /// 最近邻检索：至多 k 条，按余弦相似度降序，同分时较新的在前
    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        k: usize,
        kind_filter: Option<RecordKind>,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        let target = self.collection(collection)?;
        if k == 0 || target.len() == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embed_checked(&target, query).await?;

        let now = self.clock.now();
        let records = target.snapshot();
        let mut candidates: Vec<&Arc<MemoryRecord>> = records
            .iter()
            .filter(|r| !r.is_expired(now))
            .filter(|r| kind_filter.map_or(true, |kind| r.metadata.kind == kind))
            .collect();
        candidates.sort_by(|a, b| b.recency_key().cmp(&a.recency_key()));

        let vectors: Vec<&[f32]> = candidates.iter().map(|r| r.vector.as_slice()).collect();
        let hits = self
            .index
            .nearest(&query_vector, &vectors, k)
            .into_iter()
            .filter_map(|(pos, score)| {
                candidates.get(pos).map(|record| SearchHit {
                    record: Arc::clone(record),
                    score,
                })
            })
            .collect();
        Ok(hits)
    }

    /// 最近写入的未过期记录，新到旧
    pub fn recent(&self, collection: &str, limit: usize) -> Result<Vec<Arc<MemoryRecord>>, MemoryError> {
        let target = self.collection(collection)?;
        let now = self.clock.now();
        let mut records: Vec<Arc<MemoryRecord>> = target
            .snapshot()
            .iter()
            .filter(|r| !r.is_expired(now))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recency_key().cmp(&a.recency_key()));
        records.truncate(limit);
        Ok(records)
    }

    /// 错误记录按 `error_type` 属性计数，次数多的在前
    pub fn error_patterns(&self, collection: &str) -> Result<Vec<(String, usize)>, MemoryError> {
        let target = self.collection(collection)?;
        let now = self.clock.now();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in target.snapshot().iter() {
            if record.metadata.kind != RecordKind::Error || record.is_expired(now) {
                continue;
            }
            let error_type = record
                .metadata
                .attributes
                .get("error_type")
                .map(String::as_str)
                .unwrap_or("unknown");
            *counts.entry(error_type.to_string()).or_insert(0) += 1;
        }
        let mut patterns: Vec<(String, usize)> = counts.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(patterns)
    }

    pub fn stats(&self, collection: &str) -> Result<CollectionStats, MemoryError> {
        Ok(self.collection(collection)?.stats(self.clock.now()))
    }

    /// 当前条数（含尚未清扫的过期记录）
    pub fn len(&self, collection: &str) -> Result<usize, MemoryError> {
        Ok(self.collection(collection)?.len())
    }

    pub fn delete(&self, collection: &str, ids: &[Uuid]) -> Result<usize, MemoryError> {
        Ok(self.collection(collection)?.delete(ids))
    }

    /// 清空集合；对读者而言是原子的（要么看到旧快照，要么看到空集合）
    pub fn clear(&self, collection: &str) -> Result<usize, MemoryError> {
        let removed = self.collection(collection)?.clear();
        tracing::info!(collection = %collection, removed, "Memory collection cleared");
        Ok(removed)
    }

    pub fn evict(&self, collection: &str) -> Result<usize, MemoryError> {
        Ok(self.collection(collection)?.evict(self.clock.now()))
    }

    /// 对所有集合执行一次淘汰，返回淘汰总数
    pub fn evict_all(&self) -> usize {
        let now = self.clock.now();
        self.all_collections().iter().map(|c| c.evict(now)).sum()
    }

    /// 周期清扫，token 取消后退出
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Memory sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let evicted = store.evict_all();
                        if evicted > 0 {
                            tracing::info!(evicted, "Memory sweep evicted records");
                        }
                    }
                }
            }
        })
    }

    /// 把所有集合写入快照文件，返回写入的记录数
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize, MemoryError> {
        let mut collections: Vec<CollectionSnapshot> = self
            .all_collections()
            .iter()
            .map(|c| CollectionSnapshot {
                spec: c.spec().clone(),
                records: c.snapshot().iter().map(|r| r.as_ref().clone()).collect(),
            })
            .collect();
        collections.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));

        let snapshot = StoreSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: self.clock.now(),
            collections,
        };
        snapshot::write_snapshot(path, &snapshot).await?;
        let count = snapshot.record_count();
        tracing::info!(path = %path.display(), records = count, "Memory snapshot saved");
        Ok(count)
    }

    /// 从快照恢复集合与记录；已过期的记录被丢弃。文件不存在时为空操作
    pub async fn restore_snapshot(&self, path: &Path) -> Result<usize, MemoryError> {
        let Some(snapshot) = snapshot::read_snapshot(path).await? else {
            tracing::info!(path = %path.display(), "No memory snapshot found, starting empty");
            return Ok(0);
        };

        let now = self.clock.now();
        let mut restored = 0;
        for CollectionSnapshot { spec, records } in snapshot.collections {
            if let Some(bad) = records.iter().find(|r| r.vector.len() != spec.dimension) {
                return Err(MemoryError::DimensionMismatch {
                    collection: spec.name.clone(),
                    expected: spec.dimension,
                    actual: bad.vector.len(),
                });
            }
            let name = spec.name.clone();
            self.create_collection(spec)?;
            if let Some(max_seq) = records.iter().map(|r| r.seq).max() {
                self.seq.fetch_max(max_seq + 1, Ordering::SeqCst);
            }
            restored += self.collection(&name)?.load(records, now);
        }
        tracing::info!(path = %path.display(), records = restored, "Memory snapshot restored");
        Ok(restored)
    }

    /// 新建记忆库并从快照恢复
    pub async fn load_snapshot(
        path: &Path,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Result<Self, MemoryError> {
        let store = Self::new(embedder, index).with_snapshot_path(path);
        store.restore_snapshot(path).await?;
        Ok(store)
    }

    /// 最后一次淘汰，并在配置了路径时写快照
    pub async fn close(&self) -> Result<(), MemoryError> {
        let evicted = self.evict_all();
        tracing::info!(evicted, "Memory store closing");
        if let Some(path) = &self.snapshot_path {
            self.save_snapshot(path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::HashingEmbedder;
    use crate::memory::{CosineIndex, ManualClock};

    const DIM: usize = 64;

    fn store_with(max_items: usize, ttl_days: Option<u32>) -> (MemoryStore, Arc<HashingEmbedder>) {
        let embedder = Arc::new(HashingEmbedder::new(DIM));
        let store = MemoryStore::new(embedder.clone(), Arc::new(CosineIndex));
        store
            .create_collection(CollectionSpec::new("facts", DIM, max_items, ttl_days).unwrap())
            .unwrap();
        (store, embedder)
    }

    fn fact() -> RecordMetadata {
        RecordMetadata::new(RecordKind::Fact)
    }

    #[tokio::test]
    async fn test_create_collection_is_idempotent_and_immutable() {
        let (store, _) = store_with(10, None);
        store
            .create_collection(CollectionSpec::new("facts", DIM, 10, None).unwrap())
            .unwrap();
        let err = store
            .create_collection(CollectionSpec::new("facts", DIM, 11, None).unwrap())
            .unwrap_err();
        assert!(matches!(err, MemoryError::CollectionConflict(_)));
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let (store, _) = store_with(10, None);
        let err = store.insert("nope", "text", fact()).await.unwrap_err();
        assert!(matches!(err, MemoryError::CollectionNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_empty_text_rejected_before_embedding() {
        let (store, embedder) = store_with(10, None);
        let err = store.insert("facts", "   ", fact()).await.unwrap_err();
        assert!(matches!(err, MemoryError::EmptyText));
        assert_eq!(embedder.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let embedder = Arc::new(HashingEmbedder::new(8));
        let store = MemoryStore::new(embedder, Arc::new(CosineIndex));
        store
            .create_collection(CollectionSpec::new("facts", 16, 10, None).unwrap())
            .unwrap();
        let err = store.insert("facts", "hello", fact()).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::DimensionMismatch { expected: 16, actual: 8, .. }
        ));
        assert_eq!(store.len("facts").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_embedding_unavailable_is_not_retried() {
        let (store, embedder) = store_with(10, None);
        embedder.set_available(false);
        let err = store.insert("facts", "hello", fact()).await.unwrap_err();
        assert!(matches!(err, MemoryError::EmbeddingUnavailable(_)));
        assert_eq!(embedder.call_count(), 1);
    }

    #[tokio::test]
    async fn test_search_empty_and_zero_k() {
        let (store, _) = store_with(10, None);
        assert!(store.search("facts", "anything", 5, None).await.unwrap().is_empty());
        store.insert("facts", "anything", fact()).await.unwrap();
        assert!(store.search("facts", "anything", 0, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_kind_filter_and_tie_break() {
        let (store, _) = store_with(10, None);
        let older = store
            .insert("facts", "disk full on build host", RecordMetadata::new(RecordKind::Error))
            .await
            .unwrap();
        let newer = store
            .insert("facts", "disk full on build host", RecordMetadata::new(RecordKind::Error))
            .await
            .unwrap();
        store
            .insert("facts", "disk full on build host", RecordMetadata::new(RecordKind::Success))
            .await
            .unwrap();

        let hits = store
            .search("facts", "disk full on build host", 2, Some(RecordKind::Error))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.id, newer);
        assert_eq!(hits[1].record.id, older);
    }

    #[tokio::test]
    async fn test_ttl_filtered_at_query_time() {
        let clock = Arc::new(ManualClock::starting_now());
        let embedder = Arc::new(HashingEmbedder::new(DIM));
        let store = MemoryStore::new(embedder, Arc::new(CosineIndex)).with_clock(clock.clone());
        store
            .create_collection(CollectionSpec::new("facts", DIM, 10, Some(1)).unwrap())
            .unwrap();
        store.insert("facts", "short lived", fact()).await.unwrap();

        clock.advance(chrono::Duration::days(2));
        // 清扫前也不能返回过期记录
        assert!(store.search("facts", "short lived", 5, None).await.unwrap().is_empty());
        assert_eq!(store.len("facts").unwrap(), 1);
        assert_eq!(store.evict_all(), 1);
        assert_eq!(store.len("facts").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_insert_option_ttl_overrides_collection() {
        let clock = Arc::new(ManualClock::starting_now());
        let store = MemoryStore::new(Arc::new(HashingEmbedder::new(DIM)), Arc::new(CosineIndex))
            .with_clock(clock.clone());
        store
            .create_collection(CollectionSpec::new("facts", DIM, 10, None).unwrap())
            .unwrap();
        store
            .insert_with(
                "facts",
                "ephemeral",
                fact(),
                InsertOptions {
                    ttl: Some(Duration::from_secs(60)),
                },
            )
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(61));
        assert!(store.recent("facts", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_patterns_and_recent() {
        let (store, _) = store_with(10, None);
        let err = |t: &str| RecordMetadata::new(RecordKind::Error).with_attribute("error_type", t);
        store.insert("facts", "a", err("timeout")).await.unwrap();
        store.insert("facts", "b", err("timeout")).await.unwrap();
        store.insert("facts", "c", RecordMetadata::new(RecordKind::Error)).await.unwrap();
        store.insert("facts", "d", fact()).await.unwrap();

        let patterns = store.error_patterns("facts").unwrap();
        assert_eq!(patterns[0], ("timeout".to_string(), 2));
        assert_eq!(patterns[1], ("unknown".to_string(), 1));

        let recent = store.recent("facts", 2).unwrap();
        assert_eq!(recent[0].text, "d");
        assert_eq!(recent[1].text, "c");
    }

    #[tokio::test]
    async fn test_delete_clear_and_stats() {
        let (store, _) = store_with(10, None);
        let id = store.insert("facts", "one", fact()).await.unwrap();
        store.insert("facts", "two", fact()).await.unwrap();

        assert_eq!(store.delete("facts", &[id]).unwrap(), 1);
        let stats = store.stats("facts").unwrap();
        assert_eq!(stats.count, 1);
        assert!(stats.oldest.is_some());

        assert_eq!(store.clear("facts").unwrap(), 1);
        assert_eq!(store.stats("facts").unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_close_writes_snapshot_and_load_restores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.json");
        let embedder = Arc::new(HashingEmbedder::new(DIM));

        let store = MemoryStore::new(embedder.clone(), Arc::new(CosineIndex)).with_snapshot_path(&path);
        store
            .create_collection(CollectionSpec::new("facts", DIM, 10, None).unwrap())
            .unwrap();
        store.insert("facts", "persist me", fact()).await.unwrap();
        store.close().await.unwrap();

        let restored = MemoryStore::load_snapshot(&path, embedder, Arc::new(CosineIndex))
            .await
            .unwrap();
        let hits = restored.search("facts", "persist me", 1, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);

        // 恢复后写入的序号继续递增
        restored.insert("facts", "later", fact()).await.unwrap();
        assert_eq!(restored.recent("facts", 1).unwrap()[0].text, "later");
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let (store, _) = store_with(10, None);
        let store = Arc::new(store);
        let token = CancellationToken::new();
        let handle = store.spawn_sweeper(Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
