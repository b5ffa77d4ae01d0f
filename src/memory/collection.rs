//! 命名集合：声明式策略 + 写时复制的记录快照
//!
//! 读者在读锁下只克隆 `Arc<Vec<..>>`，相似度计算在锁外进行；
//! 写者先拿 writer 锁（每个集合同一时刻只有一个结构性写者），在副本上修改后整体替换。

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::ConfigError;
use crate::memory::MemoryRecord;

/// 集合声明：创建后不可变
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub dimension: usize,
    pub max_items: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_days: Option<u32>,
}

impl CollectionSpec {
    pub fn new(
        name: impl Into<String>,
        dimension: usize,
        max_items: usize,
        ttl_days: Option<u32>,
    ) -> Result<Self, ConfigError> {
        let spec = Self {
            name: name.into(),
            dimension,
            max_items,
            ttl_days,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let field = |f: &str| format!("memory.collections[{}].{f}", self.name);
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("memory.collections.name", "must not be empty"));
        }
        if self.dimension == 0 {
            return Err(ConfigError::invalid(field("dimension"), "must be positive"));
        }
        if self.max_items == 0 {
            return Err(ConfigError::invalid(field("max_items"), "must be positive"));
        }
        if self.ttl_days == Some(0) {
            return Err(ConfigError::invalid(field("ttl_days"), "omit it instead of 0"));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Option<std::time::Duration> {
        self.ttl_days
            .map(|d| std::time::Duration::from_secs(u64::from(d) * 24 * 60 * 60))
    }
}

pub(crate) type RecordList = Arc<Vec<Arc<MemoryRecord>>>;

/// 集合统计
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub name: String,
    pub dimension: usize,
    pub max_items: usize,
    pub ttl_days: Option<u32>,
    pub count: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub(crate) struct Collection {
    spec: CollectionSpec,
    records: RwLock<RecordList>,
    writer: Mutex<()>,
}

impl Collection {
    pub fn new(spec: CollectionSpec) -> Self {
        Self {
            spec,
            records: RwLock::new(Arc::new(Vec::new())),
            writer: Mutex::new(()),
        }
    }

    pub fn spec(&self) -> &CollectionSpec {
        &self.spec
    }

    /// 当前记录快照
    pub fn snapshot(&self) -> RecordList {
        Arc::clone(&self.records.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// 在副本上做一次结构性修改并替换快照
    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<Arc<MemoryRecord>>) -> R) -> R {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<Arc<MemoryRecord>> = self.snapshot().as_ref().clone();
        let out = f(&mut next);
        *self.records.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        out
    }

    /// 写入并立即按策略淘汰；返回被淘汰的条数
    pub fn insert(&self, record: MemoryRecord, now: DateTime<Utc>) -> usize {
        let max_items = self.spec.max_items;
        self.mutate(|records| {
            records.push(Arc::new(record));
            evict_in_place(records, now, max_items)
        })
    }

    /// 批量装载（快照恢复），已过期的记录直接丢弃
    pub fn load(&self, loaded: Vec<MemoryRecord>, now: DateTime<Utc>) -> usize {
        let max_items = self.spec.max_items;
        self.mutate(|records| {
            records.extend(loaded.into_iter().map(Arc::new));
            evict_in_place(records, now, max_items);
            records.len()
        })
    }

    pub fn evict(&self, now: DateTime<Utc>) -> usize {
        let max_items = self.spec.max_items;
        // 无需淘汰时不复制
        let current = self.snapshot();
        if current.len() <= max_items && !current.iter().any(|r| r.is_expired(now)) {
            return 0;
        }
        self.mutate(|records| evict_in_place(records, now, max_items))
    }

    pub fn delete(&self, ids: &[uuid::Uuid]) -> usize {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| !ids.contains(&r.id));
            before - records.len()
        })
    }

    pub fn clear(&self) -> usize {
        self.mutate(|records| {
            let removed = records.len();
            records.clear();
            removed
        })
    }

    pub fn stats(&self, now: DateTime<Utc>) -> CollectionStats {
        let records = self.snapshot();
        let live = records.iter().filter(|r| !r.is_expired(now));
        let (mut oldest, mut newest, mut count) = (None, None, 0usize);
        for r in live {
            let ts = r.metadata.timestamp;
            oldest = Some(oldest.map_or(ts, |o: DateTime<Utc>| o.min(ts)));
            newest = Some(newest.map_or(ts, |n: DateTime<Utc>| n.max(ts)));
            count += 1;
        }
        CollectionStats {
            name: self.spec.name.clone(),
            dimension: self.spec.dimension,
            max_items: self.spec.max_items,
            ttl_days: self.spec.ttl_days,
            count,
            oldest,
            newest,
        }
    }
}

/// 先删过期，再按 (timestamp, seq) 从旧到新删到不超过 max_items
fn evict_in_place(
    records: &mut Vec<Arc<MemoryRecord>>,
    now: DateTime<Utc>,
    max_items: usize,
) -> usize {
    let before = records.len();
    records.retain(|r| !r.is_expired(now));
    if records.len() > max_items {
        records.sort_by_key(|r| r.recency_key());
        let excess = records.len() - max_items;
        records.drain(..excess);
    }
    before - records.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{RecordKind, RecordMetadata};
    use uuid::Uuid;

    fn record(seq: u64, ts: DateTime<Utc>, expiry: Option<DateTime<Utc>>) -> MemoryRecord {
        let mut metadata = RecordMetadata::new(RecordKind::Fact);
        metadata.timestamp = ts;
        MemoryRecord {
            id: Uuid::new_v4(),
            text: format!("r{seq}"),
            vector: vec![1.0, 0.0],
            metadata,
            ttl_expiry: expiry,
            seq,
        }
    }

    #[test]
    fn test_spec_rejects_zero_values() {
        assert!(CollectionSpec::new("a", 0, 10, None).is_err());
        assert!(CollectionSpec::new("a", 4, 0, None).is_err());
        assert!(CollectionSpec::new("a", 4, 10, Some(0)).is_err());
        assert!(CollectionSpec::new(" ", 4, 10, None).is_err());
        let spec = CollectionSpec::new("a", 4, 10, Some(7)).unwrap();
        assert_eq!(spec.ttl(), Some(std::time::Duration::from_secs(7 * 86_400)));
    }

    #[test]
    fn test_insert_evicts_oldest_by_timestamp_then_seq() {
        let c = Collection::new(CollectionSpec::new("c", 2, 2, None).unwrap());
        let now = Utc::now();
        c.insert(record(0, now, None), now);
        c.insert(record(1, now, None), now);
        let evicted = c.insert(record(2, now, None), now);
        assert_eq!(evicted, 1);
        let texts: Vec<_> = c.snapshot().iter().map(|r| r.text.clone()).collect();
        assert_eq!(texts, vec!["r1", "r2"]);
    }

    #[test]
    fn test_evict_removes_expired_and_is_idempotent() {
        let c = Collection::new(CollectionSpec::new("c", 2, 10, None).unwrap());
        let now = Utc::now();
        c.insert(record(0, now, Some(now + chrono::Duration::seconds(5))), now);
        c.insert(record(1, now, None), now);

        let later = now + chrono::Duration::seconds(10);
        assert_eq!(c.evict(later), 1);
        assert_eq!(c.evict(later), 0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_snapshot_is_stable_across_writes() {
        let c = Collection::new(CollectionSpec::new("c", 2, 10, None).unwrap());
        let now = Utc::now();
        c.insert(record(0, now, None), now);
        let snap = c.snapshot();
        c.clear();
        assert_eq!(snap.len(), 1);
        assert_eq!(c.len(), 0);
    }
}
