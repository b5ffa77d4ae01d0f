//! 记忆库快照：所有集合（声明 + 记录）写成单个 JSON 文件
//!
//! 先写临时文件再 rename，进程中途退出不会留下半个快照。

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{CollectionSpec, MemoryError, MemoryRecord};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub collections: Vec<CollectionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub spec: CollectionSpec,
    pub records: Vec<MemoryRecord>,
}

impl StoreSnapshot {
    pub fn record_count(&self) -> usize {
        self.collections.iter().map(|c| c.records.len()).sum()
    }
}

pub async fn write_snapshot(path: &Path, snapshot: &StoreSnapshot) -> Result<(), MemoryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let data = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// 文件不存在时返回 None
pub async fn read_snapshot(path: &Path) -> Result<Option<StoreSnapshot>, MemoryError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let snapshot: StoreSnapshot = serde_json::from_slice(&data)?;
    if snapshot.version != SNAPSHOT_VERSION {
        return Err(MemoryError::Snapshot(format!(
            "unsupported snapshot version {} (expected {})",
            snapshot.version, SNAPSHOT_VERSION
        )));
    }
    Ok(Some(snapshot))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{RecordKind, RecordMetadata};

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("memory.json");
        let snapshot = StoreSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            collections: vec![CollectionSnapshot {
                spec: CollectionSpec::new("facts", 2, 10, None).unwrap(),
                records: vec![MemoryRecord {
                    id: uuid::Uuid::new_v4(),
                    text: "hello".into(),
                    vector: vec![0.6, 0.8],
                    metadata: RecordMetadata::new(RecordKind::Fact),
                    ttl_expiry: None,
                    seq: 3,
                }],
            }],
        };
        write_snapshot(&path, &snapshot).await.unwrap();

        let loaded = read_snapshot(&path).await.unwrap().unwrap();
        assert_eq!(loaded.record_count(), 1);
        assert_eq!(loaded.collections[0].records[0].text, "hello");
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_snapshot(&dir.path().join("none.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.json");
        tokio::fs::write(
            &path,
            r#"{"version": 99, "saved_at": "2024-01-01T00:00:00Z", "collections": []}"#,
        )
        .await
        .unwrap();
        assert!(matches!(read_snapshot(&path).await, Err(MemoryError::Snapshot(_))));
    }
}
