//! 记忆层：命名集合上的向量记忆（写入、最近邻检索、容量 / TTL 淘汰、快照持久化）

pub mod clock;
pub(crate) mod collection;
pub mod index;
pub mod record;
pub mod snapshot;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collection::{CollectionSpec, CollectionStats};
pub use index::{cosine_similarity, CosineIndex, VectorIndex};
pub use record::{InsertOptions, MemoryRecord, RecordKind, RecordMetadata, SearchHit};
pub use store::{MemoryError, MemoryStore};
