//! 相似度检索后端
//!
//! MemoryStore 把候选向量按「新到旧」排好交给 VectorIndex；实现必须保持同分候选的原有顺序，
//! 这样同分时较新的记录排在前面。

/// 相似度检索后端
pub trait VectorIndex: Send + Sync {
    /// 返回至多 k 个 (候选下标, 分数)，按分数降序
    fn nearest(&self, query: &[f32], candidates: &[&[f32]], k: usize) -> Vec<(usize, f32)>;
}

/// 暴力余弦检索
#[derive(Debug, Default, Clone, Copy)]
pub struct CosineIndex;

impl VectorIndex for CosineIndex {
    fn nearest(&self, query: &[f32], candidates: &[&[f32]], k: usize) -> Vec<(usize, f32)> {
        if k == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(pos, v)| (pos, cosine_similarity(query, v)))
            .collect();
        // sort_by 是稳定排序
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}

/// 余弦相似度；长度不一致或任一向量零范数时为 0
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
