use super::Embedder;
use crate::error::Result;

/// 本地字符 n-gram 哈希嵌入
///
/// 每个文本加上首尾标记后取 1 ~ 3 字符的 n-gram，用 blake3 哈希到带符号的桶中，
/// 最后做 L2 归一化。字面上相似的文本会得到相近的向量。
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dimension];
        if self.dimension == 0 {
            return v;
        }

        let chars = std::iter::once('\u{2}')
            .chain(text.chars())
            .chain(std::iter::once('\u{3}'))
            .collect::<Vec<_>>();

        let mut buf = String::new();
        for n in 1..=3 {
            for gram in chars.windows(n) {
                buf.clear();
                buf.extend(gram);
                let hash = blake3::hash(buf.as_bytes());
                let bytes = hash.as_bytes();
                let bucket = u64::from_le_bytes([
                    bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
                ]) % self.dimension as u64;
                let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
                v[bucket as usize] += sign * n as f32;
            }
        }

        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(batch.iter().map(|s| self.embed_one(s)).collect())
    }
}
