use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::kmeans::{kmeans, nearest_centroid};
use crate::utils::l2_sqr;

/// 乘积量化器：将 d 维向量切分为 m 段，每段用 2^nbits 个中心之一表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductQuantizer {
    d: usize,
    m: usize,
    nbits: u32,
    /// m * ksub * dsub
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// 在 n 个 d 维向量上训练每一段的码本
    pub fn train(
        data: &[f32],
        d: usize,
        m: usize,
        nbits: u32,
        max_iter: usize,
        seed: u64,
    ) -> Result<Self> {
        if m == 0 || d % m != 0 {
            return Err(Error::Config(format!("维度 {d} 无法被子向量数量 {m} 整除")));
        }
        let n = data.len() / d;
        let ksub = 1usize << nbits;
        if n < ksub {
            return Err(Error::InsufficientSample { sample: n, nlist: ksub });
        }
        let dsub = d / m;

        let codebooks = (0..m)
            .into_par_iter()
            .map(|sub| {
                let slice = data
                    .chunks_exact(d)
                    .flat_map(|x| x[sub * dsub..(sub + 1) * dsub].iter().copied())
                    .collect::<Vec<_>>();
                kmeans(&slice, dsub, ksub, max_iter, seed.wrapping_add(sub as u64))
                    .map(|state| state.centroids)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { d, m, nbits, centroids: codebooks.concat() })
    }

    pub fn ksub(&self) -> usize {
        1 << self.nbits
    }

    pub fn dsub(&self) -> usize {
        self.d / self.m
    }

    /// 每个向量编码后的字节数
    pub fn code_size(&self) -> usize {
        self.m
    }

    pub fn is_valid(&self) -> bool {
        self.m > 0
            && self.d % self.m == 0
            && (1..=8).contains(&self.nbits)
            && self.centroids.len() == self.m * self.ksub() * self.dsub()
    }

    fn codebook(&self, sub: usize) -> &[f32] {
        let size = self.ksub() * self.dsub();
        &self.centroids[sub * size..(sub + 1) * size]
    }

    /// 编码一个向量，结果追加到 `out`
    pub fn encode(&self, x: &[f32], out: &mut Vec<u8>) {
        let dsub = self.dsub();
        for (sub, xs) in x.chunks_exact(dsub).enumerate() {
            let (code, _) = nearest_centroid(self.codebook(sub), dsub, xs);
            out.push(code as u8);
        }
    }

    /// 解码一个向量，结果追加到 `out`
    pub fn decode(&self, code: &[u8], out: &mut Vec<f32>) {
        let dsub = self.dsub();
        for (sub, &c) in code.iter().enumerate() {
            let c = c as usize;
            out.extend_from_slice(&self.codebook(sub)[c * dsub..(c + 1) * dsub]);
        }
    }

    /// 计算查询向量每一段到各中心的距离表，长度为 m * ksub
    pub fn distance_table(&self, x: &[f32]) -> Vec<f32> {
        let dsub = self.dsub();
        let mut table = Vec::with_capacity(self.m * self.ksub());
        for (sub, xs) in x.chunks_exact(dsub).enumerate() {
            table.extend(self.codebook(sub).chunks_exact(dsub).map(|c| l2_sqr(xs, c)));
        }
        table
    }

    /// 使用距离表计算非对称距离
    #[inline]
    pub fn adc(&self, table: &[f32], code: &[u8]) -> f32 {
        let ksub = self.ksub();
        code.iter().enumerate().map(|(sub, &c)| table[sub * ksub + c as usize]).sum()
    }
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use rand::rngs::StdRng;

    use super::*;

    fn random_data(n: usize, d: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(0);
        (0..n * d).map(|_| rng.random_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_pq_encode_decode() {
        let (n, d) = (512, 8);
        let data = random_data(n, d);
        let pq = ProductQuantizer::train(&data, d, 4, 4, 10, 42).unwrap();
        assert!(pq.is_valid());
        assert_eq!(pq.code_size(), 4);

        let mut code = vec![];
        pq.encode(&data[..d], &mut code);
        assert_eq!(code.len(), 4);
        assert!(code.iter().all(|&c| c < 16));

        let mut decoded = vec![];
        pq.decode(&code, &mut decoded);
        assert_eq!(decoded.len(), d);
        // 重建误差应明显小于向量本身的范数
        assert!(l2_sqr(&data[..d], &decoded) < l2_sqr(&data[..d], &vec![0.0; d]));
    }

    #[test]
    fn test_adc_matches_decoded_distance() {
        let (n, d) = (256, 4);
        let data = random_data(n, d);
        let pq = ProductQuantizer::train(&data, d, 2, 3, 10, 1).unwrap();

        let query = &data[d..2 * d];
        let table = pq.distance_table(query);

        let mut code = vec![];
        pq.encode(&data[..d], &mut code);
        let mut decoded = vec![];
        pq.decode(&code, &mut decoded);

        let expected = l2_sqr(query, &decoded);
        assert!((pq.adc(&table, &code) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_pq_insufficient_sample() {
        let data = random_data(10, 4);
        let err = ProductQuantizer::train(&data, 4, 2, 8, 10, 0).unwrap_err();
        assert!(matches!(err, Error::InsufficientSample { sample: 10, nlist: 256 }));
    }
}
