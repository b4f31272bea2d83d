mod pq;

use std::fmt;
use std::fs;
use std::path::Path;

use log::info;
pub use pq::ProductQuantizer;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::CodecKind;
use crate::error::{Error, Result};
use crate::kmeans;
use crate::utils::{imbalance_factor, l2_sqr, write_atomic};

/// 量化器指纹，为序列化后内容的 blake3 哈希
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", blake3::Hash::from_bytes(self.0).to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// IVF 量化器：粗聚类中心 + 可选的残差乘积量化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfQuantizer {
    dimension: usize,
    nlist: usize,
    codec: CodecKind,
    /// nlist * dimension，未训练时为空
    centroids: Vec<f32>,
    pq: Option<ProductQuantizer>,
}

impl IvfQuantizer {
    /// 创建一个未训练的量化器
    pub fn new(dimension: usize, nlist: usize, codec: CodecKind) -> Self {
        Self { dimension, nlist, codec, centroids: vec![], pq: None }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn nlist(&self) -> usize {
        self.nlist
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn is_trained(&self) -> bool {
        let coarse = self.nlist > 0 && self.centroids.len() == self.nlist * self.dimension;
        match self.codec {
            CodecKind::Flat => coarse,
            CodecKind::Pq { .. } => coarse && self.pq.as_ref().is_some_and(|pq| pq.is_valid()),
        }
    }

    /// 每个向量编码后的字节数
    pub fn code_size(&self) -> usize {
        match self.codec {
            CodecKind::Flat => self.dimension * size_of::<f32>(),
            CodecKind::Pq { m, .. } => m,
        }
    }

    /// 在样本上训练量化器，会丢弃之前的训练结果
    pub fn train(&mut self, sample: &[f32], max_iter: usize, seed: u64) -> Result<()> {
        let d = self.dimension;
        if sample.len() % d != 0 {
            return Err(Error::DimensionMismatch { expected: d, actual: sample.len() % d });
        }
        let n = sample.len() / d;
        if n < self.nlist {
            return Err(Error::InsufficientSample { sample: n, nlist: self.nlist });
        }

        info!("使用 {n} 条样本训练 {} 个聚类中心", self.nlist);
        let state = kmeans::train(sample, d, self.nlist, max_iter, seed)?;
        info!("聚类完成，不平衡度：{:.2}", imbalance_factor(&state.centroid_frequency));
        self.centroids = state.centroids;
        self.pq = None;

        if let CodecKind::Pq { m, nbits } = self.codec {
            info!("训练乘积量化器，子向量数量 = {m}，编码位数 = {nbits}");
            let lists = self.assign(sample);
            let mut residuals = Vec::with_capacity(sample.len());
            for (x, &list_no) in sample.chunks_exact(d).zip(&lists) {
                residuals.extend(self.residual(x, list_no));
            }
            self.pq = Some(ProductQuantizer::train(&residuals, d, m, nbits, max_iter, seed)?);
        }
        Ok(())
    }

    fn centroid(&self, list_no: usize) -> &[f32] {
        &self.centroids[list_no * self.dimension..(list_no + 1) * self.dimension]
    }

    fn residual<'a>(&'a self, x: &'a [f32], list_no: usize) -> impl Iterator<Item = f32> + 'a {
        x.iter().zip(self.centroid(list_no)).map(|(a, b)| a - b)
    }

    /// 返回每个向量所属的倒排列表
    pub fn assign(&self, data: &[f32]) -> Vec<usize> {
        data.par_chunks_exact(self.dimension)
            .map(|x| kmeans::nearest_centroid(&self.centroids, self.dimension, x).0)
            .collect()
    }

    /// 返回离查询向量最近的 nprobe 个倒排列表，按距离升序
    pub fn probe(&self, x: &[f32], nprobe: usize) -> Vec<usize> {
        let mut dis = self
            .centroids
            .chunks_exact(self.dimension)
            .map(|c| l2_sqr(x, c))
            .enumerate()
            .collect::<Vec<_>>();
        dis.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        dis.into_iter().take(nprobe).map(|(i, _)| i).collect()
    }

    /// 编码一个向量，结果追加到 `out`
    pub fn encode(&self, x: &[f32], list_no: usize, out: &mut Vec<u8>) {
        match &self.pq {
            Some(pq) => {
                let residual = self.residual(x, list_no).collect::<Vec<_>>();
                pq.encode(&residual, out);
            }
            None => out.extend_from_slice(bytemuck::cast_slice(x)),
        }
    }

    /// 解码一个向量
    pub fn decode(&self, code: &[u8], list_no: usize) -> Vec<f32> {
        match &self.pq {
            Some(pq) => {
                let mut residual = Vec::with_capacity(self.dimension);
                pq.decode(code, &mut residual);
                residual.iter().zip(self.centroid(list_no)).map(|(r, c)| r + c).collect()
            }
            None => bytemuck::pod_collect_to_vec(code),
        }
    }

    /// 为查询向量和指定倒排列表构造距离计算器
    pub fn scanner<'a>(&'a self, query: &'a [f32], list_no: usize) -> ListScanner<'a> {
        match &self.pq {
            Some(pq) => {
                let residual = self.residual(query, list_no).collect::<Vec<_>>();
                ListScanner::Pq { pq, table: pq.distance_table(&residual) }
            }
            None => ListScanner::Flat { query },
        }
    }

    /// 序列化后的 blake3 指纹
    pub fn fingerprint(&self) -> Result<Fingerprint> {
        let bytes = bincode::serialize(self)?;
        Ok(Fingerprint(*blake3::hash(&bytes).as_bytes()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        if !self.is_trained() {
            return Err(Error::UntrainedQuantizer);
        }
        write_atomic(path, &bincode::serialize(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let quantizer: Self = bincode::deserialize(&fs::read(path)?)?;
        if !quantizer.is_trained() {
            return Err(Error::Corrupted {
                path: path.to_path_buf(),
                reason: "量化器数据不完整".to_string(),
            });
        }
        Ok(quantizer)
    }
}

/// 计算查询向量到某个倒排列表中编码的距离
pub enum ListScanner<'a> {
    Flat { query: &'a [f32] },
    Pq { pq: &'a ProductQuantizer, table: Vec<f32> },
}

impl ListScanner<'_> {
    #[inline]
    pub fn distance(&self, code: &[u8]) -> f32 {
        match self {
            Self::Flat { query } => query
                .iter()
                .zip(code.chunks_exact(size_of::<f32>()))
                .map(|(q, b)| {
                    let v = f32::from_ne_bytes([b[0], b[1], b[2], b[3]]);
                    (q - v) * (q - v)
                })
                .sum(),
            Self::Pq { pq, table } => pq.adc(table, code),
        }
    }
}
