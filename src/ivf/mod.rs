pub mod invlists;
pub mod quantizer;
pub mod shard;
mod utils;

use std::cmp::Ordering;
use std::path::Path;

pub use invlists::*;
use log::debug;
pub use quantizer::*;
use rayon::prelude::*;
use serde::Serialize;
pub use shard::*;
pub use utils::TopKNeighbors;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Neighbor {
    pub id: i64,
    pub distance: f32,
}

impl Default for Neighbor {
    fn default() -> Self {
        Self { id: -1, distance: f32::INFINITY }
    }
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Neighbor {}

impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance.total_cmp(&other.distance).then(self.id.cmp(&other.id))
    }
}

/// 量化器 + 倒排列表构成的可搜索索引
pub struct IvfIndex<I: InvertedLists> {
    quantizer: IvfQuantizer,
    invlists: I,
}

impl<I: InvertedLists + Sync> IvfIndex<I> {
    pub fn new(quantizer: IvfQuantizer, invlists: I) -> Result<Self> {
        if quantizer.nlist() != invlists.nlist() || quantizer.code_size() != invlists.code_size() {
            return Err(Error::Config(format!(
                "量化器与倒排列表结构不一致：nlist {} / {}，code_size {} / {}",
                quantizer.nlist(),
                invlists.nlist(),
                quantizer.code_size(),
                invlists.code_size()
            )));
        }
        Ok(Self { quantizer, invlists })
    }

    pub fn quantizer(&self) -> &IvfQuantizer {
        &self.quantizer
    }

    pub fn invlists(&self) -> &I {
        &self.invlists
    }

    pub fn ntotal(&self) -> usize {
        self.invlists.ntotal()
    }

    /// 搜索离查询向量最近的 k 个向量
    ///
    /// 返回结果按距离升序排列，长度固定为 k，不足的部分填充 id 为 -1 的结果。
    /// k 不小于索引大小时搜索所有倒排列表，忽略 `nprobe`。
    pub fn search(&self, query: &[f32], k: usize, nprobe: usize) -> Result<Vec<Neighbor>> {
        let d = self.quantizer.dimension();
        if query.len() != d {
            return Err(Error::DimensionMismatch { expected: d, actual: query.len() });
        }
        let nprobe = if k >= self.ntotal() { self.quantizer.nlist() } else { nprobe.max(1) };
        let lists = self.quantizer.probe(query, nprobe);
        debug!("搜索倒排列表: {lists:?}");

        let partial = lists
            .par_iter()
            .map(|&list_no| self.scan_list(query, list_no, k))
            .collect::<Result<Vec<_>>>()?;

        let mut topk = TopKNeighbors::new(k);
        for neighbors in partial {
            topk.extend(neighbors);
        }

        let mut neighbors = topk.into_sorted_vec();
        neighbors.resize(k, Neighbor::default());
        Ok(neighbors)
    }

    fn scan_list(&self, query: &[f32], list_no: usize, k: usize) -> Result<Vec<Neighbor>> {
        let (ids, codes) = self.invlists.get_list(list_no)?;
        let scanner = self.quantizer.scanner(query, list_no);
        let code_size = self.invlists.code_size();

        let mut topk = TopKNeighbors::new(k);
        for (&id, code) in ids.iter().zip(codes.chunks_exact(code_size)) {
            let id = i64::try_from(id).map_err(|_| Error::IdOutOfRange(id))?;
            topk.push(Neighbor { id, distance: scanner.distance(code) });
        }
        Ok(topk.into_sorted_vec())
    }
}

impl IvfIndex<OnDiskInvlists> {
    /// 打开量化器和合并后的倒排列表，两者指纹必须一致
    pub fn open(quantizer_path: impl AsRef<Path>, index_path: impl AsRef<Path>) -> Result<Self> {
        let quantizer = IvfQuantizer::load(quantizer_path)?;
        let invlists = OnDiskInvlists::load(index_path)?;
        let expected = quantizer.fingerprint()?;
        if invlists.fingerprint() != expected {
            return Err(Error::ShardQuantizerMismatch {
                expected: expected.to_string(),
                shards: vec![invlists.path().to_path_buf()],
            });
        }
        Self::new(quantizer, invlists)
    }
}
