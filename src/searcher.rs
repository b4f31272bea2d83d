use std::sync::Arc;

use log::{debug, warn};
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::config::ConfDir;
use crate::db::RowStore;
use crate::embedding::{Embedder, check_vectors};
use crate::error::{Error, Result};
use crate::ivf::{InvertedLists, IvfIndex, Neighbor, OnDiskInvlists};

/// 一次查询的结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchReport {
    /// (口令, 距离)，按距离升序
    pub results: Vec<(String, f32)>,
    /// 索引中存在但数据库中缺失的 ID
    pub missing: Vec<i64>,
    /// 查询失败的原因，失败时结果为空
    pub error: Option<String>,
}

/// 查询引擎：嵌入查询文本，搜索索引，再从数据库取回口令
pub struct Searcher<E, R> {
    index: Arc<IvfIndex<OnDiskInvlists>>,
    embedder: E,
    store: R,
    nprobe: usize,
}

impl<E: Embedder, R: RowStore> Searcher<E, R> {
    pub fn new(index: IvfIndex<OnDiskInvlists>, embedder: E, store: R) -> Self {
        Self { index: Arc::new(index), embedder, store, nprobe: 8 }
    }

    /// 打开目录中的量化器和合并后的索引
    pub fn open(conf_dir: &ConfDir, embedder: E, store: R) -> Result<Self> {
        let index = IvfIndex::open(conf_dir.quantizer(), conf_dir.merged_index())?;
        if index.quantizer().dimension() != embedder.dimension() {
            return Err(Error::DimensionMismatch {
                expected: index.quantizer().dimension(),
                actual: embedder.dimension(),
            });
        }
        Ok(Self::new(index, embedder, store))
    }

    pub fn nprobe(mut self, nprobe: usize) -> Self {
        self.nprobe = nprobe.max(1);
        self
    }

    pub fn ntotal(&self) -> usize {
        self.index.ntotal()
    }

    /// 搜索最相似的 k 条口令，失败时返回空结果并记录原因
    pub async fn search(&self, query: &str, k: usize) -> SearchReport {
        match self.try_search(query, k).await {
            Ok(report) => report,
            Err(e) => {
                warn!("查询 {query:?} 失败: {e}");
                SearchReport { error: Some(e.to_string()), ..Default::default() }
            }
        }
    }

    pub async fn try_search(&self, query: &str, k: usize) -> Result<SearchReport> {
        if self.index.invlists().ntotal() == 0 {
            return Err(Error::Config("索引为空".to_string()));
        }

        let batch = [query.to_string()];
        let vectors = self.embedder.embed(&batch).await?;
        check_vectors(&vectors, 1, self.index.quantizer().dimension())?;

        let index = self.index.clone();
        let nprobe = self.nprobe;
        let vector = vectors.into_iter().next().unwrap_or_default();
        let neighbors = spawn_blocking(move || index.search(&vector, k, nprobe)).await??;
        debug!("{query:?} 的候选结果: {neighbors:?}");

        self.resolve(neighbors).await
    }

    /// 过滤填充结果，将 ID 转换为口令，并按距离重新排序
    async fn resolve(&self, neighbors: Vec<Neighbor>) -> Result<SearchReport> {
        let mut found = vec![];
        let mut missing = vec![];
        for neighbor in neighbors.into_iter().filter(|n| n.id >= 0) {
            match self.store.get(neighbor.id).await? {
                Some(text) => found.push((neighbor, text)),
                None => {
                    warn!("{}", Error::RowStoreInconsistency(neighbor.id));
                    missing.push(neighbor.id);
                }
            }
        }

        found.sort_by(|a, b| a.0.cmp(&b.0));
        let results = found.into_iter().map(|(n, text)| (text, n.distance.max(0.0))).collect();
        Ok(SearchReport { results, missing, error: None })
    }
}
