use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::{EmbedderSettings, IndexConfig};
use crate::error::{Error, Result};
use crate::utils::write_atomic;

/// 构建所处的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Init,
    Training,
    Building,
    Merging,
    Done,
    Failed,
}

/// 可恢复的构建状态，每提交一个分片保存一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildState {
    pub config: IndexConfig,
    pub embedder: Option<EmbedderSettings>,
    /// 量化器指纹
    pub fingerprint: Option<String>,
    /// 实际使用的聚类中心数量
    pub nlist: usize,
    /// 语料总条数
    pub total_items: u64,
    /// 分片总数
    pub chunks_total: usize,
    /// 已提交的分片数量，分片按顺序提交
    pub chunks_done: usize,
    /// 下一个未使用的 ID
    pub next_id: u64,
    pub stage: Stage,
    pub last_error: Option<String>,
}

impl BuildState {
    pub fn new(config: IndexConfig, embedder: Option<EmbedderSettings>, total_items: u64) -> Self {
        let nlist = config.nlist.resolve(total_items);
        let chunks_total = total_items.div_ceil(config.chunk_size as u64) as usize;
        Self {
            next_id: config.id_base,
            config,
            embedder,
            fingerprint: None,
            nlist,
            total_items,
            chunks_total,
            chunks_done: 0,
            stage: Stage::Init,
            last_error: None,
        }
    }

    /// 第 `index` 个分片的 ID 范围
    pub fn chunk_range(&self, index: usize) -> (u64, u64) {
        let chunk_size = self.config.chunk_size as u64;
        let start = index as u64 * chunk_size;
        let end = (start + chunk_size).min(self.total_items);
        (self.config.id_base + start, self.config.id_base + end)
    }

    /// 已提交的条目数量
    pub fn items_done(&self) -> u64 {
        self.next_id - self.config.id_base
    }

    /// 标记一个分片已提交
    pub fn commit_chunk(&mut self, index: usize) {
        let (_, end) = self.chunk_range(index);
        self.chunks_done = index + 1;
        self.next_id = end;
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Option<Self>> {
        match fs::read(path.as_ref()) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        debug!("保存构建状态: {:?} {}/{}", self.stage, self.chunks_done, self.chunks_total);
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
    }
}

/// 构建锁，离开作用域时自动释放
#[derive(Debug)]
pub struct BuildLock {
    path: PathBuf,
}

impl BuildLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match File::create_new(&path) {
            Ok(_) => Ok(Self { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(Error::Locked(path)),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("无法删除构建锁 {}: {e}", self.path.display());
        }
    }
}
