//! 建库流程：统计语料 → 训练量化器 → 逐个分片构建 → 合并

mod state;
mod tasks;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;
use log::{info, warn};
pub use state::*;
use tokio::task::spawn_blocking;
pub use tasks::{CorpusReader, count_lines};

use crate::config::{ConfDir, EmbedderSettings, IndexConfig};
use crate::db::RowStore;
use crate::embedding::{Embedder, RetryPolicy, embed_with_retry};
use crate::error::{Error, Result};
use crate::ivf::{InvertedLists, IvfQuantizer, MergeStats, OnDiskInvlists, merge_shards};
use crate::utils::pb_style;

/// 一次完整构建的结果
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub total_items: u64,
    pub chunks: usize,
    /// 本次运行中实际构建的分片数量
    pub built_chunks: usize,
    /// 合并后索引中的向量数量
    pub ntotal: usize,
    /// 数据库中的行数
    pub rows: u64,
    pub index_path: PathBuf,
}

/// 建库流程，行存储与嵌入服务由调用方提供
pub struct Pipeline<E, R> {
    conf_dir: ConfDir,
    config: IndexConfig,
    embedder: Arc<E>,
    store: Arc<R>,
    embedder_settings: Option<EmbedderSettings>,
    retry: RetryPolicy,
    fresh: bool,
}

impl<E, R> Pipeline<E, R>
where
    E: Embedder + 'static,
    R: RowStore + 'static,
{
    pub fn new(conf_dir: ConfDir, config: IndexConfig, embedder: Arc<E>, store: Arc<R>) -> Self {
        let retry = RetryPolicy { max_retries: config.max_retries, ..Default::default() };
        Self { conf_dir, config, embedder, store, embedder_settings: None, retry, fresh: false }
    }

    /// 保存到构建状态中的嵌入服务设置，供搜索时使用
    pub fn embedder_settings(mut self, settings: EmbedderSettings) -> Self {
        self.embedder_settings = Some(settings);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 忽略已有产物，从头开始构建
    pub fn fresh(mut self, fresh: bool) -> Self {
        self.fresh = fresh;
        self
    }

    pub async fn run(&self, corpus: impl AsRef<Path>) -> Result<BuildReport> {
        let corpus = corpus.as_ref().to_path_buf();
        self.config.validate()?;
        if self.embedder.dimension() != self.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimension,
                actual: self.embedder.dimension(),
            });
        }

        fs::create_dir_all(self.conf_dir.shard_dir())?;
        let _lock = BuildLock::acquire(self.conf_dir.build_lock())?;

        let result = self.run_locked(&corpus).await;
        if let Err(e) = &result {
            self.mark_failed(e);
        }
        result
    }

    async fn run_locked(&self, corpus: &Path) -> Result<BuildReport> {
        // INIT
        let total_items = count_lines(corpus).await?;
        info!("语料 {} 共 {total_items} 条", corpus.display());
        self.config.validate_ids(total_items)?;

        let mut state = self.init_state(total_items).await?;
        if state.stage == Stage::Done && self.conf_dir.merged_index().exists() {
            info!("索引已构建完成，无需重复构建");
            return self.finish(&state, 0).await;
        }

        // TRAINING
        let quantizer = Arc::new(self.prepare_quantizer(&mut state, corpus).await?);

        // BUILDING
        let chunks_before = state.chunks_done;
        state.stage = Stage::Building;
        state.last_error = None;
        state.save(self.conf_dir.build_state())?;
        let state = self.build_chunks(state, quantizer.clone(), corpus).await?;
        let built_chunks = state.chunks_done - chunks_before;

        // MERGING
        let state = self.merge(state, &quantizer)?;
        self.finish(&state, built_chunks).await
    }

    /// 读取或新建构建状态，必要时清理旧产物
    async fn init_state(&self, total_items: u64) -> Result<BuildState> {
        let path = self.conf_dir.build_state();
        let saved = if self.fresh { None } else { BuildState::load(&path)? };

        if let Some(mut state) = saved {
            if !state.config.is_compatible(&self.config) {
                return Err(Error::Config("已有构建状态与当前参数不一致，请使用 --fresh 重新构建".to_string()));
            }
            if state.total_items != total_items {
                return Err(Error::Config(format!(
                    "语料条数 {total_items} 与已有构建状态中的 {} 不一致，请使用 --fresh 重新构建",
                    state.total_items
                )));
            }
            info!("从分片 {}/{} 继续构建，下一个 ID 为 {}", state.chunks_done, state.chunks_total, state.next_id);
            state.config = self.config.clone();
            if self.embedder_settings.is_some() {
                state.embedder = self.embedder_settings.clone();
            }
            return Ok(state);
        }

        self.clean_artifacts().await?;
        let state = BuildState::new(self.config.clone(), self.embedder_settings.clone(), total_items);
        state.save(&path)?;
        Ok(state)
    }

    /// 删除量化器、分片、合并索引和数据库记录
    async fn clean_artifacts(&self) -> Result<()> {
        info!("清理 {} 中的已有产物", self.conf_dir);
        for path in [self.conf_dir.quantizer(), self.conf_dir.merged_index(), self.conf_dir.build_state()] {
            remove_if_exists(&path)?;
        }
        for entry in fs::read_dir(self.conf_dir.shard_dir())? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        self.store.create_table().await?;
        self.store.clear().await?;
        Ok(())
    }

    /// 加载已训练的量化器，不存在时读取训练批次并训练
    async fn prepare_quantizer(&self, state: &mut BuildState, corpus: &Path) -> Result<IvfQuantizer> {
        let path = self.conf_dir.quantizer();
        if let (Some(fingerprint), true) = (&state.fingerprint, path.exists()) {
            let quantizer = IvfQuantizer::load(&path)?;
            let actual = quantizer.fingerprint()?.to_string();
            if &actual != fingerprint {
                return Err(Error::Corrupted {
                    path,
                    reason: format!("量化器指纹 {actual} 与构建状态中的 {fingerprint} 不一致"),
                });
            }
            if quantizer.dimension() != self.config.dimension {
                return Err(Error::DimensionMismatch {
                    expected: self.config.dimension,
                    actual: quantizer.dimension(),
                });
            }
            info!("使用已训练的量化器 {actual}");
            return Ok(quantizer);
        }

        state.stage = Stage::Training;
        state.save(self.conf_dir.build_state())?;

        let nlist = state.nlist;
        let required = self.config.training_size(state.total_items, nlist);
        if required > state.total_items {
            return Err(Error::TrainingDataExhausted { available: state.total_items, required });
        }

        info!("读取 {required} 条训练数据");
        let mut reader = CorpusReader::open(corpus).await?;
        let pb = ProgressBar::new(required).with_style(pb_style());
        pb.set_message("计算训练数据的嵌入");
        let mut sample = Vec::with_capacity(required as usize * self.config.dimension);
        let mut remaining = required as usize;
        while remaining > 0 {
            let batch = reader.read_lines(remaining.min(self.config.chunk_size)).await?;
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            let vectors = embed_with_retry(&*self.embedder, &batch, &self.retry).await?;
            sample.extend(vectors.into_iter().flatten());
            pb.inc(batch.len() as u64);
        }
        pb.finish_and_clear();

        let mut quantizer = IvfQuantizer::new(self.config.dimension, nlist, self.config.codec);
        let (max_iter, seed) = (self.config.max_iter, self.config.seed);
        let quantizer = spawn_blocking(move || -> Result<IvfQuantizer> {
            quantizer.train(&sample, max_iter, seed)?;
            Ok(quantizer)
        })
        .await??;

        quantizer.save(&path)?;
        let fingerprint = quantizer.fingerprint()?;
        info!("量化器训练完成，指纹 {fingerprint}");
        state.fingerprint = Some(fingerprint.to_string());
        state.save(self.conf_dir.build_state())?;
        Ok(quantizer)
    }

    /// 读取、嵌入、提交三个任务并行处理所有分片
    async fn build_chunks(&self, state: BuildState, quantizer: Arc<IvfQuantizer>, corpus: &Path) -> Result<BuildState> {
        let pb = ProgressBar::new(state.total_items).with_style(pb_style());
        pb.set_position(state.items_done());

        let (t1, rx) =
            tasks::task_read(corpus.to_path_buf(), &state, self.conf_dir.clone(), self.store.clone());
        let (t2, rx) = tasks::task_embed(rx, self.embedder.clone(), self.retry.clone());
        let t3 = tasks::task_commit(rx, state, quantizer, self.conf_dir.clone(), self.store.clone(), pb.clone());

        // 等待全部任务结束，保证出错前已提交的分片都已保存
        let (r1, r2, r3) = tokio::join!(t1, t2, t3);
        pb.finish_and_clear();
        r2??;
        r1??;
        let state = r3??;

        if state.chunks_done != state.chunks_total {
            return Err(Error::Config(format!(
                "仅提交了 {}/{} 个分片",
                state.chunks_done, state.chunks_total
            )));
        }
        Ok(state)
    }

    fn merge(&self, mut state: BuildState, quantizer: &IvfQuantizer) -> Result<BuildState> {
        state.stage = Stage::Merging;
        state.save(self.conf_dir.build_state())?;

        let shards = (0..state.chunks_total).map(|i| self.conf_dir.shard(i)).collect::<Vec<_>>();
        if let Some(missing) = shards.iter().find(|p| !p.exists()) {
            return Err(Error::Corrupted { path: missing.clone(), reason: "分片文件不存在".to_string() });
        }
        merge_shards(quantizer, &shards, self.conf_dir.merged_index())?;

        if !self.config.keep_shards {
            for shard in &shards {
                fs::remove_file(shard)?;
            }
        }

        state.stage = Stage::Done;
        state.save(self.conf_dir.build_state())?;
        Ok(state)
    }

    async fn finish(&self, state: &BuildState, built_chunks: usize) -> Result<BuildReport> {
        let index_path = self.conf_dir.merged_index();
        let ntotal = OnDiskInvlists::load(&index_path)?.ntotal();
        let rows = self.store.count().await?;
        if rows != ntotal as u64 {
            warn!("数据库记录数 {rows} 与索引向量数 {ntotal} 不一致");
        }
        info!("构建完成：{ntotal} 条向量，索引位于 {}", index_path.display());
        Ok(BuildReport {
            total_items: state.total_items,
            chunks: state.chunks_total,
            built_chunks,
            ntotal,
            rows,
            index_path,
        })
    }

    fn mark_failed(&self, e: &Error) {
        let path = self.conf_dir.build_state();
        match BuildState::load(&path) {
            Ok(Some(mut state)) => {
                state.stage = Stage::Failed;
                state.last_error = Some(e.to_string());
                if let Err(e) = state.save(&path) {
                    warn!("无法保存构建状态: {e}");
                }
            }
            Ok(None) => {}
            Err(e) => warn!("无法读取构建状态: {e}"),
        }
    }
}

/// 重新合并已有分片，用于分片保留或合并中断的情况
pub fn merge_index(conf_dir: &ConfDir) -> Result<MergeStats> {
    let _lock = BuildLock::acquire(conf_dir.build_lock())?;
    let quantizer = IvfQuantizer::load(conf_dir.quantizer())?;

    let mut state = BuildState::load(conf_dir.build_state())?;
    let shards = match &state {
        Some(state) => (0..state.chunks_total).map(|i| conf_dir.shard(i)).collect(),
        None => conf_dir.all_shards(),
    };
    if let Some(missing) = shards.iter().find(|p| !p.exists()) {
        return Err(Error::Corrupted { path: missing.clone(), reason: "分片文件不存在".to_string() });
    }
    let stats = merge_shards(&quantizer, &shards, conf_dir.merged_index())?;

    if let Some(state) = &mut state {
        if state.chunks_done == state.chunks_total {
            state.stage = Stage::Done;
            state.save(conf_dir.build_state())?;
        }
    }
    Ok(stats)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
