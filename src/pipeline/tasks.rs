use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::ProgressBar;
use log::{error, info};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::mpsc::{Receiver, channel};
use tokio::task::{JoinHandle, spawn_blocking};

use super::state::BuildState;
use crate::config::ConfDir;
use crate::db::{RowStore, row_id};
use crate::embedding::{Embedder, RetryPolicy, embed_with_retry};
use crate::error::Result;
use crate::ivf::{IvfQuantizer, build_shard, write_shard};

/// 读取任务和嵌入任务之间最多缓存的分片数量
const CHANNEL_SIZE: usize = 1;

/// 语料中连续的一段
#[derive(Debug)]
pub struct Chunk {
    pub index: usize,
    pub start_id: u64,
    pub items: Vec<String>,
    /// 分片文件和数据库记录均已存在，只需更新状态
    pub skip: bool,
}

#[derive(Debug)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    /// items.len() * dimension，跳过的分片为空
    pub vectors: Vec<f32>,
}

/// 按行读取语料，去除首尾空白，非 UTF-8 内容有损解码
pub struct CorpusReader {
    reader: BufReader<File>,
    buf: Vec<u8>,
}

impl CorpusReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path).await?;
        Ok(Self { reader: BufReader::new(file), buf: vec![] })
    }

    pub async fn next_line(&mut self) -> Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&self.buf).trim().to_string()))
    }

    /// 读取最多 n 行
    pub async fn read_lines(&mut self, n: usize) -> Result<Vec<String>> {
        let mut lines = Vec::with_capacity(n);
        while lines.len() < n {
            match self.next_line().await? {
                Some(line) => lines.push(line),
                None => break,
            }
        }
        Ok(lines)
    }
}

/// 统计语料行数，最后一行没有换行符时同样计入
pub async fn count_lines(path: impl AsRef<Path>) -> Result<u64> {
    let mut file = File::open(path).await?;
    let mut buf = vec![0u8; 1 << 16];
    let (mut count, mut last) = (0u64, b'\n');
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
        last = buf[n - 1];
    }
    if last != b'\n' {
        count += 1;
    }
    Ok(count)
}

/// 顺序读取语料并切分为分片，按读取顺序分配 ID
pub fn task_read<R: RowStore + 'static>(
    corpus: PathBuf,
    state: &BuildState,
    conf_dir: ConfDir,
    store: Arc<R>,
) -> (JoinHandle<Result<()>>, Receiver<Chunk>) {
    let (tx, rx) = channel(CHANNEL_SIZE);
    let state = state.clone();
    let t = tokio::spawn(async move {
        let mut reader = CorpusReader::open(&corpus).await?;
        for index in 0..state.chunks_total {
            let (start, end) = state.chunk_range(index);
            let items = reader.read_lines((end - start) as usize).await?;

            // 已提交的分片只需跳过对应的行
            if index < state.chunks_done {
                continue;
            }

            // 分片已写入但状态未保存，例如在保存状态前崩溃
            let skip = conf_dir.shard(index).exists()
                && store.count_range(row_id(start)?, row_id(end)?).await? == items.len() as u64;

            let chunk = Chunk { index, start_id: start, items, skip };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(())
    });
    (t, rx)
}

/// 为每个分片请求嵌入，失败时停止后续所有分片
pub fn task_embed<E: Embedder + 'static>(
    mut lrx: Receiver<Chunk>,
    embedder: Arc<E>,
    retry: RetryPolicy,
) -> (JoinHandle<Result<()>>, Receiver<EmbeddedChunk>) {
    let (tx, rx) = channel(CHANNEL_SIZE);
    let t = tokio::spawn(async move {
        while let Some(chunk) = lrx.recv().await {
            let vectors = if chunk.skip {
                vec![]
            } else {
                match embed_with_retry(&*embedder, &chunk.items, &retry).await {
                    Ok(vectors) => vectors.concat(),
                    Err(e) => {
                        error!("分片 {} 嵌入失败: {e}", chunk.index);
                        return Err(e);
                    }
                }
            };
            if tx.send(EmbeddedChunk { chunk, vectors }).await.is_err() {
                break;
            }
        }
        Ok(())
    });
    (t, rx)
}

/// 构建并写入分片，写入数据库，然后保存构建状态
pub fn task_commit<R: RowStore + 'static>(
    mut lrx: Receiver<EmbeddedChunk>,
    mut state: BuildState,
    quantizer: Arc<IvfQuantizer>,
    conf_dir: ConfDir,
    store: Arc<R>,
    pb: ProgressBar,
) -> JoinHandle<Result<BuildState>> {
    tokio::spawn(async move {
        while let Some(EmbeddedChunk { chunk, vectors }) = lrx.recv().await {
            let len = chunk.items.len() as u64;
            let path = conf_dir.shard(chunk.index);

            if chunk.skip {
                info!("分片 {} 已存在，跳过", chunk.index);
            } else {
                let ids = (chunk.start_id..chunk.start_id + len).collect::<Vec<_>>();
                let quantizer = quantizer.clone();
                spawn_blocking(move || -> Result<()> {
                    let shard = build_shard(&quantizer, &ids, &vectors)?;
                    write_shard(&quantizer, &shard, &path)
                })
                .await??;

                let rows = chunk
                    .items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| Ok((row_id(chunk.start_id + i as u64)?, item)))
                    .collect::<Result<Vec<_>>>()?;
                store.insert_many(&rows).await?;
            }

            state.commit_chunk(chunk.index);
            state.save(conf_dir.build_state())?;

            pb.inc(len);
            report_progress(&pb, &state);
        }
        Ok(state)
    })
}

fn report_progress(pb: &ProgressBar, state: &BuildState) {
    let done = state.items_done();
    let total = state.total_items.max(1);
    info!(
        "已处理 {done}/{} 条 ({:.2}%)，分片 {}/{}，耗时 {:.1}s，预计剩余 {:.1}s",
        state.total_items,
        done as f64 * 100.0 / total as f64,
        state.chunks_done,
        state.chunks_total,
        pb.elapsed().as_secs_f64(),
        pb.eta().as_secs_f64(),
    );
}
