mod hash;
mod http;

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
pub use hash::HashEmbedder;
pub use http::HttpEmbedder;
use log::{debug, error, warn};

use crate::config::{EmbedderKind, EmbedderSettings};
use crate::error::{Error, Result};

/// 将文本转换为固定维度向量的外部服务
pub trait Embedder: Send + Sync {
    /// 输出向量的维度
    fn dimension(&self) -> usize;

    /// 批量计算文本的向量，输出顺序与输入一致
    fn embed(&self, batch: &[String]) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;
}

/// 根据配置选择的嵌入实现
pub enum AnyEmbedder {
    Http(HttpEmbedder),
    Hash(HashEmbedder),
}

impl AnyEmbedder {
    pub fn from_settings(settings: &EmbedderSettings, dimension: usize) -> Result<Self> {
        Ok(match settings.kind {
            EmbedderKind::Http => Self::Http(HttpEmbedder::new(settings, dimension)?),
            EmbedderKind::Hash => Self::Hash(HashEmbedder::new(dimension)),
        })
    }
}

impl Embedder for AnyEmbedder {
    fn dimension(&self) -> usize {
        match self {
            Self::Http(e) => e.dimension(),
            Self::Hash(e) => e.dimension(),
        }
    }

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Http(e) => e.embed(batch).await,
            Self::Hash(e) => e.embed(batch).await,
        }
    }
}

/// 嵌入失败时的重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 第一次失败后最多重试的次数
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(500),
            max_elapsed_time: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_interval,
            current_interval: self.initial_interval,
            max_elapsed_time: Some(self.max_elapsed_time),
            ..Default::default()
        }
    }
}

/// 带指数退避的批量嵌入，并检查返回的数量和维度
pub async fn embed_with_retry<E: Embedder>(
    embedder: &E,
    batch: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let mut backoff = policy.backoff();
    let mut attempts = 0;

    let vectors = loop {
        attempts += 1;
        debug!("第 {attempts} 次请求嵌入，共 {} 条", batch.len());

        match embedder.embed(batch).await {
            Ok(vectors) => break vectors,
            Err(e @ Error::EmbeddingRejected(_)) => {
                error!("{e}，不再重试");
                return Err(e);
            }
            Err(e) => {
                if attempts > policy.max_retries {
                    error!("嵌入失败，已重试 {} 次: {e}", policy.max_retries);
                    return Err(into_service_error(e));
                }
                match backoff.next_backoff() {
                    Some(duration) => {
                        warn!("嵌入失败，{}ms 后重试: {e}", duration.as_millis());
                        tokio::time::sleep(duration).await;
                    }
                    None => {
                        error!("嵌入失败，重试时间已耗尽: {e}");
                        return Err(into_service_error(e));
                    }
                }
            }
        }
    };

    check_vectors(&vectors, batch.len(), embedder.dimension())?;
    Ok(vectors)
}

fn into_service_error(e: Error) -> Error {
    match e {
        Error::EmbeddingService(_) => e,
        e => Error::EmbeddingService(e.to_string()),
    }
}

/// 检查嵌入结果的数量与维度
pub fn check_vectors(vectors: &[Vec<f32>], expected_len: usize, dimension: usize) -> Result<()> {
    if vectors.len() != expected_len {
        return Err(Error::EmbeddingService(format!(
            "请求 {expected_len} 条嵌入，实际返回 {} 条",
            vectors.len()
        )));
    }
    if let Some(v) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(Error::DimensionMismatch { expected: dimension, actual: v.len() });
    }
    Ok(())
}
