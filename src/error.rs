use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// 建库与查询过程中的错误
#[derive(Error, Debug)]
pub enum Error {
    /// 训练样本数量少于聚类中心数量
    #[error("训练样本数量 {sample} 少于聚类中心数量 {nlist}")]
    InsufficientSample { sample: usize, nlist: usize },

    /// 量化器尚未训练
    #[error("量化器尚未训练")]
    UntrainedQuantizer,

    /// 分片与量化器指纹不一致
    #[error("以下分片与量化器 {expected} 不匹配: {shards:?}")]
    ShardQuantizerMismatch { expected: String, shards: Vec<PathBuf> },

    /// 索引中的 ID 在数据库中不存在
    #[error("数据库中不存在 ID 为 {0} 的记录")]
    RowStoreInconsistency(i64),

    /// 嵌入服务调用失败
    #[error("嵌入服务调用失败: {0}")]
    EmbeddingService(String),

    /// 嵌入服务拒绝请求，例如 API key 无效或模型不存在，重试不会成功
    #[error("嵌入服务拒绝请求: {0}")]
    EmbeddingRejected(String),

    /// 语料数量不足以构成一个训练批次
    #[error("语料仅有 {available} 条，但训练需要 {required} 条")]
    TrainingDataExhausted { available: u64, required: u64 },

    /// 向量维度不一致
    #[error("向量维度不一致：期望 {expected}，实际 {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 索引或分片文件损坏
    #[error("文件 {path} 无效: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// ID 无法以 i64 保存
    #[error("ID {0} 超出 i64 范围")]
    IdOutOfRange(u64),

    /// 另一个构建进程正在使用同一目录
    #[error("构建锁 {0} 已存在，可能有其他构建正在进行")]
    Locked(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    BinaryFormat(#[from] binrw::Error),

    #[error(transparent)]
    Bincode(#[from] bincode::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}
