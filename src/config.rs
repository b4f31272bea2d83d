use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::cli::*;
use crate::error::{Error, Result};

static CONF_DIR: LazyLock<String> = LazyLock::new(|| {
    ProjectDirs::from("", "", "pwsearch")
        .map(|dirs| dirs.data_dir().to_string_lossy().into_owned())
        .unwrap_or_else(|| "pwsearch".to_string())
});

fn default_config_dir() -> &'static str {
    CONF_DIR.as_str()
}

#[derive(Parser, Debug, Clone)]
#[command(name = "pwsearch", version)]
pub struct Opts {
    #[command(subcommand)]
    pub subcmd: SubCommand,
    /// 索引与数据库所在目录
    #[arg(short, long, env = "INDEX_DIR", default_value = default_config_dir())]
    pub conf_dir: ConfDir,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCommand {
    /// 从口令列表构建索引
    Build(BuildCommand),
    /// 在索引中搜索相似口令
    Search(SearchCommand),
    /// 将已有分片重新合并为最终索引
    Merge(MergeCommand),
    /// 显示索引信息
    Show(ShowCommand),
}

/// 构建产物所在目录
#[derive(Debug, Clone)]
pub struct ConfDir {
    path: PathBuf,
}

impl ConfDir {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    /// 返回数据库文件的路径
    pub fn database(&self) -> PathBuf {
        self.path.join("pwsearch.db")
    }

    /// 返回量化器文件的路径
    pub fn quantizer(&self) -> PathBuf {
        self.path.join("quantizer.bin")
    }

    /// 返回分片所在目录
    pub fn shard_dir(&self) -> PathBuf {
        self.path.join("shards")
    }

    /// 返回第 n 个分片的路径
    pub fn shard(&self, n: usize) -> PathBuf {
        self.shard_dir().join(format!("shard.{n}.ivf"))
    }

    /// 返回所有分片的路径，按编号排序，遇到第一个缺失的编号即停止
    pub fn all_shards(&self) -> Vec<PathBuf> {
        let mut paths = vec![];
        for i in 0.. {
            let path = self.shard(i);
            if !path.exists() {
                break;
            }
            paths.push(path);
        }
        paths
    }

    /// 返回合并后的倒排列表文件路径
    pub fn merged_index(&self) -> PathBuf {
        self.path.join("index.ivfdata")
    }

    /// 返回构建状态文件的路径
    pub fn build_state(&self) -> PathBuf {
        self.path.join("build.json")
    }

    /// 返回构建锁文件的路径
    pub fn build_lock(&self) -> PathBuf {
        self.path.join("build.lock")
    }
}

impl FromStr for ConfDir {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self { path: PathBuf::from(s) })
    }
}

impl fmt::Display for ConfDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// 聚类中心数量的选择策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NlistPolicy {
    /// 取语料数量的平方根
    Sqrt,
    /// 固定数量
    Fixed(usize),
}

impl NlistPolicy {
    pub fn resolve(&self, total: u64) -> usize {
        match *self {
            Self::Sqrt => (total.isqrt() as usize).max(1),
            Self::Fixed(n) => n,
        }
    }
}

impl FromStr for NlistPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqrt" => Ok(Self::Sqrt),
            _ => s.parse().map(Self::Fixed).map_err(|_| format!("无效的 nlist: {s}")),
        }
    }
}

impl fmt::Display for NlistPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sqrt => write!(f, "sqrt"),
            Self::Fixed(n) => write!(f, "{n}"),
        }
    }
}

/// 倒排列表中向量的存储方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    /// 原始 f32 向量
    Flat,
    /// 对残差进行乘积量化，m 个子向量，每个子向量 nbits 位
    Pq { m: usize, nbits: u32 },
}

impl FromStr for CodecKind {
    type Err = String;

    /// 支持 `flat`、`pq8`、`pq16x6` 三种写法
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        if lower == "flat" {
            return Ok(Self::Flat);
        }
        let Some(rest) = lower.strip_prefix("pq") else {
            return Err(format!("无效的编码方式: {s}"));
        };
        let (m, nbits) = match rest.split_once('x') {
            Some((m, nbits)) => (m, nbits),
            None => (rest, "8"),
        };
        let m = m.parse().map_err(|_| format!("无效的子向量数量: {s}"))?;
        let nbits = nbits.parse().map_err(|_| format!("无效的编码位数: {s}"))?;
        Ok(Self::Pq { m, nbits })
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Pq { m, nbits } => write!(f, "pq{m}x{nbits}"),
        }
    }
}

/// 经过校验的索引构建参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// 向量维度
    pub dimension: usize,
    /// 每个分片包含的条目数量
    pub chunk_size: usize,
    /// 聚类中心数量策略
    pub nlist: NlistPolicy,
    /// 训练批次大小，不填时使用 nlist 的倍数
    pub training_batch_size: Option<u64>,
    /// 训练批次大小为 nlist 的多少倍
    pub training_multiplier: u64,
    /// 向量编码方式
    pub codec: CodecKind,
    /// k-means 最大迭代次数
    pub max_iter: usize,
    /// k-means 随机种子
    pub seed: u64,
    /// 第一个条目的 ID
    pub id_base: u64,
    /// 合并后是否保留分片文件
    pub keep_shards: bool,
    /// 嵌入服务失败后的最大重试次数
    pub max_retries: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            chunk_size: 50000,
            nlist: NlistPolicy::Sqrt,
            training_batch_size: None,
            training_multiplier: 40,
            codec: CodecKind::Pq { m: 8, nbits: 8 },
            max_iter: 20,
            seed: 42,
            id_base: 0,
            keep_shards: false,
            max_retries: 3,
        }
    }
}

impl IndexConfig {
    /// 检查参数之间是否一致
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(msg));
        if self.dimension == 0 {
            return fail("向量维度必须大于 0".to_string());
        }
        if self.chunk_size == 0 {
            return fail("分片大小必须大于 0".to_string());
        }
        if self.nlist == NlistPolicy::Fixed(0) {
            return fail("nlist 必须大于 0".to_string());
        }
        if self.training_batch_size == Some(0) || self.training_multiplier == 0 {
            return fail("训练批次大小必须大于 0".to_string());
        }
        if self.max_iter == 0 {
            return fail("k-means 迭代次数必须大于 0".to_string());
        }
        self.validate_ids(0)?;
        if let CodecKind::Pq { m, nbits } = self.codec {
            if m == 0 || self.dimension % m != 0 {
                return fail(format!("维度 {} 无法被子向量数量 {m} 整除", self.dimension));
            }
            if !(1..=8).contains(&nbits) {
                return fail(format!("PQ 编码位数必须在 1 ~ 8 之间，当前为 {nbits}"));
            }
        }
        Ok(())
    }

    /// 数据库以 i64 保存 ID，`id_base + total_items` 不能超过 `i64::MAX`
    pub fn validate_ids(&self, total_items: u64) -> Result<()> {
        match self.id_base.checked_add(total_items) {
            Some(end) if end <= i64::MAX as u64 => Ok(()),
            _ => Err(Error::IdOutOfRange(self.id_base.saturating_add(total_items))),
        }
    }

    /// 训练所需的样本数量
    pub fn training_size(&self, total: u64, nlist: usize) -> u64 {
        match self.training_batch_size {
            Some(size) => size,
            None => (self.training_multiplier * nlist as u64).min(total),
        }
    }

    /// 两次构建能否共用同一批产物
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.dimension == other.dimension
            && self.chunk_size == other.chunk_size
            && self.nlist == other.nlist
            && self.codec == other.codec
            && self.id_base == other.id_base
    }
}

#[derive(Parser, Debug, Clone)]
pub struct IndexOptions {
    /// 向量维度，必须与嵌入模型输出一致
    #[arg(short, long, env = "DIMENSION", default_value_t = 384)]
    pub dimension: usize,
    /// 每个分片包含的口令数量
    #[arg(short = 'b', long, env = "CHUNK_SIZE", default_value_t = 50000)]
    pub chunk_size: usize,
    /// 聚类中心数量，`sqrt` 表示取语料数量的平方根
    #[arg(long, env = "NLIST", default_value = "sqrt")]
    pub nlist: NlistPolicy,
    /// 训练批次大小，默认为 nlist 的若干倍
    #[arg(long, env = "TRAINING_BATCH_SIZE")]
    pub training_batch_size: Option<u64>,
    /// 训练批次大小为 nlist 的多少倍，推荐 20 ~ 40
    #[arg(long, default_value_t = 40)]
    pub training_multiplier: u64,
    /// 向量编码方式：flat, pq8, pq16x6 ...
    #[arg(long, env = "CODEC", default_value = "pq8")]
    pub codec: CodecKind,
    /// k-means 最大迭代次数
    #[arg(long, default_value_t = 20)]
    pub max_iter: usize,
    /// k-means 随机种子
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// 第一个口令的 ID
    #[arg(long, default_value_t = 0)]
    pub id_base: u64,
    /// 合并后保留分片文件
    #[arg(long)]
    pub keep_shards: bool,
    /// 嵌入服务失败时的最大重试次数
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,
}

impl IndexOptions {
    pub fn to_config(&self) -> IndexConfig {
        IndexConfig {
            dimension: self.dimension,
            chunk_size: self.chunk_size,
            nlist: self.nlist,
            training_batch_size: self.training_batch_size,
            training_multiplier: self.training_multiplier,
            codec: self.codec,
            max_iter: self.max_iter,
            seed: self.seed,
            id_base: self.id_base,
            keep_shards: self.keep_shards,
            max_retries: self.max_retries,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbedderKind {
    /// OpenAI 兼容的 HTTP 嵌入服务
    Http,
    /// 本地字符 n-gram 哈希
    Hash,
}

/// 嵌入服务的连接参数，会随构建状态一起保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedderSettings {
    pub kind: EmbedderKind,
    pub url: String,
    pub model: String,
    pub timeout: Duration,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct EmbedderOptions {
    /// 嵌入方式
    #[arg(long, env = "EMBEDDER", value_enum)]
    pub embedder: Option<EmbedderKind>,
    /// 嵌入服务地址
    #[arg(long, env = "EMBEDDING_URL")]
    pub embedding_url: Option<String>,
    /// 嵌入模型名称
    #[arg(long, env = "EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,
    /// 嵌入服务超时时间，单位为秒
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub embedding_timeout: u64,
    /// 嵌入服务的 API key
    #[arg(long, env = "EMBEDDING_API_KEY", hide_env_values = true)]
    pub embedding_api_key: Option<String>,
}

impl EmbedderOptions {
    /// 使用命令行参数覆盖已保存的设置
    pub fn resolve(&self, saved: Option<&EmbedderSettings>) -> EmbedderSettings {
        let default = EmbedderSettings {
            kind: EmbedderKind::Http,
            url: "http://127.0.0.1:8080/v1".to_string(),
            model: "all-MiniLM-L6-v2".to_string(),
            timeout: Duration::from_secs(self.embedding_timeout),
            api_key: None,
        };
        let base = saved.unwrap_or(&default);
        EmbedderSettings {
            kind: self.embedder.unwrap_or(base.kind),
            url: self.embedding_url.clone().unwrap_or_else(|| base.url.clone()),
            model: self.embedding_model.clone().unwrap_or_else(|| base.model.clone()),
            timeout: Duration::from_secs(self.embedding_timeout),
            api_key: self.embedding_api_key.clone(),
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SearchOptions {
    /// 每个查询返回的结果数量
    #[arg(short, value_name = "K", default_value_t = 15)]
    pub k: usize,
    /// 搜索的倒排列表数量
    #[arg(long, default_value_t = 8)]
    pub nprobe: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nlist() {
        assert_eq!("sqrt".parse::<NlistPolicy>().unwrap(), NlistPolicy::Sqrt);
        assert_eq!("128".parse::<NlistPolicy>().unwrap(), NlistPolicy::Fixed(128));
        assert!("abc".parse::<NlistPolicy>().is_err());
        assert_eq!(NlistPolicy::Sqrt.resolve(1_000_000), 1000);
        assert_eq!(NlistPolicy::Sqrt.resolve(0), 1);
    }

    #[test]
    fn test_parse_codec() {
        assert_eq!("flat".parse::<CodecKind>().unwrap(), CodecKind::Flat);
        assert_eq!("PQ8".parse::<CodecKind>().unwrap(), CodecKind::Pq { m: 8, nbits: 8 });
        assert_eq!("pq16x6".parse::<CodecKind>().unwrap(), CodecKind::Pq { m: 16, nbits: 6 });
        assert!("ivf".parse::<CodecKind>().is_err());
        assert_eq!(CodecKind::Pq { m: 4, nbits: 8 }.to_string(), "pq4x8");
    }

    #[test]
    fn test_validate() {
        assert!(IndexConfig::default().validate().is_ok());

        let config = IndexConfig { codec: CodecKind::Pq { m: 5, nbits: 8 }, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = IndexConfig { chunk_size: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = IndexConfig { codec: CodecKind::Pq { m: 8, nbits: 9 }, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_conf_dir() {
        let opts = Opts::try_parse_from(["pwsearch", "-c", "/tmp/pwsearch-index", "show"]).unwrap();
        assert_eq!(opts.conf_dir.path(), Path::new("/tmp/pwsearch-index"));

        // 未指定时使用默认目录
        let opts = Opts::try_parse_from(["pwsearch", "show", "--lists"]).unwrap();
        assert!(!opts.conf_dir.path().as_os_str().is_empty());
    }

    #[test]
    fn test_validate_ids() {
        let config = IndexConfig { id_base: i64::MAX as u64 - 100, ..Default::default() };
        assert!(config.validate_ids(100).is_ok());
        assert!(matches!(config.validate_ids(101), Err(Error::IdOutOfRange(_))));

        let config = IndexConfig { id_base: 1 << 63, ..Default::default() };
        assert!(matches!(config.validate(), Err(Error::IdOutOfRange(_))));
        assert!(matches!(config.validate_ids(u64::MAX), Err(Error::IdOutOfRange(u64::MAX))));
    }

    #[test]
    fn test_training_size() {
        let config = IndexConfig::default();
        assert_eq!(config.training_size(1_000_000, 1000), 40000);
        assert_eq!(config.training_size(100, 10), 100);

        let config = IndexConfig { training_batch_size: Some(500), ..Default::default() };
        assert_eq!(config.training_size(100, 10), 500);
    }

    #[test]
    fn test_conf_dir_shards() {
        let dir = tempfile::tempdir().unwrap();
        let conf_dir = ConfDir::new(dir.path());
        std::fs::create_dir_all(conf_dir.shard_dir()).unwrap();
        std::fs::write(conf_dir.shard(0), b"").unwrap();
        std::fs::write(conf_dir.shard(1), b"").unwrap();
        std::fs::write(conf_dir.shard(3), b"").unwrap();
        assert_eq!(conf_dir.all_shards(), vec![conf_dir.shard(0), conf_dir.shard(1)]);
    }
}
