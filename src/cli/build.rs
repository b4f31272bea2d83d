use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::info;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::config::{EmbedderOptions, IndexOptions};
use crate::db::SqliteRowStore;
use crate::embedding::AnyEmbedder;
use crate::pipeline::{BuildState, Pipeline};

#[derive(Parser, Debug, Clone)]
pub struct BuildCommand {
    #[command(flatten)]
    pub index: IndexOptions,
    #[command(flatten)]
    pub embedder: EmbedderOptions,
    /// 删除已有的量化器、分片、索引和数据库记录后重新构建
    #[arg(long)]
    pub fresh: bool,
    /// 口令列表，每行一条
    pub corpus: PathBuf,
}

impl SubCommandExtend for BuildCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        fs::create_dir_all(opts.conf_dir.path())?;

        let config = self.index.to_config();
        let saved = match self.fresh {
            true => None,
            false => BuildState::load(opts.conf_dir.build_state())?,
        };
        let settings = self.embedder.resolve(saved.and_then(|s| s.embedder).as_ref());
        let embedder = AnyEmbedder::from_settings(&settings, config.dimension)?;
        let store = SqliteRowStore::open(opts.conf_dir.database()).await?;

        let report = Pipeline::new(opts.conf_dir.clone(), config, Arc::new(embedder), Arc::new(store))
            .embedder_settings(settings)
            .fresh(self.fresh)
            .run(&self.corpus)
            .await?;

        info!(
            "构建索引成功：{} 条口令，{} 个分片（本次构建 {} 个），数据库 {} 行",
            report.total_items, report.chunks, report.built_chunks, report.rows
        );
        println!("{}", report.index_path.display());
        Ok(())
    }
}
