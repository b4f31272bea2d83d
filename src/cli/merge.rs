use anyhow::Result;
use clap::Parser;
use log::info;
use tokio::task::spawn_blocking;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::pipeline::merge_index;

#[derive(Parser, Debug, Clone)]
pub struct MergeCommand {}

impl SubCommandExtend for MergeCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let conf_dir = opts.conf_dir.clone();
        let stats = spawn_blocking(move || merge_index(&conf_dir)).await??;
        info!("合并成功：{} 个分片，{} 条向量，不平衡度 {:.2}", stats.shards, stats.ntotal, stats.imbalance);
        Ok(())
    }
}
