use anyhow::Result;
use clap::Parser;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::db::{RowStore, SqliteRowStore};
use crate::ivf::{InvertedLists, IvfQuantizer, OnDiskInvlists};
use crate::pipeline::BuildState;

#[derive(Parser, Debug, Clone)]
pub struct ShowCommand {
    /// 打印每个倒排列表的长度
    #[arg(long)]
    pub lists: bool,
}

impl SubCommandExtend for ShowCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let conf_dir = &opts.conf_dir;
        println!("目录: {conf_dir}");

        match BuildState::load(conf_dir.build_state())? {
            Some(state) => {
                println!("阶段: {:?}", state.stage);
                println!("维度: {}", state.config.dimension);
                println!("编码: {}", state.config.codec);
                println!("nlist: {} ({})", state.nlist, state.config.nlist);
                println!("分片: {}/{}", state.chunks_done, state.chunks_total);
                println!("口令: {}/{}", state.items_done(), state.total_items);
                if let Some(fingerprint) = &state.fingerprint {
                    println!("量化器指纹: {fingerprint}");
                }
                if let Some(error) = &state.last_error {
                    println!("上次错误: {error}");
                }
            }
            None => println!("尚未开始构建"),
        }

        if conf_dir.quantizer().exists() {
            let quantizer = IvfQuantizer::load(conf_dir.quantizer())?;
            println!("每条向量字节数: {}", quantizer.code_size());
        }

        if conf_dir.merged_index().exists() {
            let invlists = OnDiskInvlists::load(conf_dir.merged_index())?;
            let lens = (0..invlists.nlist()).map(|i| invlists.list_len(i)).collect::<Vec<_>>();
            println!("索引向量数: {}", invlists.ntotal());
            println!(
                "倒排列表长度: {} ~ {}",
                lens.iter().min().copied().unwrap_or_default(),
                lens.iter().max().copied().unwrap_or_default()
            );
            println!("不平衡度: {:.2}", invlists.imbalance());
            if self.lists {
                for (i, len) in lens.iter().enumerate() {
                    println!("{i}\t{len}");
                }
            }
        }

        if conf_dir.database().exists() {
            let store = SqliteRowStore::open(conf_dir.database()).await?;
            println!("数据库行数: {}", store.count().await?);
        }
        Ok(())
    }
}
