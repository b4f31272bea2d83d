use clap::Parser;
use env_logger::Env;
use pwsearch::cli::SubCommandExtend;
use pwsearch::config::{Opts, SubCommand};
use tikv_jemallocator::Jemalloc;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Build(config) => config.run(&opts).await,
        SubCommand::Search(config) => config.run(&opts).await,
        SubCommand::Merge(config) => config.run(&opts).await,
        SubCommand::Show(config) => config.run(&opts).await,
    }
}
