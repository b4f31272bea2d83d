use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;

use crate::Opts;
use crate::cli::SubCommandExtend;
use crate::config::{EmbedderOptions, SearchOptions};
use crate::db::SqliteRowStore;
use crate::embedding::AnyEmbedder;
use crate::pipeline::{BuildState, CorpusReader};
use crate::searcher::{SearchReport, Searcher};

#[derive(Parser, Debug, Clone)]
pub struct SearchCommand {
    #[command(flatten)]
    pub search: SearchOptions,
    #[command(flatten)]
    pub embedder: EmbedderOptions,
    /// 被搜索的口令
    #[arg(short, long, required_unless_present = "wordlist", conflicts_with = "wordlist")]
    pub password: Option<String>,
    /// 口令列表，每行一条，忽略空行和以 # 开头的行
    #[arg(short, long)]
    pub wordlist: Option<PathBuf>,
    /// 输出格式
    #[arg(long, value_name = "FORMAT", default_value = "table")]
    pub format: OutputFormat,
}

impl SubCommandExtend for SearchCommand {
    async fn run(&self, opts: &Opts) -> Result<()> {
        let state = BuildState::load(opts.conf_dir.build_state())?
            .with_context(|| format!("{} 中没有已构建的索引", opts.conf_dir))?;

        let settings = self.embedder.resolve(state.embedder.as_ref());
        let embedder = AnyEmbedder::from_settings(&settings, state.config.dimension)?;
        let store = SqliteRowStore::open(opts.conf_dir.database()).await?;
        let searcher = Searcher::open(&opts.conf_dir, embedder, store)?.nprobe(self.search.nprobe);

        let mut reports = vec![];
        for query in self.queries().await? {
            let report = searcher.search(&query, self.search.k).await;
            reports.push((query, report));
        }
        print_result(&reports, self.format)
    }
}

impl SearchCommand {
    async fn queries(&self) -> Result<Vec<String>> {
        if let Some(password) = &self.password {
            return Ok(vec![password.clone()]);
        }
        let mut queries = vec![];
        if let Some(path) = &self.wordlist {
            let mut reader = CorpusReader::open(path).await?;
            while let Some(line) = reader.next_line().await? {
                if !line.is_empty() && !line.starts_with('#') {
                    queries.push(line);
                }
            }
        }
        Ok(queries)
    }
}

#[derive(Serialize)]
struct JsonMatch<'a> {
    password: &'a str,
    distance: f32,
}

#[derive(Serialize)]
struct JsonResult<'a> {
    query: &'a str,
    results: Vec<JsonMatch<'a>>,
    #[serde(skip_serializing_if = "<[i64]>::is_empty")]
    missing: &'a [i64],
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

fn print_result(reports: &[(String, SearchReport)], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let output = reports
                .iter()
                .map(|(query, report)| JsonResult {
                    query,
                    results: report
                        .results
                        .iter()
                        .map(|(password, distance)| JsonMatch { password, distance: *distance })
                        .collect(),
                    missing: &report.missing,
                    error: report.error.as_deref(),
                })
                .collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&output)?)
        }
        OutputFormat::Table => {
            for (query, report) in reports {
                println!("# {query}");
                if let Some(error) = &report.error {
                    eprintln!("查询失败: {error}");
                }
                for (password, distance) in &report.results {
                    println!("{distance:.4}\t{password}");
                }
            }
        }
    }
    Ok(())
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OutputFormat {
    Json,
    Table,
}
