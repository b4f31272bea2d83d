pub mod cli;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod ivf;
pub mod kmeans;
pub mod pipeline;
pub mod searcher;
pub mod utils;

pub use config::Opts;
pub use error::{Error, Result};
pub use searcher::{SearchReport, Searcher};
