use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use catchy::config::{DEFAULT_CONNECTIONS, DEFAULT_MAX_RETRIES, DEFAULT_SEGMENT_SIZE};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Single URL to download (optional, if provided, tasks-file is ignored)
    #[arg(index = 1)]
    pub url: Option<String>,

    /// Path to the file containing URLs (one per line)
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    pub tasks_file: PathBuf,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    pub download_dir: PathBuf,

    /// File name for the download (single URL only; derived from the URL otherwise)
    #[arg(short = 'o', long)]
    pub output: Option<String>,

    /// Connections per file (segmented download)
    #[arg(short = 'n', long, default_value_t = DEFAULT_CONNECTIONS)]
    pub connections: usize,

    /// Maximum segment size in bytes
    #[arg(short = 's', long = "segment-size", default_value_t = DEFAULT_SEGMENT_SIZE)]
    pub segment_size: u64,

    /// Failed attempts after which a segment gives up
    #[arg(short = 'r', long = "max-retries", default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Keep the connection count fixed instead of adapting it to throughput
    #[arg(long = "no-dynamic")]
    pub no_dynamic: bool,

    /// Maximum number of concurrent downloads (defaults to number of logical CPUs)
    #[arg(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// List unfinished and completed downloads in the download directory
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Log output format (the LOG_FORMAT environment variable also selects json)
    #[arg(long = "log-format", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}
