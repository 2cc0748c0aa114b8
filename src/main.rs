mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Args, LogFormat};
use crate::commands::DownloadOptions;

/// Logs go to stderr alongside the progress bars; keep the default filter quiet.
fn init_tracing(format: LogFormat) {
    let json_format = format == LogFormat::Json
        || std::env::var("LOG_FORMAT")
            .map(|v| v.to_lowercase() == "json")
            .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("catchy=warn"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut args = Args::parse();
    init_tracing(args.log_format);

    if args.url.is_none() {
        if let Ok(abs_input) = std::fs::canonicalize(&args.tasks_file) {
            args.tasks_file = abs_input;
        }
    }
    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    if args.list {
        return crate::commands::list_downloads(args.download_dir).await;
    }

    let options = DownloadOptions {
        directory: args.download_dir,
        output: args.output,
        connections: args.connections,
        segment_size: args.segment_size,
        max_retries: args.max_retries,
        dynamic_connections: !args.no_dynamic,
        concurrency: args.concurrency,
    };

    match args.url {
        Some(url) => crate::commands::run_single_download(url, options).await,
        None => crate::commands::run_downloads(args.tasks_file, options).await,
    }
}

