use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tracing::{info, warn};

use catchy::finalize::remove_temp_dir;
use catchy::segment::SegmentStatus;
use catchy::store::{self, SnapshotRecord};
use catchy::utils::{get_filename_from_url, sanitize_filename};
use catchy::{
    Coordinator, EngineConfig, EngineError, TaskEvent, TaskStatus, TransferEvent, TransferSpec,
};

/// How often a running transfer's snapshot is written to disk.
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub directory: PathBuf,
    /// File name override, only honoured for single downloads.
    pub output: Option<String>,
    pub connections: usize,
    pub segment_size: u64,
    pub max_retries: u32,
    pub dynamic_connections: bool,
    pub concurrency: Option<usize>,
}

impl DownloadOptions {
    fn spec(&self, url: &str) -> Result<TransferSpec> {
        let filename = match &self.output {
            Some(name) => sanitize_filename(name),
            None => get_filename_from_url(url)
                .with_context(|| format!("Failed to derive a file name from {}", url))?,
        };
        Ok(TransferSpec::new(url, filename, &self.directory)
            .with_connections(self.connections)
            .with_segment_size(self.segment_size)
            .with_max_retries(self.max_retries)
            .with_dynamic_connections(self.dynamic_connections))
    }
}

enum Outcome {
    Completed(PathBuf),
    Failed(String),
}

/// Progress bar and completion signal for one running transfer.
struct Watcher {
    bar: ProgressBar,
    spec: TransferSpec,
    done: Option<oneshot::Sender<Outcome>>,
    downloaded: u64,
    total: u64,
}

type Watchers = Arc<Mutex<HashMap<String, Watcher>>>;

/// One CLI invocation: a coordinator plus the progress display fed by its events.
struct Session {
    coordinator: Coordinator,
    watchers: Watchers,
    multi_progress: MultiProgress,
}

impl Session {
    fn new(total_files: usize) -> Result<Arc<Self>> {
        let (coordinator, events) = Coordinator::with_default_client(EngineConfig::default())
            .context("Failed to build HTTP client")?;

        let multi_progress = MultiProgress::new();
        multi_progress.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));

        let header_pb = multi_progress.add(ProgressBar::new(0));
        header_pb.set_style(ProgressStyle::default_bar().template("{msg}")?);
        header_pb.set_message(format!("Summary: Files: 0/{} | Downloaded: 0 B", total_files));

        let watchers: Watchers = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(route_events(events, watchers.clone(), header_pb, total_files));

        Ok(Arc::new(Self {
            coordinator,
            watchers,
            multi_progress,
        }))
    }

    fn add_bar(&self, filename: &str) -> Result<ProgressBar> {
        let pb = self.multi_progress.add(ProgressBar::new(0));
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")?
                .progress_chars("=>-"),
        );
        pb.set_message(filename.to_string());
        Ok(pb)
    }

    /// Runs one URL to completion, resuming saved progress when there is some.
    async fn download(&self, url: &str, options: &DownloadOptions) -> Result<PathBuf> {
        let spec = options.spec(url)?;
        let (done_tx, mut done_rx) = oneshot::channel();
        let watcher = Watcher {
            bar: self.add_bar(&spec.filename)?,
            spec: spec.clone(),
            done: Some(done_tx),
            downloaded: 0,
            total: 0,
        };
        let (id, spec) = self.launch(spec, watcher).await?;

        let start = tokio::time::Instant::now() + SNAPSHOT_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, SNAPSHOT_INTERVAL);
        loop {
            tokio::select! {
                outcome = &mut done_rx => {
                    return match outcome {
                        Ok(Outcome::Completed(path)) => {
                            store::remove(&spec.directory, &id)
                                .await
                                .context("Failed to remove saved progress")?;
                            Ok(path)
                        }
                        Ok(Outcome::Failed(message)) => Err(anyhow!(message)),
                        Err(_) => Err(anyhow!("event stream closed before the download finished")),
                    };
                }
                _ = ticker.tick() => self.save_snapshot(&id, &spec).await,
            }
        }
    }

    /// Registers the watcher and starts the transfer, restoring it from a
    /// saved snapshot of the same URL and destination when one exists.
    async fn launch(&self, spec: TransferSpec, mut watcher: Watcher) -> Result<(String, TransferSpec)> {
        let saved = match store::find(&spec.directory, &spec.url, &spec.filename).await {
            Ok(saved) => saved,
            Err(e) => {
                warn!(url = %spec.url, error = %e, "could not read saved progress");
                None
            }
        };

        if let Some(record) = saved {
            let id = record.id.clone();
            let restored_spec = record.spec.clone();
            watcher.spec = restored_spec.clone();
            self.watchers.lock().await.insert(id.clone(), watcher);

            match self
                .coordinator
                .restore(&id, record.spec, record.snapshot)
                .await
            {
                Ok(()) => {
                    info!(transfer = %id, url = %restored_spec.url, "resuming saved download");
                    return Ok((id, restored_spec));
                }
                Err(e) => {
                    warn!(transfer = %id, error = %e, "saved progress unusable, starting over");
                    watcher = self
                        .watchers
                        .lock()
                        .await
                        .remove(&id)
                        .ok_or_else(|| anyhow!("transfer {} lost its progress display", id))?;
                    watcher.spec = spec.clone();
                    store::remove(&restored_spec.directory, &id).await?;
                    remove_temp_dir(&restored_spec.temp_directory(&id)).await;
                }
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.watchers.lock().await.insert(id.clone(), watcher);
        self.coordinator.start(&id, spec.clone()).await?;
        Ok((id, spec))
    }

    async fn save_snapshot(&self, id: &str, spec: &TransferSpec) {
        match self.coordinator.snapshot(id).await {
            Ok(snapshot) => {
                let record = SnapshotRecord::new(id, spec.clone(), snapshot);
                if let Err(e) = store::save(&record).await {
                    warn!(transfer = id, error = %e, "failed to save progress");
                }
            }
            // Finished in the meantime.
            Err(EngineError::UnknownTransfer(_) | EngineError::TaskClosed) => {}
            Err(e) => warn!(transfer = id, error = %e, "failed to query progress"),
        }
    }

    /// Silently pauses every running transfer and saves its snapshot.
    async fn pause_all(&self) {
        for id in self.coordinator.ids().await {
            if let Err(e) = self.coordinator.pause(&id, true).await {
                warn!(transfer = %id, error = %e, "failed to pause");
                continue;
            }
            let spec = self
                .watchers
                .lock()
                .await
                .get(&id)
                .map(|w| w.spec.clone());
            if let Some(spec) = spec {
                self.save_snapshot(&id, &spec).await;
            }
        }
    }
}

async fn route_events(
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    watchers: Watchers,
    header_pb: ProgressBar,
    total_files: usize,
) {
    let mut finished = 0usize;
    while let Some(TransferEvent { id, event }) = events.recv().await {
        let mut guard = watchers.lock().await;
        let Some(watcher) = guard.get_mut(&id) else {
            continue;
        };

        match event {
            TaskEvent::Progress(progress) => {
                watcher.downloaded = progress.downloaded_bytes;
                watcher.total = progress.total_bytes;
                if progress.total_bytes > 0 {
                    watcher.bar.set_length(progress.total_bytes);
                }
                watcher.bar.set_position(progress.downloaded_bytes);
                let message = if progress.status == TaskStatus::Downloading {
                    format!("{} ({} conn)", watcher.spec.filename, progress.connections)
                } else {
                    format!("{} {}", progress.status, watcher.spec.filename)
                };
                watcher.bar.set_message(message);
            }
            TaskEvent::Complete { path } => {
                finished += 1;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| watcher.spec.filename.clone());
                watcher.bar.finish_with_message(format!("Completed {}", name));
                if let Some(done) = watcher.done.take() {
                    let _ = done.send(Outcome::Completed(path));
                }
            }
            TaskEvent::Error { message } => {
                finished += 1;
                watcher
                    .bar
                    .abandon_with_message(format!("Failed {}: {}", watcher.spec.filename, message));
                if let Some(done) = watcher.done.take() {
                    let _ = done.send(Outcome::Failed(message));
                }
            }
        }

        let downloaded: u64 = guard.values().map(|w| w.downloaded).sum();
        let known: u64 = guard.values().map(|w| w.total).sum();
        header_pb.set_message(format!(
            "Summary: Files: {}/{} | Downloaded: {} / {}",
            finished,
            total_files,
            HumanBytes(downloaded),
            HumanBytes(known)
        ));
    }
}

async fn read_tasks_file(input: &Path) -> Result<Vec<String>> {
    let file = fs::File::open(input)
        .await
        .with_context(|| format!("Failed to open input file: {:?}", input))?;
    let mut lines = BufReader::new(file).lines();
    let mut urls = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let url = line.trim();
        if url.is_empty() || url.starts_with('#') {
            continue;
        }
        urls.push(url.to_string());
    }
    Ok(urls)
}

pub async fn run_downloads(input: PathBuf, options: DownloadOptions) -> Result<()> {
    let urls = read_tasks_file(&input).await?;
    if urls.is_empty() {
        bail!("No URLs found in {:?}", input);
    }
    let options = DownloadOptions {
        output: None,
        ..options
    };
    download_all(urls, options).await
}

pub async fn run_single_download(url: String, options: DownloadOptions) -> Result<()> {
    download_all(vec![url], options).await
}

async fn download_one(
    session: Arc<Session>,
    semaphore: Arc<Semaphore>,
    url: String,
    options: Arc<DownloadOptions>,
) -> Result<()> {
    let _permit = semaphore.acquire().await?;
    match session.download(&url, &options).await {
        Ok(path) => {
            info!(url = %url, path = %path.display(), "download finished");
            Ok(())
        }
        Err(e) => {
            eprintln!("Failed to download {}: {:#}", url, e);
            Err(e)
        }
    }
}

async fn download_all(urls: Vec<String>, options: DownloadOptions) -> Result<()> {
    if !options.directory.exists() {
        fs::create_dir_all(&options.directory)
            .await
            .context("Failed to create output directory")?;
    }

    let total_files = urls.len();
    let session = Session::new(total_files)?;
    let concurrency = options.concurrency.unwrap_or_else(num_cpus::get).max(1);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let options = Arc::new(options);
    let mut handles = vec![];

    for url in urls {
        let session = session.clone();
        let semaphore = semaphore.clone();
        let options = options.clone();
        handles.push(tokio::spawn(download_one(session, semaphore, url, options)));
    }

    let wait_all = async {
        let mut failed = 0usize;
        for handle in handles {
            let result: Result<()> = handle.await?;
            if result.is_err() {
                failed += 1;
            }
        }
        Ok::<usize, anyhow::Error>(failed)
    };

    tokio::select! {
        failed = wait_all => {
            let failed = failed?;
            if failed > 0 {
                bail!("{} of {} downloads failed", failed, total_files);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            warn!("Ctrl+C received - saving progress...");
            session.pause_all().await;
            eprintln!("Downloads paused. Run the same command again to resume.");
        }
    }
    Ok(())
}

pub async fn list_downloads(output: PathBuf) -> Result<()> {
    if !output.exists() {
        println!("Output directory '{:?}' does not exist.", output);
        println!("Tip: If you used a custom output directory, please specify it with --download-dir");
        return Ok(());
    }

    let records = store::list(&output)
        .await
        .context("Failed to read saved downloads")?;

    let mut completed = Vec::new();
    let mut entries = fs::read_dir(&output)
        .await
        .with_context(|| format!("Failed to read {:?}", output))?;
    while let Some(entry) = entries.next_entry().await? {
        let filename = entry.file_name().to_string_lossy().to_string();
        if filename.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            let modified = metadata.modified().ok().map(DateTime::<Local>::from);
            completed.push((filename, metadata.len(), modified));
        }
    }
    completed.sort();

    let active_bytes: u64 = records.iter().map(|r| r.snapshot.downloaded).sum();
    let active_known: u64 = records.iter().map(|r| r.snapshot.size).sum();
    let completed_bytes: u64 = completed.iter().map(|(_, size, _)| *size).sum();
    println!(
        "Summary: Completed: {} | Unfinished: {} | Downloaded: {} / {}",
        completed.len(),
        records.len(),
        HumanBytes(active_bytes + completed_bytes),
        HumanBytes(active_known + completed_bytes)
    );
    println!();

    println!("{:<50} {:<12} {:<10} {:<12} {:<17}", "Filename", "Status", "Progress", "Size", "Updated");
    println!("{:-<50} {:-<12} {:-<10} {:-<12} {:-<17}", "", "", "", "", "");

    for record in &records {
        let snapshot = &record.snapshot;
        let status = if snapshot.segments.iter().any(|s| s.status == SegmentStatus::Error) {
            TaskStatus::Error
        } else {
            TaskStatus::Paused
        };
        let progress = if snapshot.size > 0 {
            format!("{:.2}%", snapshot.downloaded as f64 / snapshot.size as f64 * 100.0)
        } else {
            "?".to_string()
        };
        let saved_at = record.saved_at.with_timezone(&Local);
        println!(
            "{:<50} {:<12} {:<10} {:<12} {:<17}",
            record.spec.filename,
            status.to_string(),
            progress,
            HumanBytes(snapshot.size).to_string(),
            saved_at.format("%Y-%m-%d %H:%M").to_string()
        );
    }

    for (filename, size, modified) in &completed {
        let modified = modified
            .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "{:<50} {:<12} {:<10} {:<12} {:<17}",
            filename,
            TaskStatus::Completed.to_string(),
            "100.00%",
            HumanBytes(*size).to_string(),
            modified
        );
    }

    if records.is_empty() && completed.is_empty() {
        println!("No unfinished or completed downloads found in '{:?}'.", output);
    }

    Ok(())
}
