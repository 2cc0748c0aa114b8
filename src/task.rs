//! Download task: the state machine driving one transfer.
//!
//! A task runs as a single actor. Commands arrive over a channel from its
//! [`TaskHandle`], segment workers report deltas over a second channel, and
//! two timers (progress, health check) tick inside the same loop. Only the
//! actor mutates task state, one message at a time.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::fs::{self, OpenOptions};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, TransferSpec};
use crate::controller;
use crate::error::{EngineError, Result};
use crate::events::{Progress, TaskEvent, TaskStatus};
use crate::finalize::{finalize, remove_temp_dir, FinalizeOutcome};
use crate::http::HttpClient;
use crate::probe::{probe, ProbeResult};
use crate::segment::{plan_segments, Segment, SegmentStatus, Snapshot};
use crate::worker::{SegmentJob, SegmentWorker, WorkerControl, WorkerMessage, WorkerOutcome};

enum Command {
    Pause {
        silent: bool,
        reply: oneshot::Sender<bool>,
    },
    Resume {
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Command surface of a running task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Pauses the transfer. Returns `false` when it was not downloading.
    pub async fn pause(&self, silent: bool) -> Result<bool> {
        self.request(|reply| Command::Pause { silent, reply }).await
    }

    /// Resumes a paused (or never started) transfer.
    pub async fn resume(&self) -> Result<bool> {
        self.request(|reply| Command::Resume { reply }).await
    }

    /// Aborts the transfer and deletes its temp files. Irreversible.
    pub async fn cancel(&self) -> Result<bool> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// The state an external layer should persist to survive a restart.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| EngineError::TaskClosed)?;
        rx.await.map_err(|_| EngineError::TaskClosed)
    }
}

struct ActiveRun {
    run: u64,
    control: Arc<WorkerControl>,
    handle: JoinHandle<WorkerOutcome>,
}

/// A worker that was told to stop and has not reported back yet.
struct DrainingRun {
    run: u64,
    handle: JoinHandle<WorkerOutcome>,
}

pub struct DownloadTask {
    id: String,
    spec: TransferSpec,
    config: Arc<EngineConfig>,
    client: Arc<dyn HttpClient>,
    events: mpsc::UnboundedSender<TaskEvent>,
    temp_dir: PathBuf,

    status: TaskStatus,
    total_size: u64,
    accept_ranges: bool,
    connection_limit: usize,

    // Arenas indexed by segment id.
    segments: Vec<Segment>,
    active: Vec<Option<ActiveRun>>,
    draining: Vec<Option<DrainingRun>>,
    samples: Vec<f64>,
    retries: Vec<u32>,

    downloaded: u64,
    speed: f64,
    last_update: Instant,
    last_downloaded: u64,
    next_run: u64,

    progress_timer: Option<Interval>,
    health_timer: Option<Interval>,

    worker_tx: mpsc::UnboundedSender<WorkerMessage>,
    worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
}

impl DownloadTask {
    pub fn new(
        id: impl Into<String>,
        spec: TransferSpec,
        config: Arc<EngineConfig>,
        client: Arc<dyn HttpClient>,
        events: mpsc::UnboundedSender<TaskEvent>,
    ) -> Self {
        let id = id.into();
        let temp_dir = spec.temp_directory(&id);
        let connection_limit = spec.connections.max(1);
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        debug!(transfer = %id, url = %spec.url, directory = %spec.directory.display(), "task created");

        Self {
            id,
            spec,
            config,
            client,
            events,
            temp_dir,
            status: TaskStatus::Queued,
            total_size: 0,
            accept_ranges: false,
            connection_limit,
            segments: Vec::new(),
            active: Vec::new(),
            draining: Vec::new(),
            samples: Vec::new(),
            retries: Vec::new(),
            downloaded: 0,
            speed: 0.0,
            last_update: Instant::now(),
            last_downloaded: 0,
            next_run: 0,
            progress_timer: None,
            health_timer: None,
            worker_tx,
            worker_rx,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            size: self.total_size,
            downloaded: self.downloaded,
            speed: self.speed,
            segments: self.segments.clone(),
            accept_ranges: self.accept_ranges,
        }
    }

    /// Spawns the actor and begins the transfer (probe, plan, download).
    pub fn start(self) -> TaskHandle {
        self.spawn_actor(true)
    }

    /// Spawns the actor without starting it; used after [`DownloadTask::restore`].
    pub fn spawn(self) -> TaskHandle {
        self.spawn_actor(false)
    }

    fn spawn_actor(self, start: bool) -> TaskHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = TaskHandle {
            id: self.id.clone(),
            commands: tx,
        };
        tokio::spawn(self.run(rx, start));
        handle
    }

    /// Rebuilds in-flight state from a persisted snapshot, reconciling each
    /// segment with the bytes actually present in its temp file. The task
    /// ends up `Paused`, ready for resume.
    pub async fn restore(&mut self, snapshot: Snapshot) -> Result<()> {
        self.total_size = snapshot.size;
        self.speed = snapshot.speed;
        self.accept_ranges = snapshot.accept_ranges;

        if snapshot.segments.is_empty() {
            info!(transfer = %self.id, "snapshot has no segments, probing again");
            self.prepare_directories().await?;
            self.probe_and_plan().await;
        } else {
            fs::create_dir_all(&self.temp_dir)
                .await
                .map_err(|e| EngineError::io(&self.temp_dir, e))?;

            let mut segments = snapshot.segments;
            segments.sort_by_key(|s| s.id);
            check_layout(&segments, self.total_size)?;

            let bounded = self.total_size > 0;
            if !self.accept_ranges && segments.len() > 1 {
                // Without ranges every worker fetches from byte 0, so only a
                // single segment spanning the whole resource can be merged.
                warn!(
                    transfer = %self.id,
                    segments = segments.len(),
                    "server does not accept ranges, discarding saved segments"
                );
                remove_temp_dir(&self.temp_dir).await;
                fs::create_dir_all(&self.temp_dir)
                    .await
                    .map_err(|e| EngineError::io(&self.temp_dir, e))?;
                segments = vec![Segment::new(0, 0, self.total_size - 1)];
            }
            for segment in &mut segments {
                self.reconcile_segment(segment, bounded).await?;
            }
            if !(self.accept_ranges && bounded) {
                self.connection_limit = 1;
            }
            self.set_segments(segments);
        }

        // Recomputed from the reconciled segments rather than trusted from the snapshot.
        self.downloaded = self.segments.iter().map(|s| s.downloaded).sum();
        if self.downloaded != snapshot.downloaded {
            debug!(
                transfer = %self.id,
                saved = snapshot.downloaded,
                on_disk = self.downloaded,
                "downloaded bytes adjusted to match segment files"
            );
        }
        self.last_update = Instant::now();
        self.last_downloaded = self.downloaded;
        self.status = TaskStatus::Paused;
        info!(
            transfer = %self.id,
            size = self.total_size,
            downloaded = self.downloaded,
            segments = self.segments.len(),
            "task restored"
        );
        Ok(())
    }

    async fn reconcile_segment(&self, segment: &mut Segment, bounded: bool) -> Result<()> {
        let path = self.temp_dir.join(segment.file_name());
        segment.status = SegmentStatus::Queued;

        let actual = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::write(&path, b"")
                    .await
                    .map_err(|e| EngineError::io(&path, e))?;
                0
            }
            Err(e) => return Err(EngineError::io(&path, e)),
        };

        let actual = if bounded && actual > segment.len() {
            warn!(transfer = %self.id, segment = segment.id, actual, "segment file longer than its range, truncating");
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| EngineError::io(&path, e))?;
            file.set_len(segment.len())
                .await
                .map_err(|e| EngineError::io(&path, e))?;
            segment.len()
        } else {
            actual
        };

        if actual != segment.downloaded {
            debug!(
                transfer = %self.id,
                segment = segment.id,
                saved = segment.downloaded,
                actual,
                "segment progress reconciled with file size"
            );
        }
        segment.downloaded = actual;

        if bounded && segment.downloaded >= segment.len() {
            segment.status = SegmentStatus::Completed;
        }
        Ok(())
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, start: bool) {
        if start {
            self.start_transfer().await;
        }

        while !self.status.is_terminal() {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!(transfer = %self.id, "all handles dropped, pausing");
                        self.pause(true);
                        break;
                    }
                },
                Some(message) = self.worker_rx.recv() => self.handle_worker_message(message).await,
                _ = tick(self.progress_timer.as_mut()) => {
                    self.update_speed();
                    self.emit_progress();
                }
                _ = tick(self.health_timer.as_mut()) => self.check_connection_health(),
            }
        }
        debug!(transfer = %self.id, status = %self.status, "task actor stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Pause { silent, reply } => {
                let _ = reply.send(self.pause(silent));
            }
            Command::Resume { reply } => {
                let resumed = self.resume().await;
                let _ = reply.send(resumed);
            }
            Command::Cancel { reply } => {
                let cancelled = self.cancel().await;
                let _ = reply.send(cancelled);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    async fn start_transfer(&mut self) {
        info!(transfer = %self.id, url = %self.spec.url, "starting transfer");
        if let Err(e) = self.prepare_directories().await {
            self.fail(e);
            return;
        }
        self.probe_and_plan().await;

        self.status = TaskStatus::Downloading;
        self.downloaded = 0;
        self.last_update = Instant::now();
        self.last_downloaded = 0;
        self.start_timers();
        self.schedule().await;
    }

    async fn prepare_directories(&self) -> Result<()> {
        for dir in [&self.spec.directory, &self.temp_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| EngineError::io(dir, e))?;
        }
        Ok(())
    }

    async fn probe_and_plan(&mut self) {
        let ProbeResult {
            size,
            accept_ranges,
        } = probe(self.client.as_ref(), &self.spec.url, &self.config).await;
        self.total_size = size;
        self.accept_ranges = accept_ranges;
        if size == 0 || !accept_ranges {
            self.connection_limit = 1;
        }

        let segments = plan_segments(
            size,
            self.connection_limit,
            self.spec.segment_size,
            self.config.segmentation_threshold,
        );
        info!(
            transfer = %self.id,
            size,
            accept_ranges,
            segments = segments.len(),
            connections = self.connection_limit,
            "transfer planned"
        );
        self.set_segments(segments);
    }

    fn set_segments(&mut self, segments: Vec<Segment>) {
        let n = segments.len();
        self.segments = segments;
        self.active = (0..n).map(|_| None).collect();
        self.draining = (0..n).map(|_| None).collect();
        self.samples = vec![0.0; n];
        self.retries = vec![0; n];
    }

    fn active_count(&self) -> usize {
        self.active.iter().filter(|a| a.is_some()).count()
    }

    /// Launches workers for pending segments while slots are free; finalizes
    /// once nothing is pending or running.
    async fn schedule(&mut self) {
        if self.status != TaskStatus::Downloading {
            return;
        }

        let pending: Vec<usize> = self
            .segments
            .iter()
            .filter(|s| !s.is_terminal() && self.active[s.id].is_none())
            .map(|s| s.id)
            .collect();
        let active = self.active_count();

        if pending.is_empty() && active == 0 {
            self.check_overall_completion().await;
            return;
        }

        let slots = self.connection_limit.saturating_sub(active);
        let launchable: Vec<usize> = pending
            .into_iter()
            .filter(|id| self.draining[*id].is_none())
            .take(slots)
            .collect();
        for id in launchable {
            self.launch(id);
        }
    }

    fn launch(&mut self, id: usize) {
        let run = self.next_run;
        self.next_run += 1;

        let segment = &mut self.segments[id];
        segment.status = SegmentStatus::Active;
        let job = SegmentJob {
            transfer_id: self.id.clone(),
            segment: segment.clone(),
            url: self.spec.url.clone(),
            path: self.temp_dir.join(segment.file_name()),
            ranged: self.accept_ranges && self.total_size > 0,
            bounded: self.total_size > 0,
            max_retries: self.spec.max_retries,
            run,
        };
        debug!(transfer = %self.id, segment = id, run, start = job.segment.start + job.segment.downloaded, end = job.segment.end, "launching segment worker");

        let control = Arc::new(WorkerControl::new());
        let worker = SegmentWorker::new(
            job,
            self.client.clone(),
            self.config.clone(),
            control.clone(),
            self.worker_tx.clone(),
        );
        let handle = tokio::spawn(worker.run());
        self.samples[id] = 0.0;
        self.active[id] = Some(ActiveRun {
            run,
            control,
            handle,
        });
    }

    async fn handle_worker_message(&mut self, message: WorkerMessage) {
        match message {
            // Bytes reported by any run are on disk, so they always count.
            WorkerMessage::Progress { segment, bytes, .. } => {
                if let Some(s) = self.segments.get_mut(segment) {
                    s.downloaded += bytes;
                    self.downloaded += bytes;
                }
            }
            WorkerMessage::Rewind { segment, .. } => {
                if let Some(s) = self.segments.get_mut(segment) {
                    self.downloaded -= s.downloaded;
                    s.downloaded = 0;
                }
            }
            WorkerMessage::Sample {
                segment,
                run,
                bytes_per_sec,
            } => {
                if self.is_active_run(segment, run) {
                    self.samples[segment] = bytes_per_sec;
                }
            }
            WorkerMessage::Retrying {
                segment, failures, ..
            } => {
                if let Some(count) = self.retries.get_mut(segment) {
                    *count = failures;
                }
            }
            WorkerMessage::Finished {
                segment,
                run,
                outcome,
            } => self.on_worker_finished(segment, run, outcome).await,
        }
    }

    fn is_active_run(&self, segment: usize, run: u64) -> bool {
        matches!(self.active.get(segment), Some(Some(active)) if active.run == run)
    }

    async fn on_worker_finished(&mut self, id: usize, run: u64, outcome: WorkerOutcome) {
        if self.is_active_run(id, run) {
            self.active[id] = None;
            self.samples[id] = 0.0;
            match outcome {
                WorkerOutcome::Completed => self.segments[id].status = SegmentStatus::Completed,
                WorkerOutcome::Aborted => {}
                WorkerOutcome::Failed(message) => {
                    error!(transfer = %self.id, segment = id, error = %message, "segment failed");
                    self.segments[id].status = SegmentStatus::Error;
                    self.check_overall_completion().await;
                }
                WorkerOutcome::Fatal(message) => {
                    self.segments[id].status = SegmentStatus::Error;
                    self.fail_with_message(message);
                    return;
                }
            }
            self.schedule().await;
            return;
        }

        let drained = matches!(self.draining.get(id), Some(Some(d)) if d.run == run);
        if drained {
            self.draining[id] = None;
            // The stream may have finished just as the pause landed.
            if outcome == WorkerOutcome::Completed {
                self.segments[id].status = SegmentStatus::Completed;
            }
            self.schedule().await;
        }
    }

    /// Fails the task once every segment is terminal and at least one errored;
    /// finalizes if all completed.
    async fn check_overall_completion(&mut self) {
        if self.status != TaskStatus::Downloading {
            return;
        }
        if !self.segments.iter().all(Segment::is_terminal) {
            return;
        }
        if self.active_count() > 0 {
            return;
        }
        if self.segments.iter().any(|s| s.status == SegmentStatus::Error) {
            self.fail(EngineError::SegmentsFailed);
        } else {
            self.finalize_download().await;
        }
    }

    async fn finalize_download(&mut self) {
        self.stop_timers();
        match finalize(&self.spec, &self.temp_dir, &self.segments, self.total_size).await {
            Ok(outcome) => {
                if self.total_size == 0 {
                    self.total_size = self.downloaded;
                }
                let path = match outcome {
                    FinalizeOutcome::Merged(path) => path,
                    FinalizeOutcome::AlreadyPresent(path) => {
                        self.downloaded = self.total_size;
                        path
                    }
                };
                self.status = TaskStatus::Completed;
                self.speed = 0.0;
                info!(transfer = %self.id, path = %path.display(), "transfer completed");
                self.emit_progress();
                self.emit(TaskEvent::Complete { path });
            }
            Err(e) => self.fail(e),
        }
    }

    fn pause(&mut self, silent: bool) -> bool {
        if self.status != TaskStatus::Downloading {
            return false;
        }
        info!(transfer = %self.id, active = self.active_count(), "pausing transfer");
        self.status = TaskStatus::Paused;
        self.halt_workers();
        self.stop_timers();
        if !silent {
            self.emit_progress();
        }
        true
    }

    /// Marks every running worker as paused, then aborts them. All marks are
    /// set before the first abort so no worker can read its abort as a fault.
    fn halt_workers(&mut self) {
        for run in self.active.iter().flatten() {
            run.control.mark_paused();
        }
        for run in self.active.iter().flatten() {
            run.control.abort();
        }
        for id in 0..self.active.len() {
            if let Some(run) = self.active[id].take() {
                self.segments[id].status = SegmentStatus::Paused;
                self.samples[id] = 0.0;
                self.draining[id] = Some(DrainingRun {
                    run: run.run,
                    handle: run.handle,
                });
            }
        }
    }

    async fn resume(&mut self) -> bool {
        if !matches!(self.status, TaskStatus::Paused | TaskStatus::Queued) {
            return false;
        }
        if self.segments.is_empty() {
            self.start_transfer().await;
            return true;
        }

        info!(transfer = %self.id, segments = self.segments.len(), downloaded = self.downloaded, "resuming transfer");
        self.status = TaskStatus::Downloading;
        self.last_update = Instant::now();
        self.last_downloaded = self.downloaded;
        for segment in &mut self.segments {
            if segment.status == SegmentStatus::Paused {
                segment.status = SegmentStatus::Queued;
            }
        }
        for slot in &mut self.active {
            *slot = None;
        }
        self.start_timers();
        self.schedule().await;
        true
    }

    async fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        info!(transfer = %self.id, "cancelling transfer");
        self.halt_workers();
        self.stop_timers();

        // Wait for workers to let go of their files before deleting them.
        for slot in &mut self.draining {
            if let Some(run) = slot.take() {
                let _ = run.handle.await;
            }
        }
        remove_temp_dir(&self.temp_dir).await;

        self.status = TaskStatus::Error;
        self.speed = 0.0;
        self.emit_progress();
        true
    }

    fn fail(&mut self, error: EngineError) {
        self.fail_with_message(error.to_string());
    }

    fn fail_with_message(&mut self, message: String) {
        error!(transfer = %self.id, error = %message, "transfer failed");
        self.halt_workers();
        self.stop_timers();
        self.status = TaskStatus::Error;
        self.speed = 0.0;
        self.emit_progress();
        self.emit(TaskEvent::Error { message });
    }

    fn start_timers(&mut self) {
        let now = tokio::time::Instant::now();
        let progress = self.config.progress_interval;
        let mut timer = interval_at(now + progress, progress);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.progress_timer = Some(timer);

        self.health_timer = if self.spec.dynamic_connections {
            let health = self.config.health_check_interval;
            let mut timer = interval_at(now + health, health);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(timer)
        } else {
            None
        };
    }

    fn stop_timers(&mut self) {
        self.progress_timer = None;
        self.health_timer = None;
    }

    fn update_speed(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        if elapsed > 0.0 {
            self.speed = self.downloaded.saturating_sub(self.last_downloaded) as f64 / elapsed;
            self.last_update = now;
            self.last_downloaded = self.downloaded;
        }
    }

    fn check_connection_health(&mut self) {
        if self.status != TaskStatus::Downloading || !self.spec.dynamic_connections {
            return;
        }
        let samples = self
            .active
            .iter()
            .enumerate()
            .filter(|(_, run)| run.is_some())
            .map(|(id, _)| self.samples[id]);
        let limit = controller::next_limit(samples, self.connection_limit, &self.config);
        if limit != self.connection_limit {
            info!(transfer = %self.id, from = self.connection_limit, to = limit, "adjusting connection limit");
            self.connection_limit = limit;
        }
    }

    fn progress(&self) -> Progress {
        let progress_percent = if self.total_size > 0 {
            self.downloaded as f64 / self.total_size as f64 * 100.0
        } else {
            0.0
        };
        let eta_seconds = if self.speed > 0.0 && self.total_size > self.downloaded {
            (self.total_size - self.downloaded) as f64 / self.speed
        } else {
            0.0
        };
        Progress {
            progress_percent,
            speed_bytes_per_sec: self.speed,
            downloaded_bytes: self.downloaded,
            total_bytes: self.total_size,
            eta_seconds,
            status: self.status,
            connections: self.connection_limit,
            segments: self.segments.clone(),
        }
    }

    fn emit_progress(&self) {
        self.emit(TaskEvent::Progress(self.progress()));
    }

    fn emit(&self, event: TaskEvent) {
        let _ = self.events.send(event);
    }
}

/// Saved segments must partition the resource: ids `0..n`, each range
/// non-empty and directly following the previous one, the last ending at
/// `size - 1`. An unknown size allows only the single open segment.
fn check_layout(segments: &[Segment], size: u64) -> Result<()> {
    let invalid = |reason: String| Err(EngineError::InvalidSnapshot(reason));

    if let Some((index, segment)) = segments.iter().enumerate().find(|(i, s)| s.id != *i) {
        return invalid(format!(
            "segment ids must be 0..{}, found {} at position {}",
            segments.len(),
            segment.id,
            index
        ));
    }
    if size == 0 {
        return match segments {
            [only] if only.start == 0 && only.end == 0 => Ok(()),
            _ => invalid("unknown size needs exactly one segment at 0-0".to_string()),
        };
    }

    let mut next_start = 0;
    for segment in segments {
        if segment.start > segment.end {
            return invalid(format!(
                "segment {} ends at {} before it starts at {}",
                segment.id, segment.end, segment.start
            ));
        }
        if segment.start != next_start {
            return invalid(format!(
                "segment {} starts at {}, expected {}",
                segment.id, segment.start, next_start
            ));
        }
        next_start = segment.end.saturating_add(1);
    }
    if next_start != size {
        return invalid(format!("segments cover {} bytes of {}", next_start, size));
    }
    Ok(())
}

async fn tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
