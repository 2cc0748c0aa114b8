//! Segment worker: fetches one segment into its temp file, following
//! redirects and retrying transient failures with exponential backoff.
//!
//! Workers never touch task state. Every byte written is reported to the
//! owning task as a [`WorkerMessage::Progress`] delta, and the task applies
//! deltas serially, so a segment's counter and the task total move together.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::http::{BodyStream, HttpClient, HttpRequest};
use crate::segment::Segment;

/// Abort handle shared between a task and one worker run.
///
/// The task marks the run as paused *before* cancelling it, and the worker
/// consults that mark whenever an attempt ends early. An abort requested by
/// the task is therefore never mistaken for a network fault.
#[derive(Debug, Default)]
pub struct WorkerControl {
    paused: AtomicBool,
    token: CancellationToken,
}

impl WorkerControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_paused(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn abort(&self) {
        self.token.cancel();
    }

    async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Completed,
    /// Stopped on request of the task (pause or cancel).
    Aborted,
    /// Retries exhausted.
    Failed(String),
    /// Local filesystem failure; not worth retrying.
    Fatal(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Progress { segment: usize, run: u64, bytes: u64 },
    /// The segment restarts from byte 0 (non-ranged transfer); its counter drops to zero.
    Rewind { segment: usize, run: u64 },
    Sample { segment: usize, run: u64, bytes_per_sec: f64 },
    Retrying { segment: usize, run: u64, failures: u32, error: String },
    Finished { segment: usize, run: u64, outcome: WorkerOutcome },
}

/// Everything a worker needs to fetch one segment.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub transfer_id: String,
    pub segment: Segment,
    /// Original transfer URL; every retry starts over from here.
    pub url: String,
    pub path: PathBuf,
    /// Issue `Range` requests and resume from already downloaded bytes.
    pub ranged: bool,
    /// Whether the resource size is known, bounding the segment to `start..=end`.
    pub bounded: bool,
    pub max_retries: u32,
    pub run: u64,
}

enum AttemptError {
    Interrupted,
    Retryable(EngineError),
    Fatal(EngineError),
}

impl From<EngineError> for AttemptError {
    fn from(e: EngineError) -> Self {
        AttemptError::Retryable(e)
    }
}

pub struct SegmentWorker {
    job: SegmentJob,
    client: Arc<dyn HttpClient>,
    config: Arc<EngineConfig>,
    control: Arc<WorkerControl>,
    tx: mpsc::UnboundedSender<WorkerMessage>,
    downloaded: u64,
}

impl SegmentWorker {
    pub fn new(
        job: SegmentJob,
        client: Arc<dyn HttpClient>,
        config: Arc<EngineConfig>,
        control: Arc<WorkerControl>,
        tx: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        let downloaded = job.segment.downloaded;
        Self {
            job,
            client,
            config,
            control,
            tx,
            downloaded,
        }
    }

    /// Runs attempts until the segment completes, is aborted, or runs out of
    /// retries. Always ends by sending [`WorkerMessage::Finished`].
    pub async fn run(mut self) -> WorkerOutcome {
        let outcome = self.run_attempts().await;
        let _ = self.tx.send(WorkerMessage::Finished {
            segment: self.job.segment.id,
            run: self.job.run,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run_attempts(&mut self) -> WorkerOutcome {
        let segment = self.job.segment.id;
        let max_failures = self.job.max_retries.max(1);
        let mut failures = 0u32;

        loop {
            if self.control.is_paused() {
                return WorkerOutcome::Aborted;
            }

            let error = match self.attempt().await {
                Ok(()) => {
                    info!(transfer = %self.job.transfer_id, segment, bytes = self.downloaded, "segment completed");
                    return WorkerOutcome::Completed;
                }
                Err(_) if self.control.is_paused() => {
                    debug!(transfer = %self.job.transfer_id, segment, "segment stopped by pause");
                    return WorkerOutcome::Aborted;
                }
                Err(AttemptError::Fatal(e)) => return WorkerOutcome::Fatal(e.to_string()),
                Err(AttemptError::Interrupted) => {
                    EngineError::Http("request aborted".to_string())
                }
                Err(AttemptError::Retryable(e)) => e,
            };

            failures += 1;
            if failures >= max_failures {
                warn!(transfer = %self.job.transfer_id, segment, failures, error = %error, "segment failed, retries exhausted");
                return WorkerOutcome::Failed(error.to_string());
            }

            let delay = self.config.backoff(failures);
            warn!(
                transfer = %self.job.transfer_id,
                segment,
                failures,
                max_failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "segment attempt failed, retrying"
            );
            let _ = self.tx.send(WorkerMessage::Retrying {
                segment,
                run: self.job.run,
                failures,
                error: error.to_string(),
            });

            tokio::select! {
                _ = self.control.cancelled() => {
                    if self.control.is_paused() {
                        return WorkerOutcome::Aborted;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt from the original URL, following up to `max_redirects` hops.
    async fn attempt(&mut self) -> Result<(), AttemptError> {
        let segment = &self.job.segment;
        let limit = self.job.bounded.then(|| segment.len());

        if self.job.ranged && limit.is_some_and(|limit| self.downloaded >= limit) {
            return Ok(());
        }

        let offset = if self.job.ranged { self.downloaded } else { 0 };
        let mut url = self.job.url.clone();
        let mut redirects = 0usize;

        let response = loop {
            let mut request = HttpRequest::get(url.clone());
            if self.job.ranged {
                request = request.with_range(segment.start + offset, Some(segment.end));
            }
            debug!(
                transfer = %self.job.transfer_id,
                segment = segment.id,
                url = %url,
                redirects,
                range = ?request.range_header(),
                "requesting segment"
            );

            let response = tokio::select! {
                _ = self.control.cancelled() => return Err(AttemptError::Interrupted),
                r = timeout(self.config.request_timeout, self.client.send(request)) => {
                    r.map_err(|_| EngineError::Timeout(self.config.request_timeout))??
                }
            };

            if response.is_redirect() {
                let location = response
                    .location
                    .as_deref()
                    .ok_or(EngineError::RedirectWithoutLocation(response.status))?;
                redirects += 1;
                if redirects > self.config.max_redirects {
                    return Err(EngineError::TooManyRedirects(self.config.max_redirects).into());
                }
                url = Url::parse(&url)
                    .and_then(|base| base.join(location))
                    .map_err(EngineError::from)?
                    .to_string();
                debug!(transfer = %self.job.transfer_id, segment = segment.id, to = %url, "following redirect");
                continue;
            }
            if !response.is_success() {
                return Err(EngineError::Status(response.status).into());
            }
            break response;
        };

        let absolute_offset = segment.start + offset;
        if self.job.ranged && response.status == 200 && absolute_offset > 0 {
            return Err(EngineError::RangeIgnored(absolute_offset).into());
        }

        if offset < self.downloaded {
            let _ = self.tx.send(WorkerMessage::Rewind {
                segment: segment.id,
                run: self.job.run,
            });
            self.downloaded = 0;
        }

        let mut file = self.open_file().await.map_err(AttemptError::Fatal)?;
        let streamed = self.stream_body(&mut file, response.body, limit).await;
        let flushed = file
            .flush()
            .await
            .map_err(|e| AttemptError::Fatal(EngineError::io(&self.job.path, e)));
        streamed?;
        flushed?;

        match limit {
            Some(expected) if self.downloaded < expected => Err(EngineError::Incomplete {
                received: self.downloaded,
                expected,
            }
            .into()),
            _ => Ok(()),
        }
    }

    async fn open_file(&self) -> Result<File, EngineError> {
        let path = &self.job.path;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::io(parent, e))?;
        }

        let mut options = OpenOptions::new();
        options.create(true);
        if self.downloaded > 0 {
            options.append(true);
        } else {
            options.write(true).truncate(true);
        }
        options.open(path).await.map_err(|e| EngineError::io(path, e))
    }

    async fn stream_body(
        &mut self,
        file: &mut File,
        mut body: BodyStream,
        limit: Option<u64>,
    ) -> Result<(), AttemptError> {
        let segment = self.job.segment.id;
        let run = self.job.run;
        let mut sampler = ThroughputSampler::new(self.downloaded, Instant::now());

        loop {
            let next = tokio::select! {
                _ = self.control.cancelled() => return Err(AttemptError::Interrupted),
                next = timeout(self.config.request_timeout, body.next()) => next,
            };
            let mut chunk = match next {
                Err(_) => return Err(EngineError::Timeout(self.config.request_timeout).into()),
                Ok(None) => return Ok(()),
                Ok(Some(chunk)) => chunk?,
            };

            if let Some(limit) = limit {
                let room = limit.saturating_sub(self.downloaded);
                if room == 0 {
                    return Ok(());
                }
                if chunk.len() as u64 > room {
                    chunk.truncate(room as usize);
                }
            }
            if chunk.is_empty() {
                continue;
            }

            // A chunk is written completely before anything else happens, so the
            // file length always equals the sum of the reported deltas.
            file.write_all(&chunk)
                .await
                .map_err(|e| AttemptError::Fatal(EngineError::io(&self.job.path, e)))?;

            let bytes = chunk.len() as u64;
            self.downloaded += bytes;
            let _ = self.tx.send(WorkerMessage::Progress { segment, run, bytes });

            if let Some(bytes_per_sec) = sampler.record(self.downloaded, Instant::now()) {
                let _ = self.tx.send(WorkerMessage::Sample {
                    segment,
                    run,
                    bytes_per_sec,
                });
            }
        }
    }
}

/// Rolling throughput over windows of at least one second.
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    last_bytes: u64,
    last_time: Instant,
    window: Duration,
}

impl ThroughputSampler {
    pub fn new(bytes: u64, now: Instant) -> Self {
        Self {
            last_bytes: bytes,
            last_time: now,
            window: Duration::from_secs(1),
        }
    }

    /// Returns a new bytes-per-second sample once a full window has elapsed.
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.last_time);
        if elapsed < self.window {
            return None;
        }
        let rate = bytes.saturating_sub(self.last_bytes) as f64 / elapsed.as_secs_f64();
        self.last_bytes = bytes;
        self.last_time = now;
        Some(rate)
    }
}
