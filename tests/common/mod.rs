//! Scripted in-memory HTTP server shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use catchy::events::{Progress, TaskEvent};
use catchy::http::{BodyStream, HttpClient, HttpRequest, HttpResponse, Method};
use catchy::{EngineConfig, EngineError, Result, TaskHandle};

/// A file served by the fake server, with knobs for the server behaviours
/// the engine has to cope with.
#[derive(Clone)]
pub struct Resource {
    pub data: Bytes,
    /// HEAD responses carry `Content-Length`.
    pub head_length: bool,
    /// Plain GET responses carry `Content-Length`.
    pub get_length: bool,
    /// `Range` requests are answered with 206 and `Content-Range`.
    pub ranges: bool,
    pub chunk_size: usize,
    pub chunk_delay: Option<Duration>,
    /// Every body stops producing data after this many bytes.
    pub stall_after: Option<usize>,
    /// Number of segment GETs answered with 500 before serving normally.
    pub fail_first: u32,
    failures: Arc<AtomicU32>,
}

impl Resource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            head_length: true,
            get_length: true,
            ranges: true,
            chunk_size: 256,
            chunk_delay: None,
            stall_after: None,
            fail_first: 0,
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn without_head_length(mut self) -> Self {
        self.head_length = false;
        self
    }

    pub fn without_get_length(mut self) -> Self {
        self.get_length = false;
        self
    }

    pub fn without_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub fn chunked(mut self, size: usize, delay: Option<Duration>) -> Self {
        self.chunk_size = size.max(1);
        self.chunk_delay = delay;
        self
    }

    pub fn stalling_after(mut self, bytes: usize) -> Self {
        self.stall_after = Some(bytes);
        self
    }

    pub fn failing_first(mut self, attempts: u32) -> Self {
        self.fail_first = attempts;
        self
    }
}

#[derive(Clone)]
pub enum Route {
    File(Resource),
    Redirect { status: u16, location: Option<String> },
    Status(u16),
}

#[derive(Default)]
pub struct FakeServer {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub fn file(&self, url: &str, resource: Resource) {
        self.route(url, Route::File(resource));
    }

    pub fn redirect(&self, url: &str, location: &str) {
        self.route(
            url,
            Route::Redirect {
                status: 302,
                location: Some(location.to_string()),
            },
        );
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// GETs issued by segment workers (the probe asks the client to follow redirects).
    pub fn segment_requests(&self) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::Get && !r.follow_redirects)
            .collect()
    }

    fn lookup(&self, url: &str) -> Route {
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(Route::Status(404))
    }
}

fn empty_response(status: u16) -> HttpResponse {
    HttpResponse {
        status,
        content_length: None,
        content_range: None,
        location: None,
        body: futures::stream::empty().boxed(),
    }
}

fn body_stream(data: Bytes, resource: &Resource) -> BodyStream {
    let limit = resource.stall_after.unwrap_or(data.len()).min(data.len());
    let chunks: Vec<Bytes> = (0..limit)
        .step_by(resource.chunk_size)
        .map(|i| data.slice(i..(i + resource.chunk_size).min(limit)))
        .collect();
    let delay = resource.chunk_delay;
    let stream = futures::stream::iter(chunks).then(move |chunk| async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, EngineError>(chunk)
    });

    if resource.stall_after.is_some() {
        stream.chain(futures::stream::pending()).boxed()
    } else {
        stream.boxed()
    }
}

fn serve(resource: &Resource, request: &HttpRequest) -> HttpResponse {
    let total = resource.data.len() as u64;

    if request.method == Method::Head {
        return HttpResponse {
            content_length: resource.head_length.then_some(total),
            ..empty_response(200)
        };
    }

    if !request.follow_redirects
        && resource.failures.fetch_add(1, Ordering::SeqCst) < resource.fail_first
    {
        return empty_response(500);
    }

    match request.range {
        Some((start, end)) if resource.ranges => {
            if start >= total {
                return empty_response(416);
            }
            let end = end.unwrap_or(total - 1).min(total - 1);
            let slice = resource.data.slice(start as usize..=end as usize);
            HttpResponse {
                status: 206,
                content_length: Some(slice.len() as u64),
                content_range: Some(format!("bytes {}-{}/{}", start, end, total)),
                location: None,
                body: body_stream(slice, resource),
            }
        }
        _ => HttpResponse {
            status: 200,
            content_length: resource.get_length.then_some(total),
            content_range: None,
            location: None,
            body: body_stream(resource.data.clone(), resource),
        },
    }
}

#[async_trait]
impl HttpClient for FakeServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());

        let mut url = request.url.clone();
        for _ in 0..=5 {
            match self.lookup(&url) {
                Route::File(resource) => return Ok(serve(&resource, &request)),
                Route::Status(status) => return Ok(empty_response(status)),
                Route::Redirect { status, location } => {
                    match (request.follow_redirects, location) {
                        (true, Some(location)) => {
                            url = url::Url::parse(&url)?.join(&location)?.to_string();
                        }
                        (_, location) => {
                            return Ok(HttpResponse {
                                location,
                                ..empty_response(status)
                            })
                        }
                    }
                }
            }
        }
        Err(EngineError::TooManyRedirects(5))
    }
}

/// Deterministic payload where every byte depends on its offset.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        segmentation_threshold: 1000,
        probe_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        progress_interval: Duration::from_millis(20),
        health_check_interval: Duration::from_millis(50),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

/// Receives task events until one matches, panicking after five seconds.
pub async fn wait_for_event<F>(rx: &mut mpsc::UnboundedReceiver<TaskEvent>, mut matches: F) -> TaskEvent
where
    F: FnMut(&TaskEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_complete(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> std::path::PathBuf {
    match wait_for_event(rx, |e| matches!(e, TaskEvent::Complete { .. } | TaskEvent::Error { .. })).await {
        TaskEvent::Complete { path } => path,
        other => panic!("expected completion, got {:?}", other),
    }
}

/// Last progress event received so far, draining the channel.
pub fn last_progress(rx: &mut mpsc::UnboundedReceiver<TaskEvent>) -> Option<Progress> {
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        if let TaskEvent::Progress(progress) = event {
            last = Some(progress);
        }
    }
    last
}

/// Polls the task until it reports exactly `bytes` downloaded.
pub async fn wait_for_downloaded(handle: &TaskHandle, bytes: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let snapshot = handle.snapshot().await.unwrap();
            if snapshot.downloaded == bytes {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for progress")
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
