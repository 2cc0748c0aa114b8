mod common;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use catchy::segment::Segment;
use catchy::worker::{SegmentJob, SegmentWorker, WorkerControl, WorkerMessage, WorkerOutcome};
use common::{fast_config, payload, FakeServer, Resource, Route};

const URL: &str = "http://files.test/data.bin";

fn job(dir: &Path, segment: Segment, max_retries: u32) -> SegmentJob {
    SegmentJob {
        transfer_id: "t1".to_string(),
        path: dir.join(segment.file_name()),
        segment,
        url: URL.to_string(),
        ranged: true,
        bounded: true,
        max_retries,
        run: 7,
    }
}

async fn run_worker(server: &Arc<FakeServer>, job: SegmentJob) -> (WorkerOutcome, Vec<WorkerMessage>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = SegmentWorker::new(
        job,
        server.clone(),
        Arc::new(fast_config()),
        Arc::new(WorkerControl::new()),
        tx,
    );
    let outcome = worker.run().await;
    let mut messages = Vec::new();
    while let Ok(message) = rx.try_recv() {
        messages.push(message);
    }
    (outcome, messages)
}

fn progress_total(messages: &[WorkerMessage]) -> u64 {
    messages
        .iter()
        .map(|m| match m {
            WorkerMessage::Progress { bytes, .. } => *bytes,
            _ => 0,
        })
        .sum()
}

#[tokio::test]
async fn test_downloads_its_byte_range() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(3000);
    let server = FakeServer::new();
    server.file(URL, Resource::new(data.clone()));

    let (outcome, messages) = run_worker(&server, job(dir.path(), Segment::new(1, 1000, 1999), 3)).await;

    assert_eq!(outcome, WorkerOutcome::Completed);
    assert_eq!(std::fs::read(dir.path().join("segment-1")).unwrap(), &data[1000..2000]);
    assert_eq!(progress_total(&messages), 1000);
    assert_eq!(
        messages.last(),
        Some(&WorkerMessage::Finished {
            segment: 1,
            run: 7,
            outcome: WorkerOutcome::Completed
        })
    );
    assert_eq!(server.segment_requests()[0].range, Some((1000, Some(1999))));
}

#[tokio::test]
async fn test_resumes_from_existing_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(3000);
    let server = FakeServer::new();
    server.file(URL, Resource::new(data.clone()));
    std::fs::write(dir.path().join("segment-2"), &data[2000..2400]).unwrap();

    let mut segment = Segment::new(2, 2000, 2999);
    segment.downloaded = 400;
    let (outcome, messages) = run_worker(&server, job(dir.path(), segment, 3)).await;

    assert_eq!(outcome, WorkerOutcome::Completed);
    assert_eq!(progress_total(&messages), 600);
    assert_eq!(server.segment_requests()[0].range, Some((2400, Some(2999))));
    assert_eq!(std::fs::read(dir.path().join("segment-2")).unwrap(), &data[2000..]);
}

#[tokio::test]
async fn test_retries_exhausted_after_max_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    server.route(URL, Route::Status(503));

    let (outcome, messages) = run_worker(&server, job(dir.path(), Segment::new(0, 0, 999), 3)).await;

    match outcome {
        WorkerOutcome::Failed(message) => assert!(message.contains("503"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(server.segment_requests().len(), 3);
    let retries: Vec<u32> = messages
        .iter()
        .filter_map(|m| match m {
            WorkerMessage::Retrying { failures, .. } => Some(*failures),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2]);
}

#[tokio::test]
async fn test_transient_failures_recover() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1000);
    let server = FakeServer::new();
    server.file(URL, Resource::new(data.clone()).failing_first(2));

    let (outcome, _) = run_worker(&server, job(dir.path(), Segment::new(0, 0, 999), 3)).await;

    assert_eq!(outcome, WorkerOutcome::Completed);
    assert_eq!(server.segment_requests().len(), 3);
    assert_eq!(std::fs::read(dir.path().join("segment-0")).unwrap(), data);
}

#[tokio::test]
async fn test_follows_relative_redirects() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(2000);
    let server = FakeServer::new();
    server.redirect(URL, "/cdn/one");
    server.redirect("http://files.test/cdn/one", "two");
    server.file("http://files.test/cdn/two", Resource::new(data.clone()));

    let (outcome, _) = run_worker(&server, job(dir.path(), Segment::new(0, 0, 999), 1)).await;

    assert_eq!(outcome, WorkerOutcome::Completed);
    let urls: Vec<String> = server.segment_requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
        urls,
        vec![
            URL.to_string(),
            "http://files.test/cdn/one".to_string(),
            "http://files.test/cdn/two".to_string()
        ]
    );
    assert_eq!(std::fs::read(dir.path().join("segment-0")).unwrap(), &data[..1000]);
}

#[tokio::test]
async fn test_redirect_loop_hits_cap() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    server.redirect(URL, "http://files.test/loop");
    server.redirect("http://files.test/loop", URL);

    let (outcome, _) = run_worker(&server, job(dir.path(), Segment::new(0, 0, 999), 1)).await;

    match outcome {
        WorkerOutcome::Failed(message) => assert!(message.contains("maximum redirects"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
    // The original request plus five followed hops.
    assert_eq!(server.segment_requests().len(), 6);
}

#[tokio::test]
async fn test_redirect_without_location_fails() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    server.route(
        URL,
        Route::Redirect {
            status: 301,
            location: None,
        },
    );

    let (outcome, _) = run_worker(&server, job(dir.path(), Segment::new(0, 0, 999), 1)).await;
    match outcome {
        WorkerOutcome::Failed(message) => assert!(message.contains("Location"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ignored_range_at_offset_is_a_failure() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    server.file(URL, Resource::new(payload(3000)).without_ranges());

    let (outcome, _) = run_worker(&server, job(dir.path(), Segment::new(1, 1000, 1999), 2)).await;

    match outcome {
        WorkerOutcome::Failed(message) => assert!(message.contains("ignored range"), "{}", message),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(common::file_len(&dir.path().join("segment-1")), 0);
}

#[tokio::test]
async fn test_full_body_at_offset_zero_is_cut_at_segment_end() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(3000);
    let server = FakeServer::new();
    server.file(URL, Resource::new(data.clone()).without_ranges());

    let (outcome, messages) = run_worker(&server, job(dir.path(), Segment::new(0, 0, 999), 1)).await;

    assert_eq!(outcome, WorkerOutcome::Completed);
    assert_eq!(progress_total(&messages), 1000);
    assert_eq!(std::fs::read(dir.path().join("segment-0")).unwrap(), &data[..1000]);
}

#[tokio::test]
async fn test_unbounded_retry_rewinds_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(1500);
    let server = FakeServer::new();
    server.file(
        URL,
        Resource::new(data.clone())
            .without_head_length()
            .without_get_length()
            .without_ranges(),
    );
    std::fs::write(dir.path().join("segment-0"), &data[..300]).unwrap();

    let mut segment = Segment::new(0, 0, 0);
    segment.downloaded = 300;
    let job = SegmentJob {
        ranged: false,
        bounded: false,
        ..job(dir.path(), segment, 1)
    };
    let (outcome, messages) = run_worker(&server, job).await;

    assert_eq!(outcome, WorkerOutcome::Completed);
    assert!(messages.contains(&WorkerMessage::Rewind { segment: 0, run: 7 }));
    assert_eq!(progress_total(&messages), 1500);
    assert_eq!(std::fs::read(dir.path().join("segment-0")).unwrap(), data);
}
