use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Queued,
    Active,
    Paused,
    Completed,
    Error,
}

/// A contiguous, inclusive byte range `[start, end]` of the resource.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub id: usize,
    pub start: u64,
    pub end: u64,
    pub downloaded: u64,
    pub status: SegmentStatus,
}

impl Segment {
    pub fn new(id: usize, start: u64, end: u64) -> Self {
        Self {
            id,
            start,
            end,
            downloaded: 0,
            status: SegmentStatus::Queued,
        }
    }

    /// Number of bytes the segment spans.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.downloaded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SegmentStatus::Completed | SegmentStatus::Error)
    }

    pub fn file_name(&self) -> String {
        format!("segment-{}", self.id)
    }
}

/// The serializable subset of task state an external layer persists and
/// later hands back to restore a transfer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub size: u64,
    pub downloaded: u64,
    pub speed: f64,
    pub segments: Vec<Segment>,
    #[serde(default = "default_accept_ranges")]
    pub accept_ranges: bool,
}

fn default_accept_ranges() -> bool {
    true
}

/// Splits a resource of `total_size` bytes into consecutive segments.
///
/// Unknown (`0`) or small resources, and single-connection transfers, get one
/// segment spanning everything (`end == 0` when the size is unknown).
/// Otherwise each segment is `min(segment_size, ceil(total_size / connections))`
/// bytes, with the last one truncated at `total_size - 1`.
pub fn plan_segments(
    total_size: u64,
    connections: usize,
    segment_size: u64,
    threshold: u64,
) -> Vec<Segment> {
    if total_size == 0 || total_size < threshold || connections <= 1 {
        return vec![Segment::new(0, 0, total_size.saturating_sub(1))];
    }

    let per_connection = total_size.div_ceil(connections as u64);
    let effective = segment_size.max(1).min(per_connection);

    let mut segments = Vec::with_capacity(total_size.div_ceil(effective) as usize);
    let mut start = 0;
    while start < total_size {
        let end = (start + effective - 1).min(total_size - 1);
        segments.push(Segment::new(segments.len(), start, end));
        start = end + 1;
    }
    segments
}
