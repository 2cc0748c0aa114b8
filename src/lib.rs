//! Resumable multi-connection HTTP(S) transfer engine.
//!
//! A [`Coordinator`] runs any number of transfers. Each transfer probes the
//! resource, splits it into byte-range segments fetched in parallel into
//! per-segment temp files, and merges them into the destination once every
//! segment is complete. Transfers can be paused, resumed, cancelled and
//! restored from a persisted [`Snapshot`].

pub mod config;
pub mod controller;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod finalize;
pub mod http;
pub mod probe;
pub mod segment;
pub mod store;
pub mod task;
pub mod utils;
pub mod worker;

pub use config::{EngineConfig, TransferSpec};
pub use coordinator::Coordinator;
pub use error::{EngineError, Result};
pub use events::{Progress, TaskEvent, TaskStatus, TransferEvent};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient};
pub use segment::{plan_segments, Segment, SegmentStatus, Snapshot};
pub use task::{DownloadTask, TaskHandle};
