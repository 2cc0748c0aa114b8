//! Registry of running transfers keyed by transfer id.
//!
//! The coordinator never touches task state. It routes commands to task
//! handles and drains each task's event channel into one outbound stream,
//! tagging every event with its transfer id.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::config::{EngineConfig, TransferSpec};
use crate::error::{EngineError, Result};
use crate::events::{TaskEvent, TransferEvent};
use crate::http::{HttpClient, ReqwestClient};
use crate::segment::Snapshot;
use crate::task::{DownloadTask, TaskHandle};

type Registry = Arc<Mutex<HashMap<String, TaskHandle>>>;

pub struct Coordinator {
    config: Arc<EngineConfig>,
    client: Arc<dyn HttpClient>,
    tasks: Registry,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl Coordinator {
    /// Creates a coordinator and the receiver its events are delivered on.
    pub fn new(
        config: EngineConfig,
        client: Arc<dyn HttpClient>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            config: Arc::new(config),
            client,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            events,
        };
        (coordinator, rx)
    }

    /// Coordinator backed by the reqwest client.
    pub fn with_default_client(
        config: EngineConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransferEvent>)> {
        let client = Arc::new(ReqwestClient::new(&config)?);
        Ok(Self::new(config, client))
    }

    /// Starts a transfer under a freshly generated id and returns the id.
    pub async fn start_new(&self, spec: TransferSpec) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.start(&id, spec).await?;
        Ok(id)
    }

    pub async fn start(&self, id: &str, spec: TransferSpec) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(id) {
            return Err(EngineError::DuplicateTransfer(id.to_string()));
        }
        let task = self.create_task(id, spec);
        tasks.insert(id.to_string(), task.start());
        info!(transfer = id, "transfer registered");
        Ok(())
    }

    /// Recreates a transfer from a persisted snapshot and resumes it.
    pub async fn restore(&self, id: &str, spec: TransferSpec, snapshot: Snapshot) -> Result<()> {
        if self.contains(id).await {
            return Err(EngineError::DuplicateTransfer(id.to_string()));
        }

        let mut task = self.create_task(id, spec);
        task.restore(snapshot).await?;

        let handle = {
            let mut tasks = self.tasks.lock().await;
            if tasks.contains_key(id) {
                return Err(EngineError::DuplicateTransfer(id.to_string()));
            }
            let handle = task.spawn();
            tasks.insert(id.to_string(), handle.clone());
            handle
        };
        info!(transfer = id, "transfer restored");
        handle.resume().await?;
        Ok(())
    }

    pub async fn pause(&self, id: &str, silent: bool) -> Result<bool> {
        self.handle(id).await?.pause(silent).await
    }

    pub async fn resume(&self, id: &str) -> Result<bool> {
        self.handle(id).await?.resume().await
    }

    /// Cancels a transfer, deleting its temp files, and forgets it.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let handle = self.handle(id).await?;
        let cancelled = handle.cancel().await?;
        self.tasks.lock().await.remove(id);
        debug!(transfer = id, "transfer unregistered after cancel");
        Ok(cancelled)
    }

    pub async fn snapshot(&self, id: &str) -> Result<Snapshot> {
        self.handle(id).await?.snapshot().await
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.tasks.lock().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        self.tasks.lock().await.keys().cloned().collect()
    }

    async fn handle(&self, id: &str) -> Result<TaskHandle> {
        self.tasks
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTransfer(id.to_string()))
    }

    fn create_task(&self, id: &str, spec: TransferSpec) -> DownloadTask {
        let (tx, rx) = mpsc::unbounded_channel();
        self.forward_events(id.to_string(), rx);
        DownloadTask::new(id, spec, self.config.clone(), self.client.clone(), tx)
    }

    /// Drains one task's events, unregistering it once it completes or fails.
    fn forward_events(&self, id: String, mut rx: mpsc::UnboundedReceiver<TaskEvent>) {
        let tasks = self.tasks.clone();
        let out = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if matches!(event, TaskEvent::Complete { .. } | TaskEvent::Error { .. }) {
                    tasks.lock().await.remove(&id);
                    debug!(transfer = %id, "transfer unregistered");
                }
                let _ = out.send(TransferEvent {
                    id: id.clone(),
                    event,
                });
            }
        });
    }
}
