//! The crawl relay: one state machine per crawl task.
//!
//! ```text
//! start ──validate──▶ backend.start ──▶ parse_events ──▶ driver task ──mpsc──▶ caller stream
//!                                                          │
//!                                                          ├─▶ TaskRegistry (every event)
//!                                                          └─▶ Ingestor (page_complete, in a JoinSet)
//! ```
//!
//! Every parsed event is forwarded to the caller unchanged, in the order it
//! was received. Ingestion runs concurrently with the stream; a page that
//! fails to index produces an extra non-fatal `error` event and is added to
//! the completion summary's failure count.
//!
//! The task only reaches the registry once `crawl_started` is seen. Stream
//! failures (connection closed early, repeated corrupt lines, no events for
//! `stall_timeout`) mark the task `error` and end the caller stream with a
//! final `error` event carrying `fatal: true`.
//!
//! If the caller goes away mid-crawl the driver keeps consuming the upstream
//! stream so pages that were already crawled still get indexed.

use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{CrawlBackend, CrawlServiceClient};
use crate::config::{Config, CrawlServiceConfig};
use crate::error::CrawlError;
use crate::events::{parse_events, CrawlEvent, EventStream};
use crate::ingest::{ingest_page, Ingestor, SqliteIngestor};
use crate::models::{CrawlRequest, CrawlTask, IngestedDocument, TaskStatus};
use crate::registry::{TaskPatch, TaskRegistry};

/// Events relayed to one caller.
pub type RelayStream = BoxStream<'static, CrawlEvent>;

const CALLER_BUFFER: usize = 64;
const MAX_INGEST_IN_FLIGHT: usize = 16;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Upstream silence after which the stream counts as interrupted.
    pub stall_timeout: Duration,
    pub max_malformed_events: usize,
    /// How long terminal tasks stay in the registry.
    pub finished_retention: chrono::Duration,
}

impl RelaySettings {
    pub fn from_config(config: &CrawlServiceConfig) -> Self {
        Self {
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            max_malformed_events: config.max_malformed_events,
            finished_retention: chrono::Duration::seconds(config.finished_retention_secs as i64),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&CrawlServiceConfig::default())
    }
}

/// Response body of the control endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ControlAck {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub timestamp: String,
    /// Body returned by the crawl service, when it was called.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Value>,
}

impl ControlAck {
    fn new(message: String, task_id: Option<&str>, upstream: Option<Value>) -> Self {
        Self {
            success: true,
            message,
            task_id: task_id.map(str::to_string),
            timestamp: Utc::now().to_rfc3339(),
            upstream,
        }
    }
}

/// Response body of `GET /api/crawl/active`.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTasks {
    pub active_tasks: Vec<String>,
    pub task_details: Vec<CrawlTask>,
    pub count: usize,
}

/// A task snapshot, from the local registry or, failing that, the crawl service.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatusSnapshot {
    Local(CrawlTask),
    Remote(Value),
}

pub struct CrawlRelay {
    backend: Arc<dyn CrawlBackend>,
    ingestor: Arc<dyn Ingestor>,
    registry: TaskRegistry,
    settings: RelaySettings,
}

impl CrawlRelay {
    pub fn new(
        backend: Arc<dyn CrawlBackend>,
        ingestor: Arc<dyn Ingestor>,
        registry: TaskRegistry,
        settings: RelaySettings,
    ) -> Self {
        Self {
            backend,
            ingestor,
            registry,
            settings,
        }
    }

    /// Production wiring: HTTP crawl client + SQLite ingestion.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let backend = Arc::new(CrawlServiceClient::new(&config.crawl)?);
        let ingestor = Arc::new(SqliteIngestor::new(pool, config)?);
        Ok(Self::new(
            backend,
            ingestor,
            TaskRegistry::new(),
            RelaySettings::from_config(&config.crawl),
        ))
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Validates the request, starts the remote crawl and returns the relayed
    /// event stream.
    ///
    /// Invalid requests fail with [`CrawlError::Validation`] before the
    /// crawl service is contacted. A refused start fails with
    /// [`CrawlError::UpstreamUnavailable`]; everything after that is
    /// reported in-stream.
    pub async fn start(&self, request: &CrawlRequest) -> Result<RelayStream, CrawlError> {
        let config = request.validate()?;

        let pruned = self.registry.prune_finished(self.settings.finished_retention);
        if pruned > 0 {
            debug!(pruned, "pruned finished crawl tasks");
        }

        info!(url = %config.url, namespace = %config.namespace, "starting crawl");
        let lines = self.backend.start(&config).await?;
        let events = parse_events(lines, self.settings.max_malformed_events);

        let (tx, rx) = mpsc::channel(CALLER_BUFFER);
        let driver = Driver {
            ingestor: self.ingestor.clone(),
            registry: self.registry.clone(),
            url: config.url.to_string(),
            namespace: config.namespace.clone(),
            stall_timeout: self.settings.stall_timeout,
            tx,
            caller_gone: false,
            task_id: None,
            pending: JoinSet::new(),
            indexed: 0,
            failures: 0,
        };
        tokio::spawn(driver.run(events));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed())
    }

    /// Stops a task. The registry is marked `stopped` before the crawl
    /// service is told; stopping an already-finished task is a no-op.
    pub async fn stop(&self, task_id: &str) -> Result<ControlAck, CrawlError> {
        if let Some(task) = self.registry.get(task_id) {
            if task.status.is_terminal() {
                return Ok(ControlAck::new(
                    format!("Crawl task {} already {}", task_id, task.status),
                    Some(task_id),
                    None,
                ));
            }
        }

        let known = self
            .registry
            .update(task_id, TaskPatch::status(TaskStatus::Stopped))
            .is_some();

        let upstream = self.backend.stop(task_id).await.map_err(|e| {
            if known {
                warn!(task_id, error = %e, "crawl service did not acknowledge stop");
            }
            e
        })?;

        info!(task_id, "crawl task stopped");
        Ok(ControlAck::new(
            format!("Crawl task {} stopped", task_id),
            Some(task_id),
            Some(upstream),
        ))
    }

    /// Pauses the remote job. Events already in flight keep being relayed.
    pub async fn pause(&self, task_id: &str) -> Result<ControlAck, CrawlError> {
        let upstream = self.backend.pause(task_id).await?;
        self.registry
            .update(task_id, TaskPatch::status(TaskStatus::Paused));
        info!(task_id, "crawl task paused");
        Ok(ControlAck::new(
            format!("Crawl task {} paused", task_id),
            Some(task_id),
            Some(upstream),
        ))
    }

    pub async fn resume(&self, task_id: &str) -> Result<ControlAck, CrawlError> {
        let upstream = self.backend.resume(task_id).await?;
        self.registry
            .update(task_id, TaskPatch::status(TaskStatus::Running));
        info!(task_id, "crawl task resumed");
        Ok(ControlAck::new(
            format!("Crawl task {} resumed", task_id),
            Some(task_id),
            Some(upstream),
        ))
    }

    pub async fn stop_all(&self) -> Result<ControlAck, CrawlError> {
        let stopped = self.registry.mark_all_active(TaskStatus::Stopped);
        let upstream = self.backend.stop_all().await?;
        info!(count = stopped.len(), "all crawl tasks stopped");
        Ok(ControlAck::new(
            format!("Stopped {} active crawl tasks", stopped.len()),
            None,
            Some(upstream),
        ))
    }

    /// Local snapshot if the task is known here, otherwise the crawl
    /// service's own status.
    pub async fn status(&self, task_id: &str) -> Result<StatusSnapshot, CrawlError> {
        if let Some(task) = self.registry.get(task_id) {
            return Ok(StatusSnapshot::Local(task));
        }
        match self.backend.status(task_id).await {
            Ok(value) => Ok(StatusSnapshot::Remote(value)),
            Err(CrawlError::UpstreamRequestFailed {
                status: Some(404), ..
            }) => Err(CrawlError::TaskNotFound(task_id.to_string())),
            Err(e) => Err(e),
        }
    }

    pub fn list_active(&self) -> ActiveTasks {
        let task_details = self.registry.list_active();
        let active_tasks = task_details.iter().map(|t| t.task_id.clone()).collect();
        ActiveTasks {
            active_tasks,
            count: task_details.len(),
            task_details,
        }
    }
}

type IngestOutcome = (String, Result<IngestedDocument, CrawlError>);

/// Consumes one task's event stream.
struct Driver {
    ingestor: Arc<dyn Ingestor>,
    registry: TaskRegistry,
    url: String,
    namespace: String,
    stall_timeout: Duration,
    tx: mpsc::Sender<CrawlEvent>,
    caller_gone: bool,
    task_id: Option<String>,
    pending: JoinSet<IngestOutcome>,
    indexed: u64,
    failures: u64,
}

enum Flow {
    Continue,
    Done,
}

impl Driver {
    async fn run(mut self, mut events: EventStream) {
        let mut deadline = Instant::now() + self.stall_timeout;

        loop {
            tokio::select! {
                Some(joined) = self.pending.join_next(), if !self.pending.is_empty() => {
                    self.on_ingested(joined).await;
                }
                next = tokio::time::timeout_at(deadline, events.next()) => {
                    deadline = Instant::now() + self.stall_timeout;
                    let flow = match next {
                        Err(_) => {
                            let err = CrawlError::StreamInterrupted(format!(
                                "no events received for {:?}",
                                self.stall_timeout
                            ));
                            self.fail(err).await
                        }
                        Ok(None) => {
                            let err = CrawlError::StreamInterrupted("event stream ended".to_string());
                            self.fail(err).await
                        }
                        Ok(Some(Err(err))) => self.fail(err).await,
                        Ok(Some(Ok(event))) => self.on_event(event).await,
                    };
                    if let Flow::Done = flow {
                        return;
                    }
                }
            }
        }
    }

    async fn on_event(&mut self, event: CrawlEvent) -> Flow {
        match event {
            CrawlEvent::Started { ref task_id, .. } => {
                info!(task_id = %task_id, url = %self.url, namespace = %self.namespace, "crawl started");
                self.registry.upsert(
                    task_id,
                    TaskPatch {
                        url: Some(self.url.clone()),
                        namespace: Some(self.namespace.clone()),
                        status: Some(TaskStatus::Running),
                        ..Default::default()
                    },
                );
                self.task_id = Some(task_id.clone());
                self.send(event).await;
            }
            CrawlEvent::Progress {
                processed,
                total,
                ref current_url,
                ..
            } => {
                if let Some(id) = &self.task_id {
                    self.registry.update(
                        id,
                        TaskPatch::progress(processed, total, current_url.clone()),
                    );
                }
                self.send(event).await;
            }
            CrawlEvent::PageComplete { ref page, .. } => {
                if let Some(id) = &self.task_id {
                    self.registry.update(
                        id,
                        TaskPatch {
                            current_url: Some(page.url().to_string()),
                            ..Default::default()
                        },
                    );
                }

                while self.pending.len() >= MAX_INGEST_IN_FLIGHT {
                    match self.pending.join_next().await {
                        Some(joined) => self.on_ingested(joined).await,
                        None => break,
                    }
                }

                let ingestor = self.ingestor.clone();
                let namespace = self.namespace.clone();
                let task_id = self.task_id.clone();
                let page_for_ingest = page.clone();
                self.pending.spawn(async move {
                    let result = ingest_page(
                        ingestor.as_ref(),
                        &page_for_ingest,
                        &namespace,
                        task_id.as_deref(),
                    )
                    .await;
                    (page_for_ingest.url().to_string(), result)
                });

                self.send(event).await;
            }
            CrawlEvent::Error { .. } => {
                let message = event.error_message().unwrap_or_default().to_string();
                warn!(task_id = ?self.task_id, message = %message, "crawl service reported an error");
                if let Some(id) = &self.task_id {
                    self.registry.update(id, TaskPatch::error(message));
                }
                self.send(event).await;
            }
            CrawlEvent::Completed { mut summary, extra } => {
                self.drain().await;
                summary.failures += self.failures;
                summary.indexed = Some(self.indexed);

                if let Some(id) = &self.task_id {
                    self.registry
                        .update(id, TaskPatch::status(TaskStatus::Completed));
                }
                info!(
                    task_id = ?self.task_id,
                    pages = summary.pages,
                    indexed = self.indexed,
                    failures = summary.failures,
                    "crawl completed"
                );
                self.send(CrawlEvent::Completed { summary, extra }).await;
                return Flow::Done;
            }
        }
        Flow::Continue
    }

    async fn on_ingested(&mut self, joined: Result<IngestOutcome, JoinError>) {
        match joined {
            Ok((url, Ok(doc))) => {
                self.indexed += 1;
                debug!(url = %url, document_id = %doc.id, chunks = doc.chunks, deduplicated = doc.deduplicated, "page indexed");
                if let Some(id) = &self.task_id {
                    self.registry.update(
                        id,
                        TaskPatch {
                            pages_indexed_delta: 1,
                            ..Default::default()
                        },
                    );
                }
            }
            Ok((url, Err(err))) => {
                self.failures += 1;
                warn!(url = %url, task_id = ?self.task_id, error = %err, "page ingestion failed");
                self.record_failure();
                self.send(CrawlEvent::page_error(url, err.to_string())).await;
            }
            Err(join_err) => {
                self.failures += 1;
                error!(task_id = ?self.task_id, error = %join_err, "ingestion task aborted");
                self.record_failure();
                self.send(CrawlEvent::Error {
                    message: Some(format!("page ingestion aborted: {}", join_err)),
                    url: None,
                    fatal: Some(false),
                    timestamp: Some(Utc::now().to_rfc3339()),
                    extra: Default::default(),
                })
                .await;
            }
        }
    }

    fn record_failure(&self) {
        if let Some(id) = &self.task_id {
            self.registry.update(
                id,
                TaskPatch {
                    ingestion_failures_delta: 1,
                    ..Default::default()
                },
            );
        }
    }

    /// Waits for every in-flight ingestion.
    async fn drain(&mut self) {
        while let Some(joined) = self.pending.join_next().await {
            self.on_ingested(joined).await;
        }
    }

    /// Ends the task after an unrecoverable stream failure.
    async fn fail(&mut self, err: CrawlError) -> Flow {
        self.drain().await;
        let message = err.to_string();

        let Some(id) = self.task_id.clone() else {
            error!(url = %self.url, error = %message, "crawl stream failed before the task started");
            self.send(CrawlEvent::fatal_error(message)).await;
            return Flow::Done;
        };

        let stopped = self
            .registry
            .get(&id)
            .map(|t| t.status == TaskStatus::Stopped)
            .unwrap_or(false);
        if stopped {
            debug!(task_id = %id, "stream of stopped task closed");
            return Flow::Done;
        }

        error!(task_id = %id, error = %message, "crawl stream failed");
        self.registry.update(
            &id,
            TaskPatch {
                status: Some(TaskStatus::Error),
                last_error: Some(message.clone()),
                ..Default::default()
            },
        );
        self.send(CrawlEvent::fatal_error(message)).await;
        Flow::Done
    }

    async fn send(&mut self, event: CrawlEvent) {
        if self.caller_gone {
            return;
        }
        if self.tx.send(event).await.is_err() {
            self.caller_gone = true;
            debug!(task_id = ?self.task_id, "caller disconnected; crawl continues in background");
        }
    }
}
