use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rag_crawl::client::CrawlBackend;
use rag_crawl::error::CrawlError;
use rag_crawl::events::{CrawlEvent, LineStream};
use rag_crawl::ingest::Ingestor;
use rag_crawl::models::{CrawlConfig, CrawlRequest, IngestedDocument, NewDocument, TaskStatus};
use rag_crawl::registry::TaskRegistry;
use rag_crawl::relay::{CrawlRelay, RelaySettings, RelayStream, StatusSnapshot};

/// Backend whose event lines are fed by the test through a channel.
#[derive(Default)]
struct FakeBackend {
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    pause_calls: AtomicUsize,
    lines: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    refuse_start: bool,
}

impl FakeBackend {
    fn with_feed() -> (Arc<Self>, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = FakeBackend {
            lines: Mutex::new(Some(rx)),
            ..Default::default()
        };
        (Arc::new(backend), tx)
    }
}

#[async_trait]
impl CrawlBackend for FakeBackend {
    async fn start(&self, _config: &CrawlConfig) -> Result<LineStream, CrawlError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_start {
            return Err(CrawlError::UpstreamUnavailable {
                status: Some(503),
                body: "overloaded".to_string(),
            });
        }
        let rx = self
            .lines
            .lock()
            .unwrap()
            .take()
            .expect("start called twice");
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (Ok(line), rx))
        })
        .boxed())
    }

    async fn stop(&self, _task_id: &str) -> Result<Value, CrawlError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"success": true}))
    }

    async fn pause(&self, _task_id: &str) -> Result<Value, CrawlError> {
        self.pause_calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"success": true}))
    }

    async fn resume(&self, _task_id: &str) -> Result<Value, CrawlError> {
        Ok(json!({"success": true}))
    }

    async fn status(&self, task_id: &str) -> Result<Value, CrawlError> {
        if task_id == "remote" {
            Ok(json!({"task_id": "remote", "status": "running"}))
        } else {
            Err(CrawlError::upstream_failed(Some(task_id), Some(404), "task not found"))
        }
    }

    async fn list_active(&self) -> Result<Vec<String>, CrawlError> {
        Ok(Vec::new())
    }

    async fn stop_all(&self) -> Result<Value, CrawlError> {
        Ok(json!({"stopped": 0}))
    }
}

/// Records ingested documents; fails any page whose URL contains "broken".
#[derive(Default)]
struct FakeIngestor {
    docs: Mutex<Vec<NewDocument>>,
}

#[async_trait]
impl Ingestor for FakeIngestor {
    async fn ingest(&self, doc: NewDocument) -> anyhow::Result<IngestedDocument> {
        if doc.source_url.as_deref().unwrap_or("").contains("broken") {
            anyhow::bail!("vector store unavailable");
        }
        let mut docs = self.docs.lock().unwrap();
        docs.push(doc);
        Ok(IngestedDocument {
            id: format!("doc-{}", docs.len()),
            chunks: 1,
            deduplicated: false,
        })
    }
}

fn relay_with(backend: Arc<FakeBackend>, ingestor: Arc<FakeIngestor>) -> CrawlRelay {
    let settings = RelaySettings {
        stall_timeout: Duration::from_secs(5),
        max_malformed_events: 3,
        ..Default::default()
    };
    CrawlRelay::new(backend, ingestor, TaskRegistry::new(), settings)
}

fn data(value: Value) -> String {
    format!("data: {}", value)
}

fn started(task_id: &str) -> String {
    data(json!({"type": "crawl_started", "task_id": task_id, "url": "https://example.com"}))
}

fn page(url: &str) -> String {
    data(json!({
        "type": "page_complete",
        "page": {"url": url, "title": "Page", "markdown": format!("Body of {}", url), "depth": 1}
    }))
}

fn complete(pages: u64) -> String {
    data(json!({"type": "crawl_complete", "summary": {"pages": pages, "failures": 0}}))
}

async fn next_event(events: &mut RelayStream) -> CrawlEvent {
    tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended early")
}

async fn collect_all(events: RelayStream) -> Vec<CrawlEvent> {
    tokio::time::timeout(Duration::from_secs(5), events.collect::<Vec<_>>())
        .await
        .expect("timed out collecting events")
}

#[tokio::test]
async fn full_crawl_is_relayed_and_indexed() {
    let (backend, feed) = FakeBackend::with_feed();
    let ingestor = Arc::new(FakeIngestor::default());
    let relay = relay_with(backend.clone(), ingestor.clone());

    let events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();

    feed.send(started("t1")).unwrap();
    feed.send(data(json!({"type": "progress", "processed": 1, "total": 2}))).unwrap();
    feed.send(page("https://example.com/a")).unwrap();
    feed.send(page("https://example.com/b")).unwrap();
    feed.send(complete(2)).unwrap();

    let events = collect_all(events).await;
    let kinds: Vec<&str> = events.iter().map(CrawlEvent::type_name).collect();
    assert_eq!(
        kinds,
        vec!["crawl_started", "progress", "page_complete", "page_complete", "crawl_complete"]
    );

    match events.last().unwrap() {
        CrawlEvent::Completed { summary, .. } => {
            assert_eq!(summary.pages, 2);
            assert_eq!(summary.failures, 0);
            assert_eq!(summary.indexed, Some(2));
        }
        other => panic!("unexpected final event: {:?}", other),
    }

    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 1);

    let docs = ingestor.docs.lock().unwrap();
    assert_eq!(docs.len(), 2);
    assert!(docs.iter().all(|d| d.namespace == "docs"));
    assert!(docs.iter().all(|d| d.crawl_task_id.as_deref() == Some("t1")));

    let task = relay.registry().get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.pages_indexed, 2);
    assert!(task.ended_at.is_some());
}

#[tokio::test]
async fn invalid_request_never_reaches_backend() {
    let (backend, _feed) = FakeBackend::with_feed();
    let relay = relay_with(backend.clone(), Arc::new(FakeIngestor::default()));

    let mut request = CrawlRequest::new("https://example.com", "docs");
    request.max_depth = 99;

    match relay.start(&request).await {
        Err(CrawlError::Validation(fields)) => {
            assert!(fields.iter().any(|f| f.field == "max_depth"));
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("invalid request was accepted"),
    }
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 0);
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn refused_start_is_reported_without_registering() {
    let backend = Arc::new(FakeBackend {
        refuse_start: true,
        ..Default::default()
    });
    let relay = relay_with(backend.clone(), Arc::new(FakeIngestor::default()));

    let result = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await;
    assert!(matches!(
        result,
        Err(CrawlError::UpstreamUnavailable { status: Some(503), .. })
    ));
    assert_eq!(backend.start_calls.load(Ordering::SeqCst), 1);
    assert!(relay.registry().is_empty());
}

#[tokio::test]
async fn task_is_registered_only_after_started_event() {
    let (backend, feed) = FakeBackend::with_feed();
    let relay = relay_with(backend, Arc::new(FakeIngestor::default()));

    let mut events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();
    assert!(relay.registry().is_empty());
    assert_eq!(relay.list_active().count, 0);

    feed.send(started("t1")).unwrap();
    next_event(&mut events).await;

    let task = relay.registry().get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.namespace, "docs");
    assert_eq!(relay.list_active().active_tasks, vec!["t1".to_string()]);
}

#[tokio::test]
async fn malformed_line_between_pages_is_skipped() {
    let (backend, feed) = FakeBackend::with_feed();
    let ingestor = Arc::new(FakeIngestor::default());
    let relay = relay_with(backend, ingestor.clone());

    let events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();

    feed.send(started("t1")).unwrap();
    feed.send(page("https://example.com/a")).unwrap();
    feed.send("data: {\"type\": \"page_complete\", \"page\": ".to_string())
        .unwrap();
    feed.send(page("https://example.com/b")).unwrap();
    feed.send(complete(2)).unwrap();

    let events = collect_all(events).await;
    let pages: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            CrawlEvent::PageComplete { page, .. } => Some(page.url()),
            _ => None,
        })
        .collect();
    assert_eq!(pages, vec!["https://example.com/a", "https://example.com/b"]);
    assert!(events.last().unwrap().is_completion());
    assert_eq!(ingestor.docs.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn repeated_corruption_fails_the_task() {
    let (backend, feed) = FakeBackend::with_feed();
    let relay = relay_with(backend, Arc::new(FakeIngestor::default()));

    let events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();

    feed.send(started("t1")).unwrap();
    for _ in 0..3 {
        feed.send("data: not json".to_string()).unwrap();
    }

    let events = collect_all(events).await;
    let last = events.last().unwrap();
    assert!(last.is_fatal(), "unexpected final event: {:?}", last);
    assert_eq!(relay.registry().get("t1").unwrap().status, TaskStatus::Error);
}

#[tokio::test]
async fn ingestion_failure_is_counted_not_fatal() {
    let (backend, feed) = FakeBackend::with_feed();
    let relay = relay_with(backend, Arc::new(FakeIngestor::default()));

    let events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();

    feed.send(started("t1")).unwrap();
    feed.send(page("https://example.com/ok")).unwrap();
    feed.send(page("https://example.com/broken")).unwrap();
    feed.send(complete(2)).unwrap();

    let events = collect_all(events).await;

    let page_errors: Vec<&CrawlEvent> = events
        .iter()
        .filter(|e| matches!(e, CrawlEvent::Error { .. }))
        .collect();
    assert_eq!(page_errors.len(), 1);
    match page_errors[0] {
        CrawlEvent::Error { url, .. } => {
            assert_eq!(url.as_deref(), Some("https://example.com/broken"));
        }
        _ => unreachable!(),
    }
    assert!(!page_errors[0].is_fatal());
    assert!(page_errors[0]
        .error_message()
        .unwrap()
        .contains("vector store unavailable"));

    match events.last().unwrap() {
        CrawlEvent::Completed { summary, .. } => {
            assert_eq!(summary.pages, 2);
            assert_eq!(summary.failures, 1);
            assert_eq!(summary.indexed, Some(1));
        }
        other => panic!("unexpected final event: {:?}", other),
    }

    let task = relay.registry().get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.ingestion_failures, 1);
    assert_eq!(task.pages_indexed, 1);
}

#[tokio::test]
async fn dropped_stream_marks_task_error() {
    let (backend, feed) = FakeBackend::with_feed();
    let relay = relay_with(backend, Arc::new(FakeIngestor::default()));

    let events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();

    feed.send(started("t1")).unwrap();
    feed.send(page("https://example.com/a")).unwrap();
    drop(feed);

    let events = collect_all(events).await;
    assert_eq!(events.len(), 3);
    assert!(events[2].is_fatal(), "unexpected final event: {:?}", events[2]);
    match &events[2] {
        CrawlEvent::Error { url, .. } => assert!(url.is_none()),
        other => panic!("unexpected final event: {:?}", other),
    }

    let task = relay.registry().get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.last_error.is_some());
    assert!(relay.list_active().active_tasks.is_empty());
}

#[tokio::test]
async fn silent_stream_times_out() {
    let (backend, feed) = FakeBackend::with_feed();
    let settings = RelaySettings {
        stall_timeout: Duration::from_millis(200),
        max_malformed_events: 3,
        ..Default::default()
    };
    let relay = CrawlRelay::new(
        backend,
        Arc::new(FakeIngestor::default()),
        TaskRegistry::new(),
        settings,
    );

    let events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();
    feed.send(started("t1")).unwrap();

    // The feed stays open but silent.
    let events = collect_all(events).await;
    assert_eq!(events.len(), 2);
    assert!(events[1].is_fatal(), "unexpected final event: {:?}", events[1]);
    let message = events[1].error_message().unwrap();
    assert!(message.contains("200ms"), "message: {}", message);

    let task = relay.registry().get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.last_error.unwrap().contains("200ms"));
    drop(feed);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let (backend, feed) = FakeBackend::with_feed();
    let relay = relay_with(backend.clone(), Arc::new(FakeIngestor::default()));

    let mut events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();
    feed.send(started("t1")).unwrap();
    next_event(&mut events).await;

    let first = relay.stop("t1").await.unwrap();
    assert!(first.success);
    let second = relay.stop("t1").await.unwrap();
    assert!(second.success);
    assert!(second.message.contains("already stopped"));

    assert_eq!(backend.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().get("t1").unwrap().status, TaskStatus::Stopped);

    // The upstream closing its stream after a stop is not an error.
    drop(feed);
    let rest = collect_all(events).await;
    assert!(rest.is_empty());
    assert_eq!(relay.registry().get("t1").unwrap().status, TaskStatus::Stopped);
}

#[tokio::test]
async fn pause_and_resume_interleave_with_progress() {
    let (backend, feed) = FakeBackend::with_feed();
    let relay = relay_with(backend.clone(), Arc::new(FakeIngestor::default()));

    let mut events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();
    feed.send(started("t1")).unwrap();
    next_event(&mut events).await;

    relay.pause("t1").await.unwrap();
    assert_eq!(backend.pause_calls.load(Ordering::SeqCst), 1);
    assert_eq!(relay.registry().get("t1").unwrap().status, TaskStatus::Paused);

    feed.send(data(json!({"type": "progress", "processed": 4, "total": 10})))
        .unwrap();
    next_event(&mut events).await;

    let task = relay.registry().get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.pages_processed, 4);
    assert_eq!(relay.list_active().count, 1);

    relay.resume("t1").await.unwrap();
    assert_eq!(relay.registry().get("t1").unwrap().status, TaskStatus::Running);

    feed.send(complete(4)).unwrap();
    let last = next_event(&mut events).await;
    assert!(last.is_completion());
    assert_eq!(relay.registry().get("t1").unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn status_falls_back_to_crawl_service() {
    let (backend, _feed) = FakeBackend::with_feed();
    let relay = relay_with(backend, Arc::new(FakeIngestor::default()));

    match relay.status("remote").await.unwrap() {
        StatusSnapshot::Remote(value) => assert_eq!(value["status"], "running"),
        other => panic!("unexpected snapshot: {:?}", other),
    }
    assert!(matches!(
        relay.status("ghost").await,
        Err(CrawlError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn crawl_continues_after_caller_disconnects() {
    let (backend, feed) = FakeBackend::with_feed();
    let ingestor = Arc::new(FakeIngestor::default());
    let relay = relay_with(backend, ingestor.clone());

    let mut events = relay
        .start(&CrawlRequest::new("https://example.com", "docs"))
        .await
        .unwrap();
    feed.send(started("t1")).unwrap();
    next_event(&mut events).await;
    drop(events);

    feed.send(page("https://example.com/a")).unwrap();
    feed.send(complete(1)).unwrap();

    let registry = relay.registry().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if registry
                .get("t1")
                .map(|t| t.status == TaskStatus::Completed)
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task never completed");

    assert_eq!(ingestor.docs.lock().unwrap().len(), 1);
}
