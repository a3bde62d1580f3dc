//! Crawl event envelope and line-oriented stream parser.
//!
//! The crawl service speaks server-sent events where every payload is a JSON
//! object with a `type` discriminator:
//!
//! ```text
//! data: {"type":"crawl_started","task_id":"t1"}
//! data: {"type":"progress","processed":1,"total":3,"current_url":"https://example.com/a"}
//! data: {"type":"page_complete","page":{"url":"https://example.com/a","markdown":"..."}}
//! data: {"type":"error","message":"timeout fetching https://example.com/b"}
//! data: {"type":"crawl_complete","summary":{"pages":2,"failures":0}}
//! ```
//!
//! [`CrawlEvent`] is used on both sides of the relay: it is what
//! [`parse_events`] yields and what the HTTP layer re-emits.

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::CrawlError;
use crate::models::CrawledPage;

/// Raw lines read from the upstream connection.
pub type LineStream = BoxStream<'static, Result<String, CrawlError>>;

/// Typed events decoded from a [`LineStream`].
pub type EventStream = BoxStream<'static, Result<CrawlEvent, CrawlError>>;

const KNOWN_TYPES: &[&str] = &[
    "crawl_started",
    "progress",
    "page_complete",
    "error",
    "crawl_complete",
];

/// One event of a crawl, in the wire shape shared by upstream and callers.
///
/// Fields not modelled here are kept in `extra` and re-emitted, so a relayed
/// event carries everything the crawl service sent. Modelled optional fields
/// that arrive as an explicit `null` are relayed as absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrawlEvent {
    #[serde(rename = "crawl_started")]
    Started {
        task_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Progress {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        processed: Option<u64>,
        /// `0` or absent while the crawler has not estimated the site size.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_url: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    PageComplete {
        page: CrawledPage,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Page the error relates to, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// Set by this service on errors that ended the task.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fatal: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<String>,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
    /// The relay fills in `summary.indexed` and adds its ingestion failures
    /// to `summary.failures`; everything else is relayed as received.
    #[serde(rename = "crawl_complete")]
    Completed {
        #[serde(default)]
        summary: CompletionSummary,
        #[serde(flatten)]
        extra: Map<String, Value>,
    },
}

const UNKNOWN_ERROR: &str = "Unknown error";

impl CrawlEvent {
    /// A non-fatal error event about one page.
    pub fn page_error(url: impl Into<String>, message: impl Into<String>) -> Self {
        CrawlEvent::Error {
            message: Some(message.into()),
            url: Some(url.into()),
            fatal: Some(false),
            timestamp: Some(now_iso()),
            extra: Map::new(),
        }
    }

    /// The final event sent when a task ends without `crawl_complete`.
    pub fn fatal_error(message: impl Into<String>) -> Self {
        CrawlEvent::Error {
            message: Some(message.into()),
            url: None,
            fatal: Some(true),
            timestamp: Some(now_iso()),
            extra: Map::new(),
        }
    }

    pub fn completed(summary: CompletionSummary) -> Self {
        CrawlEvent::Completed {
            summary,
            extra: Map::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CrawlEvent::Started { .. } => "crawl_started",
            CrawlEvent::Progress { .. } => "progress",
            CrawlEvent::PageComplete { .. } => "page_complete",
            CrawlEvent::Error { .. } => "error",
            CrawlEvent::Completed { .. } => "crawl_complete",
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, CrawlEvent::Completed { .. })
    }

    /// True for the error event that ends a task.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CrawlEvent::Error { fatal: Some(true), .. })
    }

    /// The message of an `error` event, defaulted when upstream sent none.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            CrawlEvent::Error { message, .. } => Some(message.as_deref().unwrap_or(UNKNOWN_ERROR)),
            _ => None,
        }
    }
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// End-of-crawl totals. Upstream fields not modelled here are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSummary {
    #[serde(default)]
    pub pages: u64,
    /// Pages the crawler or the indexer failed on.
    #[serde(default)]
    pub failures: u64,
    /// Pages successfully indexed by this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexed: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classification of a single upstream line.
#[derive(Debug)]
pub enum LineOutcome {
    Event(CrawlEvent),
    /// Not an event line, or an event type we do not track.
    Skip,
    Malformed(CrawlError),
}

/// Classifies one line of the upstream stream.
pub fn parse_line(line: &str) -> LineOutcome {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    let Some(payload) = line.strip_prefix("data:") else {
        return LineOutcome::Skip;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return LineOutcome::Skip;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return LineOutcome::Malformed(corruption(line, e.to_string())),
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return LineOutcome::Malformed(corruption(line, "missing event type".to_string()));
    };
    if !KNOWN_TYPES.contains(&kind) {
        debug!(event_type = kind, "skipping unknown event type");
        return LineOutcome::Skip;
    }

    match serde_json::from_value::<CrawlEvent>(value) {
        Ok(event) => LineOutcome::Event(event),
        Err(e) => LineOutcome::Malformed(corruption(line, e.to_string())),
    }
}

fn corruption(line: &str, reason: String) -> CrawlError {
    const MAX_LINE: usize = 200;
    let line = match line.char_indices().nth(MAX_LINE) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    };
    CrawlError::StreamCorruption { line, reason }
}

struct ParserState {
    lines: LineStream,
    finished: bool,
    malformed_run: usize,
    max_malformed: usize,
}

/// Decodes a line stream into events, lazily.
///
/// Corrupt lines are logged and skipped; `max_malformed` corrupt lines in a
/// row end the stream with [`CrawlError::StreamCorruption`]. The stream ends
/// after the first `crawl_complete` event. If the connection closes before
/// that, a final [`CrawlError::StreamInterrupted`] is yielded.
pub fn parse_events(lines: LineStream, max_malformed: usize) -> EventStream {
    let state = ParserState {
        lines,
        finished: false,
        malformed_run: 0,
        max_malformed: max_malformed.max(1),
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.lines.next().await {
                None => {
                    state.finished = true;
                    let err = CrawlError::StreamInterrupted(
                        "connection closed before crawl_complete".to_string(),
                    );
                    return Some((Err(err), state));
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err), state));
                }
                Some(Ok(line)) => match parse_line(&line) {
                    LineOutcome::Skip => continue,
                    LineOutcome::Event(event) => {
                        state.malformed_run = 0;
                        if event.is_completion() {
                            state.finished = true;
                        }
                        return Some((Ok(event), state));
                    }
                    LineOutcome::Malformed(err) => {
                        state.malformed_run += 1;
                        warn!(error = %err, run = state.malformed_run, "skipping malformed event");
                        if state.malformed_run >= state.max_malformed {
                            state.finished = true;
                            return Some((Err(err), state));
                        }
                    }
                },
            }
        }
    })
    .boxed()
}
