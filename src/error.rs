//! Error taxonomy for the crawl core.
//!
//! Only stream-level failures ([`CrawlError::StreamInterrupted`] and repeated
//! [`CrawlError::StreamCorruption`]) change a task's terminal status. Page
//! ingestion failures are counted, control-call failures go back to the
//! caller of that control call.

use serde::Serialize;
use thiserror::Error;

/// One rejected field of a crawl request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("invalid crawl configuration: {}", summarize(.0))]
    Validation(Vec<FieldError>),

    #[error("crawl service unavailable{}: {body}", status_suffix(.status))]
    UpstreamUnavailable { status: Option<u16>, body: String },

    #[error("crawl service request failed for task '{}'{}: {message}", task_label(.task_id), status_suffix(.status))]
    UpstreamRequestFailed {
        task_id: Option<String>,
        status: Option<u16>,
        message: String,
    },

    #[error("malformed event ({reason}): {line}")]
    StreamCorruption { line: String, reason: String },

    #[error("crawl stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("failed to index {url}: {source}")]
    Ingestion {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task not found: {0}")]
    TaskNotFound(String),
}

impl CrawlError {
    pub fn upstream_failed(
        task_id: Option<&str>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        CrawlError::UpstreamRequestFailed {
            task_id: task_id.map(str::to_string),
            status,
            message: message.into(),
        }
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

fn task_label(task_id: &Option<String>) -> &str {
    task_id.as_deref().unwrap_or("*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_message_lists_every_field() {
        let err = CrawlError::Validation(vec![
            FieldError::new("max_depth", "must be between 1 and 10"),
            FieldError::new("namespace", "must not be empty"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("max_depth: must be between 1 and 10"));
        assert!(msg.contains("namespace: must not be empty"));
    }

    #[test]
    fn upstream_failure_carries_task_and_status() {
        let err = CrawlError::upstream_failed(Some("t1"), Some(404), "no such task");
        assert_eq!(
            err.to_string(),
            "crawl service request failed for task 't1' (HTTP 404): no such task"
        );
    }
}
