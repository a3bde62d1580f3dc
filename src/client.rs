//! Client for the external crawl service.
//!
//! [`CrawlBackend`] is the seam the relay talks to; [`CrawlServiceClient`]
//! implements it over HTTP. No retries happen at this layer.
//!
//! | Operation | Upstream call |
//! |-----------|---------------|
//! | `start` | `POST /crawl/stream` (kept open, read line by line) |
//! | `stop` | `POST /crawl/stop/{id}` |
//! | `pause` | `POST /crawl/pause/{id}` |
//! | `resume` | `POST /crawl/resume/{id}` |
//! | `status` | `GET /crawl/status/{id}` |
//! | `list_active` | `GET /crawl/active` |
//! | `stop_all` | `DELETE /crawl/stop-all` |

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;
use tracing::debug;
use url::Url;

use crate::config::CrawlServiceConfig;
use crate::error::CrawlError;
use crate::events::LineStream;
use crate::models::{BrowserType, CrawlConfig, WaitUntil};

/// Remote crawl job control.
#[async_trait]
pub trait CrawlBackend: Send + Sync {
    /// Starts a crawl and returns its raw event lines.
    async fn start(&self, config: &CrawlConfig) -> Result<LineStream, CrawlError>;

    async fn stop(&self, task_id: &str) -> Result<Value, CrawlError>;

    async fn pause(&self, task_id: &str) -> Result<Value, CrawlError>;

    async fn resume(&self, task_id: &str) -> Result<Value, CrawlError>;

    async fn status(&self, task_id: &str) -> Result<Value, CrawlError>;

    async fn list_active(&self) -> Result<Vec<String>, CrawlError>;

    async fn stop_all(&self) -> Result<Value, CrawlError>;
}

/// Request body for `POST /crawl/stream`.
#[derive(Debug, Serialize)]
struct StreamRequestBody<'a> {
    url: &'a str,
    max_depth: u32,
    max_pages: u32,
    browser_type: BrowserType,
    wait_until: WaitUntil,
    exclude_external_links: bool,
    exclude_external_images: bool,
    word_count_threshold: u32,
    page_timeout: u32,
    stream: bool,
}

impl<'a> From<&'a CrawlConfig> for StreamRequestBody<'a> {
    fn from(config: &'a CrawlConfig) -> Self {
        Self {
            url: config.url.as_str(),
            max_depth: config.max_depth,
            max_pages: config.max_pages,
            browser_type: config.browser_type,
            wait_until: config.wait_until,
            exclude_external_links: config.exclude_external_links,
            exclude_external_images: config.exclude_external_images,
            word_count_threshold: config.word_count_threshold,
            page_timeout: config.page_timeout_ms,
            stream: true,
        }
    }
}

/// HTTP implementation of [`CrawlBackend`].
pub struct CrawlServiceClient {
    http: reqwest::Client,
    base_url: String,
    base: Url,
    request_timeout: Duration,
}

impl CrawlServiceClient {
    pub fn new(config: &CrawlServiceConfig) -> anyhow::Result<Self> {
        // No overall timeout: the stream request stays open for the whole crawl.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        let base_url = config.api_url.trim_end_matches('/').to_string();
        let base = Url::parse(&base_url)?;
        if base.cannot_be_a_base() {
            anyhow::bail!("crawl service url cannot carry a path: {}", base_url);
        }

        Ok(Self {
            http,
            base_url,
            base,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Appends path segments to the base URL, percent-encoding each one.
    fn control_url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn control(
        &self,
        method: Method,
        segments: &[&str],
        task_id: Option<&str>,
    ) -> Result<Value, CrawlError> {
        let url = self.control_url(segments);
        debug!(%method, path = url.path(), "crawl service control call");

        let response = self
            .http
            .request(method, url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| CrawlError::upstream_failed(task_id, None, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CrawlError::upstream_failed(task_id, Some(status.as_u16()), e.to_string()))?;

        if !status.is_success() {
            return Err(CrawlError::upstream_failed(
                task_id,
                Some(status.as_u16()),
                error_text(&body),
            ));
        }

        if body.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        serde_json::from_str(&body).map_err(|e| {
            CrawlError::upstream_failed(
                task_id,
                Some(status.as_u16()),
                format!("invalid JSON response: {}", e),
            )
        })
    }
}

/// Pulls a readable message out of an upstream error body.
fn error_text(body: &str) -> String {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "message", "error"] {
            if let Some(msg) = json.get(key).and_then(Value::as_str) {
                return msg.to_string();
            }
        }
    }
    if body.trim().is_empty() {
        "empty response body".to_string()
    } else {
        body.trim().to_string()
    }
}

/// Extracts task ids from the `/crawl/active` response.
///
/// Accepts a bare array, or an object with an `active_tasks` array whose
/// items are ids or objects carrying a `task_id`.
fn parse_active_ids(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("active_tasks").and_then(Value::as_array) {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(id.clone()),
            Value::Object(obj) => obj
                .get("task_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

#[async_trait]
impl CrawlBackend for CrawlServiceClient {
    async fn start(&self, config: &CrawlConfig) -> Result<LineStream, CrawlError> {
        let body = StreamRequestBody::from(config);

        let response = self
            .http
            .post(self.endpoint("/crawl/stream"))
            .header(ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| CrawlError::UpstreamUnavailable {
                status: None,
                body: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrawlError::UpstreamUnavailable {
                status: Some(status.as_u16()),
                body,
            });
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)))
            .boxed();
        let lines = StreamReader::new(bytes).lines();

        let stream = stream::unfold(lines, |mut lines| async move {
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), lines)),
                Ok(None) => None,
                Err(e) => Some((Err(CrawlError::StreamInterrupted(e.to_string())), lines)),
            }
        });

        Ok(stream.boxed())
    }

    async fn stop(&self, task_id: &str) -> Result<Value, CrawlError> {
        self.control(Method::POST, &["crawl", "stop", task_id], Some(task_id))
            .await
    }

    async fn pause(&self, task_id: &str) -> Result<Value, CrawlError> {
        self.control(Method::POST, &["crawl", "pause", task_id], Some(task_id))
            .await
    }

    async fn resume(&self, task_id: &str) -> Result<Value, CrawlError> {
        self.control(Method::POST, &["crawl", "resume", task_id], Some(task_id))
            .await
    }

    async fn status(&self, task_id: &str) -> Result<Value, CrawlError> {
        self.control(Method::GET, &["crawl", "status", task_id], Some(task_id))
            .await
    }

    async fn list_active(&self) -> Result<Vec<String>, CrawlError> {
        let value = self.control(Method::GET, &["crawl", "active"], None).await?;
        Ok(parse_active_ids(&value))
    }

    async fn stop_all(&self) -> Result<Value, CrawlError> {
        self.control(Method::DELETE, &["crawl", "stop-all"], None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CrawlRequest;
    use serde_json::json;

    #[test]
    fn request_body_uses_wire_names() {
        let config = CrawlRequest::new("https://example.com", "docs")
            .validate()
            .unwrap();
        let body = serde_json::to_value(StreamRequestBody::from(&config)).unwrap();
        assert_eq!(body["url"], "https://example.com/");
        assert_eq!(body["browser_type"], "chromium");
        assert_eq!(body["wait_until"], "networkidle");
        assert_eq!(body["page_timeout"], 60000);
        assert_eq!(body["stream"], true);
        assert!(body.get("namespace").is_none());
    }

    #[test]
    fn control_url_encodes_task_ids() {
        let client = CrawlServiceClient::new(&CrawlServiceConfig {
            api_url: "http://crawler:8001/api/v1/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            client.control_url(&["crawl", "stop", "a/b?c#d"]).as_str(),
            "http://crawler:8001/api/v1/crawl/stop/a%2Fb%3Fc%23d"
        );
        assert_eq!(
            client.control_url(&["crawl", "active"]).as_str(),
            "http://crawler:8001/api/v1/crawl/active"
        );
    }

    #[test]
    fn error_text_prefers_structured_detail() {
        assert_eq!(error_text(r#"{"detail":"task not found"}"#), "task not found");
        assert_eq!(error_text("bad gateway"), "bad gateway");
        assert_eq!(error_text(""), "empty response body");
    }

    #[test]
    fn active_ids_from_either_shape() {
        assert_eq!(parse_active_ids(&json!(["a", "b"])), vec!["a", "b"]);
        assert_eq!(
            parse_active_ids(&json!({"active_tasks": [{"task_id": "c"}, "d"], "count": 2})),
            vec!["c", "d"]
        );
        assert!(parse_active_ids(&json!({"unexpected": true})).is_empty());
    }
}
