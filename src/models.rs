//! Core data models for the crawl relay.
//!
//! [`CrawlRequest`] is what a caller sends; [`CrawlRequest::validate`] turns
//! it into a [`CrawlConfig`] or a list of field errors. [`CrawledPage`] is one
//! page as delivered by the crawl service, [`CrawlTask`] is the registry's
//! view of one job, and [`NewDocument`] is what the ingestion pipeline
//! consumes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::IpAddr;
use url::{Host, Url};

use crate::error::{CrawlError, FieldError};

pub const MAX_DEPTH: i64 = 10;
pub const MAX_PAGES: i64 = 5000;
pub const MAX_NAMESPACE_LEN: usize = 50;
pub const PAGE_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<i64> = 10_000..=300_000;

const BLOCKED_HOSTS: &[&str] = &["localhost", "127.0.0.1", "0.0.0.0", "::1"];
const BLOCKED_PORTS: &[u16] = &[22, 23, 25, 53, 135, 139, 445, 993, 995];

/// Rendering engine used by the remote crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserType {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "chromium" => Some(Self::Chromium),
            "firefox" => Some(Self::Firefox),
            "webkit" => Some(Self::Webkit),
            _ => None,
        }
    }
}

/// Page-load condition the remote crawler waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    Networkidle,
    Domcontentloaded,
    Load,
}

impl WaitUntil {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "networkidle" => Some(Self::Networkidle),
            "domcontentloaded" => Some(Self::Domcontentloaded),
            "load" => Some(Self::Load),
            _ => None,
        }
    }
}

/// Unvalidated crawl request as received from a caller.
///
/// Every field has a default so that missing values surface as field errors
/// from [`validate`](CrawlRequest::validate) instead of a body rejection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CrawlRequest {
    pub url: String,
    #[serde(alias = "maxDepth")]
    pub max_depth: i64,
    #[serde(alias = "maxPages")]
    pub max_pages: i64,
    #[serde(alias = "browserType")]
    pub browser_type: String,
    #[serde(alias = "waitUntil")]
    pub wait_until: String,
    #[serde(alias = "excludeExternalLinks")]
    pub exclude_external_links: bool,
    #[serde(alias = "excludeExternalImages")]
    pub exclude_external_images: bool,
    #[serde(alias = "wordCountThreshold")]
    pub word_count_threshold: i64,
    #[serde(alias = "pageTimeout")]
    pub page_timeout: i64,
    pub namespace: String,
}

impl Default for CrawlRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_depth: 3,
            max_pages: 50,
            browser_type: "chromium".to_string(),
            wait_until: "networkidle".to_string(),
            exclude_external_links: false,
            exclude_external_images: false,
            word_count_threshold: 5,
            page_timeout: 60_000,
            namespace: "default".to_string(),
        }
    }
}

impl CrawlRequest {
    pub fn new(url: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Checks every field and returns all violations at once.
    pub fn validate(&self) -> Result<CrawlConfig, CrawlError> {
        let mut errors = Vec::new();

        let url = match check_url(&self.url) {
            Ok(url) => Some(url),
            Err(message) => {
                errors.push(FieldError::new("url", message));
                None
            }
        };

        if !(1..=MAX_DEPTH).contains(&self.max_depth) {
            errors.push(FieldError::new(
                "max_depth",
                format!("must be between 1 and {}", MAX_DEPTH),
            ));
        }
        if !(1..=MAX_PAGES).contains(&self.max_pages) {
            errors.push(FieldError::new(
                "max_pages",
                format!("must be between 1 and {}", MAX_PAGES),
            ));
        }

        let browser_type = BrowserType::parse(&self.browser_type);
        if browser_type.is_none() {
            errors.push(FieldError::new(
                "browser_type",
                "must be one of chromium, firefox, webkit",
            ));
        }
        let wait_until = WaitUntil::parse(&self.wait_until);
        if wait_until.is_none() {
            errors.push(FieldError::new(
                "wait_until",
                "must be one of networkidle, domcontentloaded, load",
            ));
        }

        if self.word_count_threshold < 1 || self.word_count_threshold > u32::MAX as i64 {
            errors.push(FieldError::new("word_count_threshold", "must be >= 1"));
        }
        if !PAGE_TIMEOUT_RANGE_MS.contains(&self.page_timeout) {
            errors.push(FieldError::new(
                "page_timeout",
                format!(
                    "must be between {} and {} milliseconds",
                    PAGE_TIMEOUT_RANGE_MS.start(),
                    PAGE_TIMEOUT_RANGE_MS.end()
                ),
            ));
        }

        let namespace = self.namespace.trim();
        if namespace.is_empty() {
            errors.push(FieldError::new("namespace", "must not be empty"));
        } else if namespace.chars().count() > MAX_NAMESPACE_LEN {
            errors.push(FieldError::new(
                "namespace",
                format!("must be at most {} characters", MAX_NAMESPACE_LEN),
            ));
        }

        match (url, browser_type, wait_until) {
            (Some(url), Some(browser_type), Some(wait_until)) if errors.is_empty() => {
                Ok(CrawlConfig {
                    url,
                    max_depth: self.max_depth as u32,
                    max_pages: self.max_pages as u32,
                    browser_type,
                    wait_until,
                    exclude_external_links: self.exclude_external_links,
                    exclude_external_images: self.exclude_external_images,
                    word_count_threshold: self.word_count_threshold as u32,
                    page_timeout_ms: self.page_timeout as u32,
                    namespace: namespace.to_string(),
                })
            }
            _ => Err(CrawlError::Validation(errors)),
        }
    }
}

/// Parses a crawl target and rejects local or otherwise unsafe destinations.
fn check_url(raw: &str) -> Result<Url, String> {
    if raw.trim().is_empty() {
        return Err("is required".to_string());
    }
    let url = Url::parse(raw.trim()).map_err(|e| format!("is not a valid URL ({})", e))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err("must use http or https".to_string());
    }

    let host = url.host().ok_or_else(|| "must include a host".to_string())?;
    let blocked = match host {
        Host::Domain(domain) => BLOCKED_HOSTS.contains(&domain.to_ascii_lowercase().as_str()),
        Host::Ipv4(ip) => is_internal_ip(IpAddr::V4(ip)),
        Host::Ipv6(ip) => is_internal_ip(IpAddr::V6(ip)),
    };
    if blocked {
        return Err("must not point at a local or private address".to_string());
    }

    if let Some(port) = url.port() {
        if BLOCKED_PORTS.contains(&port) {
            return Err(format!("port {} is not allowed", port));
        }
    }

    Ok(url)
}

fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            // fc00::/7 unique-local and fe80::/10 link-local
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// A validated crawl configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawlConfig {
    pub url: Url,
    pub max_depth: u32,
    pub max_pages: u32,
    pub browser_type: BrowserType,
    pub wait_until: WaitUntil,
    pub exclude_external_links: bool,
    pub exclude_external_images: bool,
    pub word_count_threshold: u32,
    pub page_timeout_ms: u32,
    pub namespace: String,
}

/// One page result delivered by the crawl service.
///
/// The page is kept exactly as received, so relaying it re-emits the
/// upstream object field for field. The accessors read the fields this
/// service understands; only `url` is required.
#[derive(Debug, Clone, PartialEq)]
pub struct CrawledPage {
    fields: Map<String, Value>,
}

/// Keys the crawler has used for the extracted text, in preference order.
const TEXT_KEYS: &[&str] = &["markdown", "content", "text"];

impl CrawledPage {
    pub fn new(url: impl Into<String>, markdown: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("url".to_string(), Value::String(url.into()));
        fields.insert("markdown".to_string(), Value::String(markdown.into()));
        Self { fields }
    }

    /// Sets one field, replacing any previous value.
    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn url(&self) -> &str {
        self.str_field("url").unwrap_or_default()
    }

    pub fn title(&self) -> Option<&str> {
        self.str_field("title")
    }

    /// Extracted text: the first non-empty of `markdown`, `content`, `text`.
    pub fn text(&self) -> &str {
        TEXT_KEYS
            .iter()
            .filter_map(|key| self.str_field(key))
            .find(|text| !text.trim().is_empty())
            .unwrap_or_default()
    }

    pub fn depth(&self) -> Option<u32> {
        self.fields
            .get("depth")
            .and_then(Value::as_u64)
            .and_then(|d| u32::try_from(d).ok())
    }

    pub fn status_code(&self) -> Option<u16> {
        self.fields
            .get("status_code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
    }

    /// Seconds spent fetching and extracting the page.
    pub fn processing_time(&self) -> Option<f64> {
        self.fields.get("processing_time").and_then(Value::as_f64)
    }

    pub fn crawled_at(&self) -> Option<&str> {
        self.str_field("crawled_at")
    }

    pub fn internal_links(&self) -> &[Value] {
        self.list_field("internal_links")
    }

    pub fn external_links(&self) -> &[Value] {
        self.list_field("external_links")
    }

    pub fn images(&self) -> &[Value] {
        self.list_field("images")
    }

    /// Any field as received, including ones not modelled above.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    fn list_field(&self, key: &str) -> &[Value] {
        self.fields
            .get(key)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl Serialize for CrawledPage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CrawledPage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let fields = Map::<String, Value>::deserialize(deserializer)?;
        match fields.get("url") {
            Some(Value::String(_)) => Ok(Self { fields }),
            Some(_) => Err(D::Error::custom("page url must be a string")),
            None => Err(D::Error::missing_field("url")),
        }
    }
}

/// Lifecycle status of a crawl task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Paused,
    Completed,
    Error,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry snapshot of one crawl job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlTask {
    pub task_id: String,
    pub url: String,
    pub namespace: String,
    pub status: TaskStatus,
    pub pages_processed: u64,
    /// Unknown until the crawler has discovered enough of the site.
    pub pages_total: Option<u64>,
    pub current_url: Option<String>,
    pub pages_indexed: u64,
    pub ingestion_failures: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CrawlTask {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            url: String::new(),
            namespace: String::new(),
            status: TaskStatus::Running,
            pages_processed: 0,
            pages_total: None,
            current_url: None,
            pages_indexed: 0,
            ingestion_failures: 0,
            started_at: Utc::now(),
            ended_at: None,
            last_error: None,
        }
    }
}

/// Normalized document handed to the ingestion pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub title: String,
    /// `web` for crawled pages.
    pub source_type: String,
    pub source_url: Option<String>,
    pub namespace: String,
    pub content: String,
    pub metadata: Value,
    pub crawl_task_id: Option<String>,
    pub crawl_depth: Option<u32>,
}

/// Result of a successful ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedDocument {
    pub id: String,
    pub chunks: usize,
    /// True when an identical active document already existed in the namespace.
    pub deduplicated: bool,
}

/// A chunk of a document's text. `id` doubles as the vector-store key.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}
