//! Crawl progress reporting for `rag-crawl crawl`.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! The JSON reporter writes each relayed [`CrawlEvent`] as one line, in the
//! same envelope the HTTP endpoint streams.

use std::io::Write;

use crate::events::CrawlEvent;

/// Reports crawl progress. Implementations write to stderr (human or JSON).
pub trait CrawlProgressReporter: Send + Sync {
    fn report(&self, event: &CrawlEvent);
}

/// Human-friendly progress on stderr: "crawl  progress  12 / 50 pages  https://…".
pub struct StderrProgress;

impl CrawlProgressReporter for StderrProgress {
    fn report(&self, event: &CrawlEvent) {
        let line = format_human(event);
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr, "{}", line);
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON event per line on stderr.
pub struct JsonProgress;

impl CrawlProgressReporter for JsonProgress {
    fn report(&self, event: &CrawlEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl CrawlProgressReporter for NoProgress {
    fn report(&self, _event: &CrawlEvent) {}
}

fn format_human(event: &CrawlEvent) -> String {
    match event {
        CrawlEvent::Started { task_id, url, .. } => format!(
            "crawl  started   task {}  {}",
            task_id,
            url.as_deref().unwrap_or("")
        )
        .trim_end()
        .to_string(),
        CrawlEvent::Progress {
            processed,
            total,
            current_url,
            ..
        } => {
            let total = total
                .filter(|t| *t > 0)
                .map(format_number)
                .unwrap_or_else(|| "?".to_string());
            format!(
                "crawl  progress  {} / {} pages  {}",
                format_number(processed.unwrap_or(0)),
                total,
                current_url.as_deref().unwrap_or("")
            )
            .trim_end()
            .to_string()
        }
        CrawlEvent::PageComplete { page, .. } => match page.depth() {
            Some(depth) => format!("crawl  page      {}  (depth {})", page.url(), depth),
            None => format!("crawl  page      {}", page.url()),
        },
        CrawlEvent::Error { url, .. } => {
            let label = if event.is_fatal() { "FAILED  " } else { "error   " };
            let message = event.error_message().unwrap_or_default();
            match url {
                Some(url) => format!("crawl  {}  {}: {}", label, url, message),
                None => format!("crawl  {}  {}", label, message),
            }
        }
        CrawlEvent::Completed { summary, .. } => format!(
            "crawl  complete  {} pages, {} indexed, {} failures",
            format_number(summary.pages),
            format_number(summary.indexed.unwrap_or(0)),
            format_number(summary.failures)
        ),
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn CrawlProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CompletionSummary;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn unknown_total_shows_placeholder() {
        let line = format_human(&CrawlEvent::Progress {
            processed: Some(3),
            total: Some(0),
            current_url: None,
            extra: Default::default(),
        });
        assert_eq!(line, "crawl  progress  3 / ? pages");
    }

    #[test]
    fn completion_line_reports_failures_separately() {
        let line = format_human(&CrawlEvent::completed(CompletionSummary {
            pages: 2,
            failures: 1,
            indexed: Some(1),
            ..Default::default()
        }));
        assert_eq!(line, "crawl  complete  2 pages, 1 indexed, 1 failures");
    }

    #[test]
    fn fatal_errors_are_flagged() {
        let line = format_human(&CrawlEvent::fatal_error("connection reset"));
        assert!(line.contains("FAILED"));
        assert!(line.ends_with("connection reset"));
    }
}
