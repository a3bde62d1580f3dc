//! `rag-crawl crawl`: run one crawl in-process and index into the local database.

use anyhow::{bail, Result};
use futures::StreamExt;

use crate::config::Config;
use crate::events::CrawlEvent;
use crate::models::CrawlRequest;
use crate::progress::ProgressMode;
use crate::relay::CrawlRelay;
use crate::{db, migrate};

pub async fn run_crawl(config: &Config, request: CrawlRequest, progress: ProgressMode) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let relay = CrawlRelay::from_config(config, pool.clone())?;
    let reporter = progress.reporter();

    let mut events = relay.start(&request).await?;
    let mut task_id = None;
    let mut outcome = None;

    while let Some(event) = events.next().await {
        reporter.report(&event);
        match &event {
            CrawlEvent::Started { task_id: id, .. } => task_id = Some(id.clone()),
            CrawlEvent::Completed { summary, .. } => outcome = Some(Ok(summary.clone())),
            CrawlEvent::Error { .. } if event.is_fatal() => {
                outcome = event.error_message().map(|m| Err(m.to_string()))
            }
            _ => {}
        }
    }

    pool.close().await;

    println!("crawl {}", request.url);
    if let Some(id) = &task_id {
        println!("  task: {}", id);
    }
    match outcome {
        Some(Ok(summary)) => {
            println!("  namespace: {}", request.namespace);
            println!("  pages: {}", summary.pages);
            println!("  indexed: {}", summary.indexed.unwrap_or(0));
            println!("  failures: {}", summary.failures);
            println!("ok");
            Ok(())
        }
        Some(Err(message)) => bail!("crawl failed: {}", message),
        None => bail!("crawl ended without a completion event"),
    }
}
