//! # rag-crawl CLI
//!
//! ```bash
//! rag-crawl --config ./config/rag-crawl.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rag-crawl init` | Create the SQLite database and run schema migrations |
//! | `rag-crawl serve` | Start the HTTP server |
//! | `rag-crawl crawl <url>` | Run one crawl and index it locally |
//!
//! ```bash
//! # Crawl a docs site two levels deep into the "docs" namespace
//! rag-crawl crawl https://example.com/docs --namespace docs --max-depth 2
//!
//! # Machine-readable progress on stderr
//! rag-crawl crawl https://example.com --progress json 2> events.jsonl
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rag_crawl::models::CrawlRequest;
use rag_crawl::progress::ProgressMode;
use rag_crawl::{config, crawl_cmd, logging, migrate, server};

/// rag-crawl: crawl websites through an external crawl service and index
/// the pages for retrieval.
#[derive(Parser)]
#[command(name = "rag-crawl", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/rag-crawl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the documents, chunks and
    /// chunk_vectors tables. Running it multiple times is safe.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// Crawl a site and index every page into the local database.
    Crawl {
        /// Start URL (http or https).
        url: String,

        /// Namespace the pages are indexed under.
        #[arg(long, default_value = "default")]
        namespace: String,

        /// Maximum link depth (1-10).
        #[arg(long, default_value_t = 3)]
        max_depth: i64,

        /// Maximum number of pages (1-5000).
        #[arg(long, default_value_t = 50)]
        max_pages: i64,

        /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Crawl {
            url,
            namespace,
            max_depth,
            max_pages,
            progress,
        } => {
            let request = CrawlRequest {
                max_depth,
                max_pages,
                ..CrawlRequest::new(url, namespace)
            };
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            crawl_cmd::run_crawl(&cfg, request, mode).await?;
        }
    }

    Ok(())
}
