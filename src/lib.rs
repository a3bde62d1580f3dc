//! # rag-crawl
//!
//! Crawl-task orchestration for a document-indexing service.
//!
//! A caller submits a crawl request; the relay forwards it to an external
//! crawl service, consumes that service's event stream, indexes every crawled
//! page into SQLite and re-emits each event to the caller unchanged.
//! Running crawls can be paused, resumed and stopped while they stream.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────┐  lines  ┌──────────┐  events  ┌──────────┐
//! caller ──HTTP──▶│    relay     │◀────────│  client  │◀──SSE────│  crawl   │
//!        ◀──SSE───│ (per task)   │         └──────────┘          │ service  │
//!                 └──┬────────┬──┘                               └──────────┘
//!                    │        │ page_complete
//!                    ▼        ▼
//!             ┌──────────┐ ┌────────────────────────┐
//!             │ registry │ │ ingest: chunk + embed  │──▶ SQLite
//!             └──────────┘ └────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | tracing subscriber setup |
//! | [`error`] | Crawl error taxonomy |
//! | [`models`] | Requests, pages, tasks, documents |
//! | [`events`] | Crawl event envelope and stream parser |
//! | [`client`] | External crawl service client |
//! | [`registry`] | In-process task registry |
//! | [`relay`] | Per-task relay state machine |
//! | [`ingest`] | Page → document ingestion pipeline |
//! | [`chunk`] | Content cleaning and chunking |
//! | [`embedding`] | Embedding providers |
//! | [`documents`] | Document queries |
//! | [`progress`] | CLI progress reporting |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod client;
pub mod config;
pub mod crawl_cmd;
pub mod db;
pub mod documents;
pub mod embedding;
pub mod error;
pub mod events;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod registry;
pub mod relay;
pub mod server;
