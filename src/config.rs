//! TOML configuration parsing.
//!
//! The configuration file is read once at startup. A handful of values can
//! be overridden from the environment (or a `.env` file loaded by the CLI):
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `CRAWL_API_URL` / `CRAWL4AI_API_URL` | `crawl.api_url` |
//! | `CRAWL_TIMEOUT_SECS` | `crawl.stall_timeout_secs` |

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub crawl: CrawlServiceConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

// 1024 chars / 200 chars overlap at ~4 chars per token.
fn default_max_tokens() -> usize {
    256
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// API base override for the OpenAI or Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Connection settings for the external crawl service.
#[derive(Debug, Deserialize, Clone)]
pub struct CrawlServiceConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Timeout for request/response control calls (stop, pause, status, ...).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// A stream that delivers nothing for this long is considered stalled.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    /// Consecutive corrupt event lines tolerated before the stream is abandoned.
    #[serde(default = "default_max_malformed")]
    pub max_malformed_events: usize,
    /// How long finished tasks stay queryable in the task registry.
    #[serde(default = "default_retention")]
    pub finished_retention_secs: u64,
}

impl Default for CrawlServiceConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            max_malformed_events: default_max_malformed(),
            finished_retention_secs: default_retention(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:11235/api/v1".to_string()
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_stall_timeout() -> u64 {
    300
}
fn default_max_malformed() -> usize {
    10
}
fn default_retention() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Log filter settings. `RUST_LOG` takes precedence when set.
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub default: String,
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: BTreeMap::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config)?;
    validate(&config)?;

    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<()> {
    if let Some(url) = std::env::var("CRAWL_API_URL")
        .ok()
        .or_else(|| std::env::var("CRAWL4AI_API_URL").ok())
    {
        config.crawl.api_url = url;
    }

    if let Ok(secs) = std::env::var("CRAWL_TIMEOUT_SECS") {
        config.crawl.stall_timeout_secs = secs
            .parse()
            .with_context(|| format!("CRAWL_TIMEOUT_SECS is not a number: '{}'", secs))?;
    }

    Ok(())
}

/// Checks cross-field invariants that serde defaults cannot express.
pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }

    // Validate crawl service
    let api_url = url::Url::parse(&config.crawl.api_url)
        .with_context(|| format!("crawl.api_url is not a valid URL: '{}'", config.crawl.api_url))?;
    if !matches!(api_url.scheme(), "http" | "https") {
        anyhow::bail!("crawl.api_url must use http or https");
    }
    if config.crawl.stall_timeout_secs == 0 {
        anyhow::bail!("crawl.stall_timeout_secs must be > 0");
    }
    if config.crawl.max_malformed_events == 0 {
        anyhow::bail!("crawl.max_malformed_events must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }

    Ok(())
}
