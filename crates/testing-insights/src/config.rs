use crate::context_engine::MemoryConfig;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    /// Analytics database queried by validated SQL
    pub database_url: String,
    pub long_term_db_path: PathBuf,
    /// Separate database holding the short-term window of open sessions
    pub short_term_checkpoint_path: PathBuf,
    pub short_term_capacity: usize,
    pub long_term_top_k: usize,
    pub query_row_limit: usize,
    pub query_timeout_seconds: u64,
    pub db_pool_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            database_url: get("DATABASE_URL", "sqlite:///./local.db"),
            long_term_db_path: PathBuf::from(get("LONG_TERM_DB_PATH", "./long_term_memory.sqlite")),
            short_term_checkpoint_path: PathBuf::from(get(
                "SHORT_TERM_CHECKPOINT_PATH",
                "./short_term_checkpoints.sqlite",
            )),
            short_term_capacity: parse_var(&get("SHORT_TERM_CAPACITY", "6"), "SHORT_TERM_CAPACITY")?,
            long_term_top_k: parse_var(&get("LONG_TERM_TOP_K", "5"), "LONG_TERM_TOP_K")?,
            query_row_limit: parse_var(&get("QUERY_ROW_LIMIT", "200"), "QUERY_ROW_LIMIT")?,
            query_timeout_seconds: parse_var(&get("QUERY_TIMEOUT_SECONDS", "30"), "QUERY_TIMEOUT_SECONDS")?,
            db_pool_size: parse_var(&get("DB_POOL_SIZE", "8"), "DB_POOL_SIZE")?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.short_term_capacity == 0 {
            anyhow::bail!("SHORT_TERM_CAPACITY must be at least 1");
        }
        if self.query_row_limit == 0 {
            anyhow::bail!("QUERY_ROW_LIMIT must be at least 1");
        }
        if self.query_timeout_seconds == 0 {
            anyhow::bail!("QUERY_TIMEOUT_SECONDS must be at least 1");
        }
        if self.db_pool_size == 0 {
            anyhow::bail!("DB_POOL_SIZE must be at least 1");
        }
        self.database_path()?;
        Ok(())
    }

    /// Filesystem path of the analytics database. Accepts `sqlite:///path`
    /// (relative), `sqlite:////path` (absolute) or a plain path.
    pub fn database_path(&self) -> Result<PathBuf> {
        let url = self.database_url.trim();
        let path = match url.strip_prefix("sqlite:///") {
            Some(rest) => rest,
            None if url.contains("://") => {
                anyhow::bail!("Unsupported DATABASE_URL scheme: {}", url)
            }
            None => url,
        };
        if path.is_empty() {
            anyhow::bail!("DATABASE_URL does not name a database file");
        }
        Ok(PathBuf::from(path))
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_seconds)
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            short_term_capacity: self.short_term_capacity,
            long_term_top_k: self.long_term_top_k,
        }
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- Database URL: {}", self.database_url);
        info!("- Long-term memory: {}", self.long_term_db_path.display());
        info!("- Short-term checkpoints: {}", self.short_term_checkpoint_path.display());
        info!("- Short-term capacity: {}", self.short_term_capacity);
        info!("- Long-term top K: {}", self.long_term_top_k);
        info!("- Query row limit: {}", self.query_row_limit);
        info!("- Query timeout: {}s", self.query_timeout_seconds);
        info!("- Pool size: {}", self.db_pool_size);
    }
}

fn parse_var<T>(raw: &str, key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("Invalid value for {}: {:?}", key, raw))
}
