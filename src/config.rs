//! Process configuration from the environment.
//!
//! A `.env` file is honored if present. Settings:
//!
//! - `LINEMAP_STORAGE` — directory holding the git object stores to
//!   register; empty means the process starts with no repositories.
//! - `LINEMAP_CACHE` — cache backend: `memory` (default) or a URL for a
//!   networked store, handed to the serving layer to construct.
//! - `RUST_LOG` — the usual tracing filter, e.g. `linemap=debug`.

use std::env;
use std::path::PathBuf;

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Cache backend selection, parsed from `LINEMAP_CACHE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheBackend {
    /// In-process [`crate::cache::MemoryCache`].
    Memory,
    /// A networked key/value store at this URL; construction is the
    /// serving layer's job.
    Remote(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the repositories to serve, if any.
    pub storage: Option<PathBuf>,
    pub cache: CacheBackend,
}

impl Config {
    /// Reads configuration from the environment, loading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let storage = match env::var("LINEMAP_STORAGE") {
            Ok(value) if !value.is_empty() => Some(PathBuf::from(value)),
            _ => None,
        };

        let cache = match env::var("LINEMAP_CACHE") {
            Err(_) => CacheBackend::Memory,
            Ok(value) => value.parse()?,
        };

        Ok(Config { storage, cache })
    }
}

impl std::str::FromStr for CacheBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "memory" => Ok(CacheBackend::Memory),
            url if url.contains("://") => Ok(CacheBackend::Remote(url.to_string())),
            other => Err(Error::invalid(format!(
                "invalid cache backend '{other}': expected 'memory' or a URL"
            ))),
        }
    }
}

/// Installs the global tracing subscriber, filtered by `RUST_LOG` and
/// defaulting to `info`. Call once at startup; tests skip it.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_backend_parsing() {
        assert_eq!("memory".parse::<CacheBackend>().unwrap(), CacheBackend::Memory);
        assert_eq!("".parse::<CacheBackend>().unwrap(), CacheBackend::Memory);
        assert_eq!(
            "redis://localhost:6379".parse::<CacheBackend>().unwrap(),
            CacheBackend::Remote("redis://localhost:6379".to_string())
        );
        assert!("garbage".parse::<CacheBackend>().is_err());
    }
}
