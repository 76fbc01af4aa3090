//! Process configuration, assembled from the environment (optionally via a
//! `.env` file). Unknown env is ignored. See SPEC_FULL.md §6.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub poll_interval: Duration,
    pub max_parallel: usize,
    pub drain_timeout: Duration,
    pub eviction_interval: Duration,
    pub build_ttl: Duration,
    pub output_dir: PathBuf,
    pub cache_registry: Option<String>,
    pub cache_mode: CacheMode,
}

impl Config {
    /// Reads configuration from the environment, defaulting anything
    /// unset. Call `dotenvy::dotenv().ok()` before this in `main` to pick
    /// up a `.env` file.
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BIND_ADDR", "127.0.0.1:3000"),
            poll_interval: Duration::from_millis(env_parse_or("POLL_INTERVAL_MS", 250)),
            max_parallel: env_parse_or("MAX_PARALLEL", 8),
            drain_timeout: Duration::from_secs(env_parse_or("DRAIN_TIMEOUT_SECS", 30)),
            eviction_interval: Duration::from_secs(env_parse_or("EVICTION_INTERVAL_SECS", 60)),
            build_ttl: Duration::from_secs(env_parse_or("BUILD_TTL_SECS", 3600)),
            output_dir: PathBuf::from(env_or("OUTPUT_DIR", "./build-output")),
            cache_registry: std::env::var("CACHE_REGISTRY").ok(),
            cache_mode: match std::env::var("CACHE_MODE").as_deref() {
                Ok("max") => CacheMode::Max,
                _ => CacheMode::Min,
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
