use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::dedup::DetectorConfig;

/// A failure while constructing a cache, detector or registry entry.
///
/// All of these fail fast at construction time, not at first use.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cache id must not be empty")]
    MissingId,
    #[error("cache {0} has no resolver")]
    MissingResolver(String),
    #[error("cache {0} has a zero resolve bound")]
    InvalidResolveBound(String),
    #[error("cache id {0} is already registered")]
    DuplicateCache(String),
    #[error("invalid duplicate detector config: {0}")]
    InvalidDetector(String),
}

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Static construction parameters of one cache, as wired in from configuration.
///
/// The resolver and wrapper factories cannot come from a file; they are passed
/// to the [`CacheBuilder`](crate::caching::CacheBuilder) in code.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The logical cache id, unique across client and server.
    pub id: String,
    /// Whether operations must serialize through the engine lock.
    pub thread_safe: bool,
    /// At most one concurrent resolution per missing key.
    pub atomic_insertion: bool,
    /// Optional cap on concurrently in-flight resolutions across all keys.
    pub max_concurrent_resolves: Option<usize>,
    /// Whether the authoritative copy of this cache may live on a remote peer.
    pub shared: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            thread_safe: true,
            atomic_insertion: true,
            max_concurrent_resolves: None,
            shared: false,
        }
    }
}

/// The process-level configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,
    /// Duplicate request detector defaults.
    pub detector: DetectorConfig,
    /// Declarative cache construction entries.
    pub caches: Vec<CacheConfig>,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to open config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;

        for cache in &config.caches {
            if cache.id.is_empty() {
                return Err(ConfigError::MissingId.into());
            }
        }
        Ok(config)
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct V;

    impl de::Visitor<'_> for V {
        type Value = LevelFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a log level")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            v.parse().map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_str(V)
}
