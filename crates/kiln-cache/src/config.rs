use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::error::{CacheError, Result};
use crate::hash::HashAlgorithm;
use crate::retry::RetryPolicy;

/// Configuration handed over by the build integration, usually as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Root of the results cache.
    pub cache_dir: PathBuf,

    /// Reference cache root; defaults to `<cache_dir>/.refcache`.
    #[serde(default)]
    pub ref_cache_dir: Option<PathBuf>,

    /// File hash cache root; defaults to `<cache_dir>/.filehashcache`.
    #[serde(default)]
    pub file_hash_cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,

    /// Always compile, then check the result against (and write it to) the
    /// cache.
    #[serde(default)]
    pub verify_only: bool,

    /// Worker threads used for hashing and trimming. Defaults to the
    /// available parallelism.
    #[serde(default)]
    pub parallelism: Option<usize>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ref_cache_dir: None,
            file_hash_cache_dir: None,
            hash_algorithm: HashAlgorithm::default(),
            verify_only: false,
            parallelism: None,
            retry: RetryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|err| CacheError::json("cache configuration", err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| CacheError::io(path, err))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|err| CacheError::json(path.display().to_string(), err))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CacheError::invalid_config("`cache_dir` must not be empty"));
        }
        if self.parallelism == Some(0) {
            return Err(CacheError::invalid_config("`parallelism` must be at least 1"));
        }
        if self.retry.attempts == 0 {
            return Err(CacheError::invalid_config("`retry.attempts` must be at least 1"));
        }
        Ok(())
    }

    pub fn ref_cache_dir(&self) -> PathBuf {
        self.ref_cache_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join(".refcache"))
    }

    pub fn file_hash_cache_dir(&self) -> PathBuf {
        self.file_hash_cache_dir
            .clone()
            .unwrap_or_else(|| self.cache_dir.join(".filehashcache"))
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
            .filter(|threads| *threads > 0)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(NonZeroUsize::get)
                    .unwrap_or(1)
            })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry.attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_attempts")]
    pub attempts: u32,
    #[serde(default = "RetryConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl RetryConfig {
    fn default_attempts() -> u32 {
        5
    }

    fn default_base_delay_ms() -> u64 {
        50
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: Self::default_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A simple level (`info`, `debug`, ...) or an `EnvFilter` directive
    /// string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    /// The configured directives. Bare level names are lowercased and
    /// `warning` is accepted for `warn`.
    pub fn directives(&self) -> String {
        let level = self.level.trim();
        if level.is_empty() {
            return Self::default_level();
        }
        if level.eq_ignore_ascii_case("warning") {
            return "warn".to_owned();
        }
        let named_level = level.bytes().all(|b| b.is_ascii_alphabetic());
        match level.parse::<tracing::Level>() {
            Ok(parsed) if named_level => parsed.to_string().to_ascii_lowercase(),
            _ => level.to_owned(),
        }
    }

    /// The effective filter. `RUST_LOG` directives are layered over the
    /// configured ones; if the combination does not parse, `RUST_LOG` alone
    /// is tried, then the configuration alone, then `info`.
    pub fn env_filter(&self) -> EnvFilter {
        let configured = self.directives();
        let from_env = std::env::var(EnvFilter::DEFAULT_ENV)
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());
        let mut candidates = Vec::with_capacity(3);
        if let Some(from_env) = from_env {
            candidates.push(format!("{configured},{from_env}"));
            candidates.push(from_env);
        }
        candidates.push(configured);
        candidates
            .into_iter()
            .find_map(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::default().add_directive(LevelFilter::INFO.into()))
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn minimal_json_uses_defaults() {
        let config = CacheConfig::from_json_str(r#"{ "cache_dir": "/tmp/kiln" }"#).unwrap();
        assert_eq!(config, CacheConfig::new("/tmp/kiln"));
        assert_eq!(config.ref_cache_dir(), Path::new("/tmp/kiln/.refcache"));
        assert_eq!(config.file_hash_cache_dir(), Path::new("/tmp/kiln/.filehashcache"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.parallelism() >= 1);
    }

    #[test]
    fn full_json_round_trips() {
        let text = r#"{
            "cache_dir": "c",
            "ref_cache_dir": "r",
            "file_hash_cache_dir": "f",
            "hash_algorithm": "sha256",
            "verify_only": true,
            "parallelism": 3,
            "retry": { "attempts": 2, "base_delay_ms": 5 },
            "logging": { "level": "debug", "json": true }
        }"#;
        let config = CacheConfig::from_json_str(text).unwrap();
        assert_eq!(config.hash_algorithm, HashAlgorithm::Sha256);
        assert!(config.verify_only);
        assert_eq!(config.parallelism(), 3);
        assert_eq!(config.ref_cache_dir(), Path::new("r"));
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(5));
        assert!(config.logging.json);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "cache_dir": "c", "cache_size": 1 }"#),
            Err(CacheError::Json { .. })
        ));
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "cache_dir": "" }"#),
            Err(CacheError::InvalidConfig { .. })
        ));
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "cache_dir": "c", "parallelism": 0 }"#),
            Err(CacheError::InvalidConfig { .. })
        ));
        assert!(matches!(
            CacheConfig::from_json_str(r#"{ "cache_dir": "c", "retry": { "attempts": 0 } }"#),
            Err(CacheError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn level_names_are_normalized() {
        let directives = |level: &str| {
            LoggingConfig {
                level: level.to_owned(),
                json: false,
            }
            .directives()
        };
        assert_eq!(directives(" WARNING "), "warn");
        assert_eq!(directives("Debug"), "debug");
        assert_eq!(directives(""), "info");
        assert_eq!(directives("kiln.cache=trace"), "kiln.cache=trace");
    }
}
