//! Engine configuration loaded from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(BackendKind::Postgres),
            "memory" | "mem" => Ok(BackendKind::Memory),
            other => Err(Error::Config(format!("unknown backend `{other}`"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    pub backend: BackendKind,
    /// Postgres connection URLs, one per shard.
    pub shards: Vec<String>,
    /// Shard count for the memory backend.
    pub memory_shards: usize,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub chunk_window: Duration,
    pub max_indexes_per_chunk: usize,
    pub base_schema: String,
    pub slow_query_threshold: Duration,
    /// Deadline applied to every call through the engine.
    pub call_timeout: Option<Duration>,
    /// When set, expired ranges are archived here first.
    pub archive_dir: Option<PathBuf>,
    pub archive_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            shards: Vec::new(),
            memory_shards: 1,
            max_connections: 32,
            acquire_timeout: Duration::from_secs(5),
            chunk_window: Duration::from_secs(60 * 60),
            max_indexes_per_chunk: 64,
            base_schema: "public".into(),
            slow_query_threshold: Duration::from_millis(500),
            call_timeout: None,
            archive_dir: None,
            archive_window: Duration::from_secs(60 * 60),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}=`{value}` is not valid")))
}

impl EngineConfig {
    pub fn memory(shards: usize) -> Self {
        Self {
            backend: BackendKind::Memory,
            memory_shards: shards.max(1),
            ..Self::default()
        }
    }

    pub fn postgres(shards: Vec<String>) -> Self {
        Self {
            backend: BackendKind::Postgres,
            shards,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let shards = lookup("EVENTIDE_SHARDS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|urls| !urls.is_empty())
            .or_else(|| lookup("DATABASE_URL").map(|url| vec![url]));

        config.backend = match lookup("EVENTIDE_BACKEND") {
            Some(raw) => raw.parse()?,
            None if shards.is_some() => BackendKind::Postgres,
            None => BackendKind::Memory,
        };
        config.shards = shards.unwrap_or_default();

        if let Some(raw) = lookup("EVENTIDE_MEMORY_SHARDS") {
            config.memory_shards = parse_var::<usize>("EVENTIDE_MEMORY_SHARDS", &raw)?.max(1);
        }
        if let Some(raw) = lookup("EVENTIDE_MAX_CONNECTIONS") {
            config.max_connections = parse_var("EVENTIDE_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = lookup("EVENTIDE_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout =
                Duration::from_millis(parse_var("EVENTIDE_ACQUIRE_TIMEOUT_MS", &raw)?);
        }
        if let Some(raw) = lookup("EVENTIDE_CHUNK_WINDOW_MS") {
            config.chunk_window = Duration::from_millis(parse_var("EVENTIDE_CHUNK_WINDOW_MS", &raw)?);
        }
        if let Some(raw) = lookup("EVENTIDE_CALL_TIMEOUT_MS") {
            config.call_timeout = Some(Duration::from_millis(parse_var(
                "EVENTIDE_CALL_TIMEOUT_MS",
                &raw,
            )?));
        }
        if let Some(raw) = lookup("EVENTIDE_ARCHIVE_DIR") {
            config.archive_dir = Some(PathBuf::from(raw));
        }
        if let Some(raw) = lookup("EVENTIDE_ARCHIVE_WINDOW_MS") {
            config.archive_window =
                Duration::from_millis(parse_var("EVENTIDE_ARCHIVE_WINDOW_MS", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::Postgres && self.shards.is_empty() {
            return Err(Error::Config(
                "postgres backend needs EVENTIDE_SHARDS or DATABASE_URL".into(),
            ));
        }
        if self.chunk_window.is_zero() {
            return Err(Error::Config("chunk window must be positive".into()));
        }
        if self.archive_dir.is_some() {
            crate::archive::window_millis(self.archive_window)
                .map_err(|err| Error::Config(err.to_string()))?;
        }
        Ok(())
    }

    pub fn chunk_window_ms(&self) -> i64 {
        self.chunk_window.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_is_single_memory_shard() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.memory_shards, 1);
        assert_eq!(config.max_connections, 32);
    }

    #[test]
    fn database_url_implies_postgres() {
        let config =
            EngineConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://db/a")])).unwrap();
        assert_eq!(config.backend, BackendKind::Postgres);
        assert_eq!(config.shards, vec!["postgres://db/a"]);
    }

    #[test]
    fn shard_list_wins_over_database_url() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("EVENTIDE_SHARDS", "postgres://a, postgres://b"),
            ("DATABASE_URL", "postgres://c"),
            ("EVENTIDE_CALL_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.shards, vec!["postgres://a", "postgres://b"]);
        assert_eq!(config.call_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(EngineConfig::from_lookup(lookup(&[("EVENTIDE_BACKEND", "mysql")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("EVENTIDE_BACKEND", "postgres")])).is_err());
        assert!(
            EngineConfig::from_lookup(lookup(&[("EVENTIDE_MAX_CONNECTIONS", "lots")])).is_err()
        );
        assert!(
            EngineConfig::from_lookup(lookup(&[
                ("EVENTIDE_ARCHIVE_DIR", "/tmp/a"),
                ("EVENTIDE_ARCHIVE_WINDOW_MS", "1000"),
            ]))
            .is_err()
        );
    }
}
