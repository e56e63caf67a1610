//! Explicit construction of the whole stack: backends, router and pipeline.

use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{BoxFuture, try_join_all};
use tracing::info;

use crate::archive::Archiver;
use crate::config::EngineConfig;
use crate::memory::MemoryEvents;
use crate::metrics::Metrics;
use crate::pipeline::{self, Pipeline};
use crate::router::{Shard, ShardRouter, ShardedEvents};
use crate::store::{EventStore, StoreBuilder};
use crate::{Error, Result, WithContext};

type BackendFactory = for<'a> fn(&'a EngineConfig, &'a Arc<Metrics>) -> BoxFuture<'a, Result<Vec<Shard>>>;

/// Named backends resolved at startup.
static BACKENDS: &[(&str, BackendFactory)] = &[("postgres", open_postgres), ("memory", open_memory)];

pub fn backend_names() -> Vec<&'static str> {
    BACKENDS.iter().map(|(name, _)| *name).collect()
}

fn backend(name: &str) -> Result<BackendFactory> {
    BACKENDS
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, factory)| *factory)
        .ok_or_else(|| Error::Config(format!("no backend registered as `{name}`")))
}

/// Shard name for a connection URL, without credentials or parameters.
fn shard_name(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let rest = rest.rsplit_once('@').map_or(rest, |(_, host)| host);
    rest.split('?').next().unwrap_or(rest).to_string()
}

fn open_postgres<'a>(config: &'a EngineConfig, metrics: &'a Arc<Metrics>) -> BoxFuture<'a, Result<Vec<Shard>>> {
    Box::pin(async move {
        try_join_all(config.shards.iter().map(|url| async move {
            let name = shard_name(url);
            let store = StoreBuilder::new(url.as_str())
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .chunk_window(config.chunk_window)
                .max_indexes_per_chunk(config.max_indexes_per_chunk)
                .base_schema(config.base_schema.clone())
                .slow_query_threshold(config.slow_query_threshold)
                .metrics(metrics.clone())
                .build()
                .await
                .context(format!("open shard `{name}`"))?;
            Ok::<_, Error>(Shard::new(name, Arc::new(store)))
        }))
        .await
    })
}

fn open_memory<'a>(config: &'a EngineConfig, metrics: &'a Arc<Metrics>) -> BoxFuture<'a, Result<Vec<Shard>>> {
    Box::pin(async move {
        Ok((0..config.memory_shards.max(1))
            .map(|i| {
                let store = MemoryEvents::with_metrics(config.chunk_window_ms(), metrics.clone());
                Shard::new(format!("memory-{i}"), Arc::new(store))
            })
            .collect())
    })
}

pub struct Engine {
    events: Arc<dyn EventStore>,
    router: Arc<ShardRouter>,
    metrics: Arc<Metrics>,
    config: EngineConfig,
}

impl Engine {
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let metrics = Arc::new(Metrics::new());
        let open_backend = backend(config.backend.as_str())?;
        let shards = open_backend(&config, &metrics).await?;
        Self::with_shards(config, shards, metrics).await
    }

    /// Assemble an engine over shards built elsewhere.
    pub async fn with_shards(config: EngineConfig, shards: Vec<Shard>, metrics: Arc<Metrics>) -> Result<Self> {
        let router = Arc::new(ShardRouter::new(shards, metrics.clone())?);
        router.rebuild().await?;

        let pipeline = Self::pipeline(&config, &metrics);
        let events = pipeline.apply(Arc::new(ShardedEvents::new(router.clone())));
        info!(
            backend = %config.backend,
            shards = router.shards().len(),
            stages = ?pipeline.names(),
            "engine ready"
        );
        Ok(Self {
            events,
            router,
            metrics,
            config,
        })
    }

    fn pipeline(config: &EngineConfig, metrics: &Arc<Metrics>) -> Pipeline {
        let mut pipeline = Pipeline::new();
        if let Some(dir) = &config.archive_dir {
            pipeline = pipeline.stage(
                "archiving",
                pipeline::archiving(dir.clone(), config.archive_window, metrics.clone()),
            );
        }
        if let Some(timeout) = config.call_timeout {
            pipeline = pipeline.stage("deadline", pipeline::deadline(timeout));
        }
        pipeline.stage("traced", pipeline::traced(metrics.clone()))
    }

    pub fn events(&self) -> Arc<dyn EventStore> {
        self.events.clone()
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Archiver over this engine's event path, writing into `dir`.
    pub fn archiver(&self, dir: impl Into<PathBuf>) -> Archiver {
        Archiver::new(self.events.clone(), dir).with_metrics(self.metrics.clone())
    }
}
